use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::warn;

/// FIFO of engine output lines shared between the reader task and callers.
///
/// Bounded by a high-water mark: once full, the oldest line is dropped so a
/// caller that stops polling never stalls the engine.
pub struct OutputQueue {
    inner: Mutex<QueueInner>,
    high_water: usize,
}

struct QueueInner {
    lines: VecDeque<String>,
    dropped: u64,
}

impl OutputQueue {
    pub fn new(high_water: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                lines: VecDeque::new(),
                dropped: 0,
            }),
            high_water: high_water.max(1),
        }
    }

    /// Append a line, evicting the oldest ones beyond the high-water mark
    pub fn push(&self, line: String) {
        let mut inner = self.inner.lock();
        inner.lines.push_back(line);
        while inner.lines.len() > self.high_water {
            if let Some(evicted) = inner.lines.pop_front() {
                inner.dropped += 1;
                warn!(
                    "Output queue above {} lines, dropped oldest line: {:?} ({} dropped so far)",
                    self.high_water, evicted, inner.dropped
                );
            }
        }
    }

    /// Pop the oldest line without blocking
    pub fn pop(&self) -> Option<String> {
        self.inner.lock().lines.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }

    /// Lines evicted since the queue was created
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}
