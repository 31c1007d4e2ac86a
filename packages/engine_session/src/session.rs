use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::manager::{EngineEvent, SessionId};
use crate::markers::{EngineFamily, Marker, MarkerProfile};
use crate::queue::OutputQueue;
use crate::state::EngineState;

/// How long a process gets after SIGTERM before it is killed outright
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Configuration for spawning an engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub profile: MarkerProfile,
    /// Time the engine gets to honour the quit command
    pub shutdown_grace: Duration,
    /// Longest a single command write may block on a full input pipe
    pub write_timeout: Duration,
    /// Output lines kept before the oldest are dropped
    pub queue_high_water: usize,
    /// Longer output lines are truncated
    pub max_line_len: usize,
    pub event_capacity: usize,
}

impl EngineConfig {
    /// Defaults for `family`, running `program`
    pub fn for_family(family: EngineFamily, program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            profile: family.profile(),
            ..Default::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: EngineFamily::Eleeye.as_str().to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            profile: EngineFamily::Eleeye.profile(),
            shutdown_grace: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            queue_high_water: 1024,
            max_line_len: 4096,
            event_capacity: 256,
        }
    }
}

struct SessionStatus {
    state: EngineState,
    pending_commands: usize,
}

/// State shared between the manager, callers and the reader task of one session
pub(crate) struct SessionCore {
    pub(crate) id: SessionId,
    status: Mutex<SessionStatus>,
    pub(crate) queue: OutputQueue,
    profile: MarkerProfile,
    max_line_len: usize,
    write_timeout: Duration,
    writer: tokio::sync::Mutex<Option<ChildStdin>>,
    pid: Mutex<Option<u32>>,
    reader_active: AtomicBool,
    events: broadcast::Sender<EngineEvent>,
}

impl SessionCore {
    pub(crate) fn new(
        id: SessionId,
        config: &EngineConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            id,
            status: Mutex::new(SessionStatus {
                state: EngineState::Uninitialized,
                pending_commands: 0,
            }),
            queue: OutputQueue::new(config.queue_high_water),
            profile: config.profile.clone(),
            max_line_len: config.max_line_len,
            write_timeout: config.write_timeout,
            writer: tokio::sync::Mutex::new(None),
            pid: Mutex::new(None),
            reader_active: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        self.status.lock().state
    }

    pub(crate) fn pending_commands(&self) -> usize {
        self.status.lock().pending_commands
    }

    pub(crate) fn profile(&self) -> &MarkerProfile {
        &self.profile
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    pub(crate) fn reader_active(&self) -> bool {
        self.reader_active.load(Ordering::SeqCst)
    }

    pub(crate) fn transition(&self, to: EngineState) {
        let from = {
            let mut status = self.status.lock();
            std::mem::replace(&mut status.state, to)
        };
        self.announce(from, to);
    }

    /// Move to Failed unless the session is already on its way out
    pub(crate) fn fail(&self, reason: &str) {
        let from = {
            let mut status = self.status.lock();
            match status.state {
                EngineState::ShuttingDown | EngineState::Terminated | EngineState::Failed => {
                    return;
                }
                from => {
                    status.state = EngineState::Failed;
                    from
                }
            }
        };
        warn!("Engine {} failed: {}", self.id, reason);
        self.announce(from, EngineState::Failed);
    }

    fn announce(&self, from: EngineState, to: EngineState) {
        if from != to {
            debug!("Engine {} state {} -> {}", self.id, from, to);
            let _ = self.events.send(EngineEvent::StateChanged {
                id: self.id,
                state: to,
            });
        }
    }

    /// Validate and account for a caller command before it is written.
    ///
    /// A think command flips Ready -> Thinking here, ahead of the write, so a
    /// reply that arrives before `send` returns is never missed.
    pub(crate) fn begin_command(&self, command: &str) -> Result<(), EngineError> {
        let transition = {
            let mut status = self.status.lock();
            match status.state {
                EngineState::Ready | EngineState::Thinking => {}
                EngineState::Failed => return Err(EngineError::Failed),
                _ => return Err(EngineError::NotRunning),
            }
            status.pending_commands += 1;
            if status.state == EngineState::Ready && self.profile.is_think_command(command) {
                status.state = EngineState::Thinking;
                Some((EngineState::Ready, EngineState::Thinking))
            } else {
                None
            }
        };
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
        Ok(())
    }

    pub(crate) async fn install_writer(&self, stdin: ChildStdin) {
        *self.writer.lock().await = Some(stdin);
    }

    /// Close the engine's input stream
    pub(crate) async fn close_writer(&self) {
        if let Some(mut stdin) = self.writer.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Write one line atomically. A write error fails the session.
    ///
    /// Waiting for the writer and the write itself are each bounded by
    /// `write_timeout`; an engine that stops draining its input fails the
    /// session instead of stalling the caller.
    pub(crate) async fn write_line(&self, text: &str) -> Result<(), EngineError> {
        let Ok(mut writer) = tokio::time::timeout(self.write_timeout, self.writer.lock()).await
        else {
            self.fail("engine input blocked by an earlier write");
            return Err(EngineError::IoFailure(format!(
                "engine input still blocked after {:?}",
                self.write_timeout
            )));
        };
        let stdin = writer.as_mut().ok_or(EngineError::NotRunning)?;

        let mut framed = String::with_capacity(text.len() + 1);
        framed.push_str(text);
        framed.push('\n');

        let write = async {
            stdin.write_all(framed.as_bytes()).await?;
            stdin.flush().await
        };
        let result = match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("engine stopped reading its input for {:?}", self.write_timeout),
            )),
        };

        match result {
            Ok(()) => {
                debug!("Engine {} >>> {}", self.id, text);
                Ok(())
            }
            Err(e) => {
                writer.take();
                drop(writer);
                self.fail(&format!("write failed: {}", e));
                Err(EngineError::IoFailure(e.to_string()))
            }
        }
    }

    /// Queue an output line and apply any state transition it implies
    pub(crate) fn observe(&self, mut line: String) {
        if line.len() > self.max_line_len {
            let mut cut = self.max_line_len;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            warn!(
                "Engine {} emitted a {} byte line, truncating to {}",
                self.id,
                line.len(),
                cut
            );
            line.truncate(cut);
        }

        debug!("Engine {} <<< {}", self.id, line);
        let marker = self.profile.classify(&line);
        self.queue.push(line.clone());

        let transition = marker.and_then(|marker| {
            let mut status = self.status.lock();
            let from = status.state;
            let to = match (marker, from) {
                (Marker::Ready, EngineState::Starting | EngineState::Thinking) => {
                    status.pending_commands = 0;
                    EngineState::Ready
                }
                (Marker::Ready, EngineState::Ready) => {
                    status.pending_commands = 0;
                    return None;
                }
                (Marker::ThinkingStarted, EngineState::Ready) => EngineState::Thinking,
                (Marker::ThinkingDone, EngineState::Thinking | EngineState::Ready) => {
                    status.pending_commands = status.pending_commands.saturating_sub(1);
                    EngineState::Ready
                }
                _ => return None,
            };
            status.state = to;
            Some((from, to))
        });

        let _ = self.events.send(EngineEvent::Output {
            id: self.id,
            line,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }
}

/// Outcome of terminating an engine process
pub(crate) struct TerminationReport {
    pub(crate) status: Option<ExitStatus>,
    pub(crate) timed_out: bool,
}

/// A running engine process and its background tasks
pub(crate) struct EngineProcess {
    child: Child,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl EngineProcess {
    /// Spawn the engine and start draining its output into `core`
    pub(crate) async fn spawn(
        config: &EngineConfig,
        core: Arc<SessionCore>,
    ) -> Result<Self, EngineError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            info!("Setting engine working directory: {}", dir);
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning engine {}: {} with args: {:?}",
            core.id, config.program, config.args
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn engine '{}': {}", config.program, e);
            EngineError::SpawnFailure {
                program: config.program.clone(),
                reason: e.to_string(),
            }
        })?;

        let pid = child.id();
        *core.pid.lock() = pid;
        info!("Engine {} started with PID: {:?}", core.id, pid);

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(EngineError::IoFailure(
                    "engine standard streams unavailable".to_string(),
                ));
            }
        };
        core.install_writer(stdin).await;

        let cancel = CancellationToken::new();

        core.reader_active.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_output(core.clone(), stdout, cancel.clone()));

        let stderr = child.stderr.take().map(|stderr| {
            let id = core.id;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = lines.next_line() => match next {
                            Ok(Some(line)) => debug!("Engine {} stderr: {}", id, line),
                            _ => break,
                        },
                    }
                }
            })
        });

        Ok(Self {
            child,
            cancel,
            reader: Some(reader),
            stderr,
        })
    }

    /// Ask the engine to quit, escalate to signals after `grace`, then stop
    /// the background tasks.
    pub(crate) async fn terminate(
        mut self,
        core: &SessionCore,
        quit_command: Option<&str>,
        grace: Duration,
    ) -> TerminationReport {
        // The whole grace period covers the quit handoff and the exit; a
        // writer stuck on a full pipe must not hold termination back.
        let deadline = tokio::time::Instant::now() + grace;
        let handoff = async {
            if let Some(quit) = quit_command {
                if let Err(e) = core.write_line(quit).await {
                    debug!("Engine {} did not accept quit command: {}", core.id, e);
                }
            }
            core.close_writer().await;
        };
        if tokio::time::timeout_at(deadline, handoff).await.is_err() {
            warn!("Engine {} input blocked, skipping quit command", core.id);
        }

        let mut timed_out = false;
        let status = match tokio::time::timeout_at(deadline, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Failed to wait for engine {}: {}", core.id, e);
                self.force_kill(core).await
            }
            Err(_) => {
                warn!(
                    "Engine {} still running after {:?}, terminating",
                    core.id, grace
                );
                timed_out = true;
                self.force_kill(core).await
            }
        };
        info!("Engine {} exited with status: {:?}", core.id, status);

        self.stop_tasks().await;

        TerminationReport { status, timed_out }
    }

    async fn force_kill(&mut self, core: &SessionCore) -> Option<ExitStatus> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = core.pid() {
                match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) => {
                        if let Ok(Ok(status)) =
                            tokio::time::timeout(TERM_GRACE, self.child.wait()).await
                        {
                            return Some(status);
                        }
                    }
                    Err(e) => debug!("SIGTERM to engine {} failed: {}", core.id, e),
                }
            }
        }

        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill engine {}: {}", core.id, e);
        }
        self.child.try_wait().ok().flatten()
    }

    async fn stop_tasks(&mut self) {
        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        if let Some(stderr) = self.stderr.take() {
            let _ = stderr.await;
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read one `\n`-terminated line, keeping at most `limit` bytes of it in
/// `buf` and discarding the rest. Returns the full line length without the
/// terminator, or `None` at end of stream.
async fn read_capped_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<Option<usize>>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((total > 0).then_some(total));
        }
        let newline = available.iter().position(|&b| b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        total += chunk.len();
        let used = chunk.len() + usize::from(newline.is_some());
        reader.consume(used);
        if newline.is_some() {
            return Ok(Some(total));
        }
    }
}

async fn read_output<R>(core: Arc<SessionCore>, stdout: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let limit = core.max_line_len;
    let mut buf = Vec::with_capacity(256.min(limit));

    loop {
        buf.clear();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Engine {} reader cancelled", core.id);
                break;
            }
            read = read_capped_line(&mut reader, &mut buf, limit) => match read {
                Ok(None) => {
                    core.fail("engine closed its output stream");
                    break;
                }
                Ok(Some(len)) => {
                    if len > limit {
                        warn!(
                            "Engine {} emitted a {} byte line, truncating to {}",
                            core.id, len, limit
                        );
                        // Drop a multi-byte character split by the cut
                        if let Err(e) = std::str::from_utf8(&buf) {
                            if e.error_len().is_none() {
                                buf.truncate(e.valid_up_to());
                            }
                        }
                    }
                    while matches!(buf.last(), Some(b'\r')) {
                        buf.pop();
                    }
                    core.observe(String::from_utf8_lossy(&buf).into_owned());
                }
                Err(e) => {
                    core.fail(&format!("error reading engine output: {}", e));
                    break;
                }
            },
        }
    }

    core.reader_active.store(false, Ordering::SeqCst);
    info!("Engine {} reader exiting", core.id);
}
