use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::markers::MarkerProfile;
use crate::session::{EngineConfig, EngineProcess, SessionCore};
use crate::state::EngineState;

/// Deepest search the engines accept
pub const MAX_SEARCH_DEPTH: u32 = 64;

/// Unique identifier for an engine session
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Events emitted by a managed engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Session moved to a new state
    StateChanged { id: SessionId, state: EngineState },
    /// Line read from the engine (also queued for `read`)
    Output {
        id: SessionId,
        line: String,
        timestamp: i64,
    },
}

/// Owns at most one engine session at a time.
///
/// Every method takes `&self`; the manager can be shared behind an `Arc` and
/// polled from several tasks. `startup` and `shutdown` are serialized with
/// each other, `read` and the state queries never wait on the engine.
pub struct EngineManager {
    config: EngineConfig,
    next_id: AtomicU64,
    current: Mutex<Arc<SessionCore>>,
    process: tokio::sync::Mutex<Option<EngineProcess>>,
    search_depth: AtomicU32,
    last_exit: Mutex<Option<ExitStatus>>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl EngineManager {
    pub fn new(config: EngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let idle = Arc::new(SessionCore::new(SessionId(0), &config, event_tx.clone()));
        Self {
            config,
            next_id: AtomicU64::new(1),
            current: Mutex::new(idle),
            process: tokio::sync::Mutex::new(None),
            search_depth: AtomicU32::new(0),
            last_exit: Mutex::new(None),
            event_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn current(&self) -> Arc<SessionCore> {
        self.current.lock().clone()
    }

    /// Spawn the engine, start the reader and send the handshake.
    ///
    /// The session stays `Starting` until the engine prints a readiness marker.
    pub async fn startup(&self) -> Result<SessionId, EngineError> {
        let mut process = self.process.lock().await;
        let previous = self.current();

        if previous.state().is_active() && process.is_some() {
            warn!(
                "Startup requested while engine {} is {}",
                previous.id,
                previous.state()
            );
            return Err(EngineError::AlreadyRunning);
        }

        // A failed session that was never shut down may still hold a process
        if let Some(stale) = process.take() {
            debug!("Reaping leftover process of engine {}", previous.id);
            let report = stale
                .terminate(&previous, None, self.config.shutdown_grace)
                .await;
            *self.last_exit.lock() = report.status;
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let core = Arc::new(SessionCore::new(id, &self.config, self.event_tx.clone()));
        *self.current.lock() = core.clone();
        core.transition(EngineState::Starting);

        let spawned = match EngineProcess::spawn(&self.config, core.clone()).await {
            Ok(spawned) => spawned,
            Err(e) => {
                core.transition(EngineState::Failed);
                return Err(e);
            }
        };
        *process = Some(spawned);

        for line in &core.profile().handshake {
            core.write_line(line).await?;
        }

        info!("Engine {} starting ({})", id, self.config.program);
        Ok(id)
    }

    /// Forward one command line to the engine.
    ///
    /// Once a search depth is set, think commands without their own limit
    /// are sent with `depth N` appended.
    pub async fn send(&self, command: &str) -> Result<(), EngineError> {
        let core = self.current();
        let command = normalize_command(command);
        let command = apply_search_depth(core.profile(), command, self.search_depth());
        core.begin_command(&command)?;
        core.write_line(&command).await
    }

    /// Start a search at the configured depth (plain `go` when unset)
    pub async fn go(&self) -> Result<(), EngineError> {
        self.send("go").await
    }

    /// Pop the oldest unread output line without blocking
    pub fn read(&self) -> Option<String> {
        self.current().queue.pop()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    pub fn is_thinking(&self) -> bool {
        self.state() == EngineState::Thinking
    }

    pub fn state(&self) -> EngineState {
        self.current().state()
    }

    /// Commands sent and not yet acknowledged by a marker line
    pub fn pending_commands(&self) -> usize {
        self.current().pending_commands()
    }

    /// Identifier of the current (or most recent) session
    pub fn session_id(&self) -> Option<SessionId> {
        let core = self.current();
        (core.id.0 != 0).then_some(core.id)
    }

    /// PID of the current (or most recent) engine process
    pub fn pid(&self) -> Option<u32> {
        self.current().pid()
    }

    pub fn queued_lines(&self) -> usize {
        self.current().queue.len()
    }

    pub fn dropped_lines(&self) -> u64 {
        self.current().queue.dropped()
    }

    /// Whether a background reader is still draining engine output
    pub fn reader_active(&self) -> bool {
        self.current().reader_active()
    }

    /// Exit status collected by the last shutdown
    pub fn last_exit_status(&self) -> Option<ExitStatus> {
        *self.last_exit.lock()
    }

    pub fn search_depth(&self) -> Option<u32> {
        match self.search_depth.load(Ordering::SeqCst) {
            0 => None,
            depth => Some(depth),
        }
    }

    /// Set the depth applied to every search started through this manager
    pub fn change_search_depth(&self, depth: u32) -> Result<(), EngineError> {
        if !(1..=MAX_SEARCH_DEPTH).contains(&depth) {
            return Err(EngineError::InvalidSearchDepth(depth));
        }
        self.search_depth.store(depth, Ordering::SeqCst);
        debug!("Search depth set to {}", depth);
        Ok(())
    }

    /// Subscribe to state changes and output lines of every session
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the engine and release every handle.
    ///
    /// Idempotent. The session always ends up `Terminated`; a
    /// `ShutdownTimeout` error only reports that the engine had to be killed.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut process = self.process.lock().await;
        let core = self.current();

        let failed = match core.state() {
            EngineState::Uninitialized | EngineState::Terminated => {
                debug!("Shutdown requested with no running engine");
                return Ok(());
            }
            EngineState::Failed => true,
            _ => {
                core.transition(EngineState::ShuttingDown);
                false
            }
        };

        let mut outcome = Ok(());
        if let Some(running) = process.take() {
            let quit = if failed {
                None
            } else {
                core.profile().quit_command.clone()
            };
            let grace = self.config.shutdown_grace;
            let report = running.terminate(&core, quit.as_deref(), grace).await;
            *self.last_exit.lock() = report.status;
            if report.timed_out {
                outcome = Err(EngineError::ShutdownTimeout(grace));
            }
        }

        core.transition(EngineState::Terminated);
        info!("Engine {} terminated", core.id);
        outcome
    }
}

/// Strip trailing line terminators; the writer appends exactly one newline
pub fn normalize_command(command: &str) -> &str {
    command.trim_end_matches(['\r', '\n'])
}

/// Append `depth N` to a think command that sets neither a depth nor an
/// unbounded search
fn apply_search_depth<'a>(
    profile: &MarkerProfile,
    command: &'a str,
    depth: Option<u32>,
) -> Cow<'a, str> {
    let Some(depth) = depth else {
        return Cow::Borrowed(command);
    };
    if !profile.is_think_command(command) {
        return Cow::Borrowed(command);
    }
    let limited = command
        .split_whitespace()
        .skip(1)
        .any(|token| matches!(token, "depth" | "infinite"));
    if limited {
        Cow::Borrowed(command)
    } else {
        Cow::Owned(format!("{} depth {}", command.trim_end(), depth))
    }
}
