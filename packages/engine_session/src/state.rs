//! Engine session state machine.
//!
//! ```text
//! Uninitialized --startup--> Starting --readiness marker--> Ready
//! Ready --think command / thinking-start marker--> Thinking
//! Thinking --thinking-end or readiness marker--> Ready
//! Starting/Ready/Thinking --shutdown--> ShuttingDown --exit--> Terminated
//! any active state --I/O error or closed output--> Failed --shutdown--> Terminated
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an engine session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No session has been started yet
    #[default]
    Uninitialized,

    /// Process spawned, waiting for the first readiness marker
    Starting,

    /// Engine is idle and accepting commands
    Ready,

    /// Engine is searching; a thinking-end marker returns it to Ready
    Thinking,

    /// Quit requested, waiting for the process to exit
    ShuttingDown,

    /// Process exited and every handle was released
    Terminated,

    /// Unrecoverable spawn or I/O error
    Failed,
}

impl EngineState {
    /// Session owns a live process (new startups are refused)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            EngineState::Starting
                | EngineState::Ready
                | EngineState::Thinking
                | EngineState::ShuttingDown
        )
    }

    /// Session accepts commands from callers
    pub fn accepts_commands(&self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Thinking)
    }

    /// No further transitions happen without a fresh startup
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Terminated | EngineState::Failed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Starting => "starting",
            EngineState::Ready => "ready",
            EngineState::Thinking => "thinking",
            EngineState::ShuttingDown => "shutting-down",
            EngineState::Terminated => "terminated",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}
