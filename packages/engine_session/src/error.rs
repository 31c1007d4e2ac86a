use std::time::Duration;

/// Errors that can occur during engine session operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A session is already starting or running
    #[error("engine is already running")]
    AlreadyRunning,

    /// No active session to talk to
    #[error("engine is not running")]
    NotRunning,

    /// The engine process could not be created
    #[error("failed to spawn engine '{program}': {reason}")]
    SpawnFailure { program: String, reason: String },

    /// Reading from or writing to the engine streams failed
    #[error("engine I/O failure: {0}")]
    IoFailure(String),

    /// The engine ignored the quit request and had to be killed
    #[error("engine did not exit within {0:?}; it was terminated forcibly")]
    ShutdownTimeout(Duration),

    /// The session hit an unrecoverable error and must be shut down
    #[error("engine session has failed")]
    Failed,

    /// Search depth outside the supported range
    #[error("invalid search depth {0} (expected 1..=64)")]
    InvalidSearchDepth(u32),
}

impl EngineError {
    /// Numeric status reported across the method channel. Zero is success.
    pub fn status_code(&self) -> i32 {
        match self {
            EngineError::AlreadyRunning => 1,
            EngineError::NotRunning => 2,
            EngineError::SpawnFailure { .. } => 3,
            EngineError::IoFailure(_) => 4,
            EngineError::ShutdownTimeout(_) => 5,
            EngineError::Failed => 6,
            EngineError::InvalidSearchDepth(_) => 7,
        }
    }

    /// True for errors that leave the session terminated anyway
    pub fn is_warning(&self) -> bool {
        matches!(self, EngineError::ShutdownTimeout(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoFailure(err.to_string())
    }
}
