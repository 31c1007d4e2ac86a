//! Method-channel dispatch.
//!
//! Maps the calling layer's `{method, arguments}` messages onto an
//! [`EngineManager`]. Lifecycle and write methods answer with an integer
//! status (0 = success, otherwise [`EngineError::status_code`]); queries answer
//! with the value itself.

use engine_session::{EngineError, EngineManager};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

pub const STATUS_OK: i32 = 0;

/// Missing or ill-typed method argument
pub const STATUS_INVALID_ARGUMENTS: i32 = 8;

/// A call arriving from the calling layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    /// Call without arguments
    pub fn bare(method: impl Into<String>) -> Self {
        Self::new(method, Value::Null)
    }
}

/// Reply sent back to the calling layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MethodResponse {
    Success { result: Value },
    NotImplemented,
    Error { code: String, message: String },
}

impl MethodResponse {
    pub fn success(result: impl Into<Value>) -> Self {
        MethodResponse::Success {
            result: result.into(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        MethodResponse::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Integer status carried by a successful lifecycle response
    pub fn status(&self) -> Option<i64> {
        match self {
            MethodResponse::Success { result } => result.as_i64(),
            _ => None,
        }
    }
}

/// Methods answered straight from shared state, without ordering behind
/// lifecycle calls
pub fn is_query(method: &str) -> bool {
    matches!(method, "read" | "isReady" | "isThinking")
}

/// Execute one call against `manager`
pub async fn dispatch(manager: &EngineManager, call: &MethodCall) -> MethodResponse {
    debug!("Dispatching {} ({})", call.method, call.arguments);

    match call.method.as_str() {
        "startup" => status(&call.method, manager.startup().await.map(|_| ())),
        "send" => match call.arguments.as_str() {
            Some(command) => status(&call.method, manager.send(command).await),
            None => invalid_arguments(call),
        },
        "read" => MethodResponse::success(manager.read().map_or(Value::Null, Value::String)),
        "isReady" => MethodResponse::success(manager.is_ready()),
        "isThinking" => MethodResponse::success(manager.is_thinking()),
        "shutdown" => status(&call.method, manager.shutdown().await),
        "changeSearchDepth" => match call.arguments.as_i64() {
            Some(depth) => {
                let depth = u32::try_from(depth).unwrap_or(0);
                status(&call.method, manager.change_search_depth(depth))
            }
            None => invalid_arguments(call),
        },
        _ => MethodResponse::NotImplemented,
    }
}

fn status(method: &str, result: Result<(), EngineError>) -> MethodResponse {
    match result {
        Ok(()) => MethodResponse::success(STATUS_OK),
        Err(e) if e.is_warning() => {
            warn!("{} completed with warning: {}", method, e);
            MethodResponse::success(e.status_code())
        }
        Err(e) => {
            error!("{} failed: {}", method, e);
            MethodResponse::success(e.status_code())
        }
    }
}

fn invalid_arguments(call: &MethodCall) -> MethodResponse {
    warn!("{} called with invalid arguments: {}", call.method, call.arguments);
    MethodResponse::success(STATUS_INVALID_ARGUMENTS)
}
