//! Engine Session - lifecycle management for line-protocol chess engines
//!
//! This crate owns one engine subprocess at a time, forwards text commands to
//! its stdin and drains its stdout into a bounded FIFO on a background task.
//! Readiness and thinking state are inferred from per-family marker lines
//! (`ucciok`, `readyok`, `bestmove`, ...). It has no chess knowledge.
//!
//! # Example
//!
//! ```no_run
//! use engine_session::{EngineConfig, EngineFamily, EngineManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::for_family(EngineFamily::Pikafish, "/opt/engines/pikafish");
//!     let manager = EngineManager::new(config);
//!
//!     manager.startup().await.unwrap();
//!     while !manager.is_ready() {
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!     }
//!
//!     manager.send("position startpos").await.unwrap();
//!     manager.send("go depth 8").await.unwrap();
//!
//!     while manager.is_thinking() {
//!         tokio::time::sleep(std::time::Duration::from_millis(10)).await;
//!     }
//!     while let Some(line) = manager.read() {
//!         println!("{}", line);
//!     }
//!
//!     manager.shutdown().await.unwrap();
//! }
//! ```

mod error;
mod manager;
pub mod markers;
mod queue;
mod session;
mod state;

pub use error::EngineError;
pub use manager::{EngineEvent, EngineManager, MAX_SEARCH_DEPTH, SessionId, normalize_command};
pub use markers::{EngineFamily, Marker, MarkerProfile};
pub use queue::OutputQueue;
pub use session::EngineConfig;
pub use state::EngineState;
