// Library interface for engine_bridge
// Exposes the per-family method channels for embedding in a host application

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod registry;

pub use channel::{EngineChannel, channel_name};
pub use config::{FileConfig, load_config};
pub use dispatch::{MethodCall, MethodResponse};
pub use registry::BridgeRegistry;
