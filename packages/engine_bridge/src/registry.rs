use engine_session::EngineFamily;
use std::collections::HashMap;
use tracing::info;

use crate::channel::{EngineChannel, channel_name};
use crate::config::FileConfig;
use crate::dispatch::{MethodCall, MethodResponse};

/// Every attached engine channel, addressed by channel name
pub struct BridgeRegistry {
    channels: HashMap<String, EngineChannel>,
}

impl BridgeRegistry {
    /// Attach one channel per engine family. Engines are not started until a
    /// `startup` call arrives.
    pub fn attach(config: &FileConfig) -> Self {
        let channels = EngineFamily::ALL
            .into_iter()
            .map(|family| {
                let channel = EngineChannel::spawn(family, config.engine_config(family));
                info!("Attached channel {}", channel.name());
                (channel.name().to_string(), channel)
            })
            .collect();
        Self { channels }
    }

    pub fn channel(&self, family: EngineFamily) -> Option<&EngineChannel> {
        self.channels.get(&channel_name(family))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Route a call to the named channel
    pub async fn invoke(&self, channel: &str, call: MethodCall) -> MethodResponse {
        match self.channels.get(channel) {
            Some(handle) => handle.invoke(call).await,
            None => MethodResponse::error(
                "unknown_channel",
                format!("No channel named {}", channel),
            ),
        }
    }

    /// Shut every engine down
    pub async fn detach_all(self) {
        for (_, channel) in self.channels {
            channel.detach().await;
        }
    }
}
