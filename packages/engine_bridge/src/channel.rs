use engine_session::{EngineConfig, EngineEvent, EngineFamily, EngineManager};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::dispatch::{MethodCall, MethodResponse, dispatch, is_query};

/// Name the calling layer uses to address a family's channel
pub fn channel_name(family: EngineFamily) -> String {
    format!("{}_engine", family.as_str())
}

/// Messages that can be sent to the channel actor
pub(crate) enum ChannelMessage {
    Invoke {
        call: MethodCall,
        respond_to: oneshot::Sender<MethodResponse>,
    },
}

/// Handle to one engine family's method channel.
///
/// Lifecycle and `send` calls are processed in arrival order by an actor task
/// that owns the engine; `read`, `isReady` and `isThinking` are answered
/// directly so polling never waits behind a slow startup or shutdown.
#[derive(Clone)]
pub struct EngineChannel {
    name: String,
    family: EngineFamily,
    sender: mpsc::Sender<ChannelMessage>,
    manager: Arc<EngineManager>,
}

impl EngineChannel {
    /// Create the engine manager and start the actor task
    pub fn spawn(family: EngineFamily, config: EngineConfig) -> Self {
        let name = channel_name(family);
        let manager = Arc::new(EngineManager::new(config));
        let (sender, receiver) = mpsc::channel(32);

        let actor = ChannelActor {
            name: name.clone(),
            manager: manager.clone(),
            receiver,
        };
        tokio::spawn(actor.run());

        Self {
            name,
            family,
            sender,
            manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> EngineFamily {
        self.family
    }

    /// Invoke a method and wait for its response
    pub async fn invoke(&self, call: MethodCall) -> MethodResponse {
        if is_query(&call.method) {
            return dispatch(&self.manager, &call).await;
        }

        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ChannelMessage::Invoke {
                call,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return MethodResponse::error("channel_closed", "Failed to send channel message");
        }
        rx.await.unwrap_or_else(|_| {
            MethodResponse::error("channel_closed", "Failed to receive channel response")
        })
    }

    /// Subscribe to engine output and state changes
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.manager.subscribe()
    }

    /// Shut the engine down; the actor exits once every handle is dropped
    pub async fn detach(self) -> MethodResponse {
        info!("Detaching channel {}", self.name);
        self.invoke(MethodCall::bare("shutdown")).await
    }
}

/// The actor that serializes lifecycle calls for one channel
struct ChannelActor {
    name: String,
    manager: Arc<EngineManager>,
    receiver: mpsc::Receiver<ChannelMessage>,
}

impl ChannelActor {
    async fn run(mut self) {
        debug!("Channel {} actor started", self.name);

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                ChannelMessage::Invoke { call, respond_to } => {
                    let response = dispatch(&self.manager, &call).await;
                    let _ = respond_to.send(response);
                }
            }
        }

        // Every handle is gone: make sure no engine outlives the channel
        let _ = self.manager.shutdown().await;
        debug!("Channel {} actor shutting down", self.name);
    }
}
