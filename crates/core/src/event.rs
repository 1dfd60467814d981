//! Proxy event system — decoupled coordination between long-lived services.
//!
//! The token daemon publishes credential changes here; the credential store
//! and pipelines subscribe instead of holding references into the daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events broadcast between proxy services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProxyEvent {
    /// A credential was refreshed; readers should re-resolve the alias.
    CredentialChanged {
        provider: String,
        alias: String,
        version: u64,
        timestamp: DateTime<Utc>,
    },

    /// The config resolver installed a new generation of pipelines.
    ConfigReloaded {
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// A target transitioned into or out of a ban.
    TargetBanStateChanged {
        provider: String,
        alias: String,
        banned: bool,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The supervisor started draining; in-flight requests get the grace
    /// period, new ones are refused.
    ShutdownRequested { timestamp: DateTime<Utc> },
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Lagging
/// subscribers miss events rather than blocking publishers.
pub struct EventBus {
    sender: broadcast::Sender<Arc<ProxyEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers. No subscribers is fine.
    pub fn publish(&self, event: ProxyEvent) {
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProxyEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(ProxyEvent::CredentialChanged {
            provider: "qwen".into(),
            alias: "key1".into(),
            version: 2,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            ProxyEvent::CredentialChanged {
                provider, version, ..
            } => {
                assert_eq!(provider, "qwen");
                assert_eq!(*version, 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(ProxyEvent::ShutdownRequested {
            timestamp: Utc::now(),
        });
    }
}
