//! Channel event stream consumption
//!
//! Applies daemon channel lifecycle notifications to the resolver and
//! re-publishes them enriched with the full identity record.

use chrono::{DateTime, Utc};
use lngate_core::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::identity::ChannelIdentity;
use crate::resolver::ChannelIdentityResolver;

/// Channel lifecycle notification from the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    ChannelOpened {
        id: String,
        #[serde(default)]
        other_ids: Vec<String>,
        #[serde(default)]
        is_trusted_funding: bool,
        #[serde(default)]
        is_private: bool,
        #[serde(default)]
        capacity: Option<u64>,
        #[serde(default)]
        partner_public_key: Option<String>,
    },
    ChannelClosed {
        id: String,
        #[serde(default)]
        other_ids: Vec<String>,
        #[serde(default)]
        is_trusted_funding: bool,
    },
}

impl ChannelEvent {
    pub fn id(&self) -> &str {
        match self {
            ChannelEvent::ChannelOpened { id, .. } | ChannelEvent::ChannelClosed { id, .. } => id,
        }
    }
}

/// Kind of resolved event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEventKind {
    ChannelOpened,
    ChannelClosed,
}

/// Channel event carrying the complete identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedChannelEvent {
    pub kind: ChannelEventKind,
    pub id: String,
    pub other_ids: Vec<String>,
    pub is_trusted_funding: bool,
    pub identity: ChannelIdentity,
    pub timestamp: DateTime<Utc>,
}

impl ResolvedChannelEvent {
    fn new(kind: ChannelEventKind, identity: ChannelIdentity) -> Self {
        Self {
            kind,
            id: identity.current_id.clone(),
            other_ids: identity.other_ids.clone(),
            is_trusted_funding: identity.is_trusted_funding,
            identity,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcasts resolved channel events
#[derive(Clone)]
pub struct ChannelEventEmitter {
    sender: Arc<broadcast::Sender<ResolvedChannelEvent>>,
}

impl ChannelEventEmitter {
    /// Create a new emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event; dropped when nobody listens
    pub fn emit(&self, event: ResolvedChannelEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ResolvedChannelEvent> {
        self.sender.subscribe()
    }
}

/// Feeds daemon channel events into the resolver
pub struct ChannelEventPump {
    resolver: Arc<ChannelIdentityResolver>,
    emitter: ChannelEventEmitter,
}

impl ChannelEventPump {
    pub fn new(resolver: Arc<ChannelIdentityResolver>, capacity: usize) -> Self {
        Self {
            resolver,
            emitter: ChannelEventEmitter::new(capacity),
        }
    }

    pub fn emitter(&self) -> ChannelEventEmitter {
        self.emitter.clone()
    }

    pub fn resolver(&self) -> Arc<ChannelIdentityResolver> {
        Arc::clone(&self.resolver)
    }

    /// Apply one event and publish the enriched result
    pub fn apply(&self, event: &ChannelEvent) -> Result<ResolvedChannelEvent> {
        let resolved = match event {
            ChannelEvent::ChannelOpened {
                id,
                other_ids,
                is_trusted_funding,
                ..
            } => {
                let identity = self.resolver.observe_opened(id, other_ids, *is_trusted_funding)?;
                ResolvedChannelEvent::new(ChannelEventKind::ChannelOpened, identity)
            }
            ChannelEvent::ChannelClosed {
                id,
                other_ids,
                is_trusted_funding,
            } => {
                let identity = match self.resolver.on_closed(id) {
                    Ok(identity) => identity,
                    Err(GateError::UnknownIdentity(_)) => {
                        // opened before we were watching
                        self.resolver.observe_opened(id, other_ids, *is_trusted_funding)?;
                        self.resolver.on_closed(id)?
                    }
                    Err(e) => return Err(e),
                };
                ResolvedChannelEvent::new(ChannelEventKind::ChannelClosed, identity)
            }
        };

        self.emitter.emit(resolved.clone());
        Ok(resolved)
    }

    /// Consume `events` until the sender side closes
    pub fn spawn(self, mut events: mpsc::Receiver<ChannelEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.apply(&event) {
                    tracing::warn!(channel = %event.id(), error = %e, "Failed to apply channel event");
                }
            }
            tracing::debug!("Channel event stream ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityState;

    #[test]
    fn test_channel_event_wire_shape() {
        let json = serde_json::json!({
            "type": "channel_opened",
            "id": "16000000x0x1",
            "is_trusted_funding": true
        });
        let event: ChannelEvent = serde_json::from_value(json).unwrap();
        match &event {
            ChannelEvent::ChannelOpened {
                other_ids,
                is_trusted_funding,
                ..
            } => {
                assert!(other_ids.is_empty());
                assert!(*is_trusted_funding);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(event.id(), "16000000x0x1");
    }

    #[test]
    fn test_apply_close_of_unseen_channel() {
        let pump = ChannelEventPump::new(Arc::new(ChannelIdentityResolver::default()), 16);
        let resolved = pump
            .apply(&ChannelEvent::ChannelClosed {
                id: "7x1x0".to_string(),
                other_ids: vec!["16000000x0x9".to_string()],
                is_trusted_funding: true,
            })
            .unwrap();

        assert_eq!(resolved.kind, ChannelEventKind::ChannelClosed);
        assert_eq!(resolved.identity.state, IdentityState::Closed);
        assert_eq!(resolved.other_ids, vec!["16000000x0x9"]);
    }

    #[tokio::test]
    async fn test_emitter_publishes_applied_events() {
        let pump = ChannelEventPump::new(Arc::new(ChannelIdentityResolver::default()), 16);
        let mut rx = pump.emitter().subscribe();

        pump.apply(&ChannelEvent::ChannelOpened {
            id: "102x1x0".to_string(),
            other_ids: vec![],
            is_trusted_funding: false,
            is_private: false,
            capacity: Some(1_000_000),
            partner_public_key: None,
        })
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChannelEventKind::ChannelOpened);
        assert_eq!(event.id, "102x1x0");
    }
}
