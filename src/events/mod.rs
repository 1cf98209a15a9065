//! Lifecycle events emitted by the transaction manager
//!
//! Every event except `ProcessingBlockFailed` belongs to one tracked
//! transaction. Consumers either subscribe to the whole stream or watch a
//! single id until it reaches a terminal event.

use crate::chain::FeeQuote;

use ethers::types::{Address, H256};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// First broadcast accepted by the node
    Submitted {
        id: Uuid,
        nonce: u64,
        hash: H256,
        fees: FeeQuote,
        from: Address,
    },

    /// Stuck transaction replaced with higher fees
    Retry {
        id: Uuid,
        hash: H256,
        fees: FeeQuote,
        from: Address,
    },

    RetryFailed { id: Uuid, error: String },

    /// Seen in a block, or its nonce was consumed on chain
    Included {
        id: Uuid,
        hash: H256,
        fees: FeeQuote,
        nonce: u64,
        from: Address,
    },

    /// Cancellation transaction mined
    Cancel { id: Uuid, hash: H256, fees: FeeQuote },

    /// `still_pending` is false once the cancellation was broadcast and the
    /// id is no longer tracked
    CancelFailed {
        id: Uuid,
        error: String,
        still_pending: bool,
    },

    ProcessingBlockFailed { block_number: u64, error: String },
}

impl LifecycleEvent {
    /// Tracked transaction this event belongs to
    pub fn id(&self) -> Option<Uuid> {
        match self {
            LifecycleEvent::Submitted { id, .. }
            | LifecycleEvent::Retry { id, .. }
            | LifecycleEvent::RetryFailed { id, .. }
            | LifecycleEvent::Included { id, .. }
            | LifecycleEvent::Cancel { id, .. }
            | LifecycleEvent::CancelFailed { id, .. } => Some(*id),
            LifecycleEvent::ProcessingBlockFailed { .. } => None,
        }
    }

    /// Get event name for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Submitted { .. } => "submitted",
            LifecycleEvent::Retry { .. } => "retry",
            LifecycleEvent::RetryFailed { .. } => "retry_failed",
            LifecycleEvent::Included { .. } => "included",
            LifecycleEvent::Cancel { .. } => "cancel",
            LifecycleEvent::CancelFailed { .. } => "cancel_failed",
            LifecycleEvent::ProcessingBlockFailed { .. } => "processing_block_failed",
        }
    }

    /// No further events follow for this id
    pub fn is_terminal(&self) -> bool {
        match self {
            LifecycleEvent::Included { .. } | LifecycleEvent::Cancel { .. } => true,
            LifecycleEvent::CancelFailed { still_pending, .. } => !still_pending,
            _ => false,
        }
    }
}

/// Fans events out to every subscriber of the chain and to the watchers of
/// each id.
///
/// Watchers get their own unbounded channel, so a slow watcher never loses
/// events of its id however busy the chain is. Full-stream subscribers share
/// a bounded broadcast channel and may lag.
pub struct EventHub {
    firehose: broadcast::Sender<LifecycleEvent>,
    watchers: DashMap<Uuid, Vec<mpsc::UnboundedSender<LifecycleEvent>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (firehose, _) = broadcast::channel(capacity);
        Arc::new(Self {
            firehose,
            watchers: DashMap::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.firehose.subscribe()
    }

    /// Start collecting the events of `id`
    pub fn watch(self: &Arc<Self>, id: Uuid) -> TransactionWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.entry(id).or_default().push(tx);

        TransactionWatch {
            id,
            rx,
            hub: Arc::downgrade(self),
            finished: false,
        }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        if let Some(id) = event.id() {
            if event.is_terminal() {
                if let Some((_, senders)) = self.watchers.remove(&id) {
                    for sender in senders {
                        let _ = sender.send(event.clone());
                    }
                }
            } else if let Some(mut senders) = self.watchers.get_mut(&id) {
                senders.retain(|sender| sender.send(event.clone()).is_ok());
            }
        }

        // No subscribers is fine
        let _ = self.firehose.send(event);
    }

    /// Drop the channels of watchers of `id` that went away
    fn forget_closed(&self, id: &Uuid) {
        if let Some(mut senders) = self.watchers.get_mut(id) {
            senders.retain(|sender| !sender.is_closed());
        }
        self.watchers.remove_if(id, |_, senders| senders.is_empty());
    }

    #[cfg(test)]
    pub fn watched_ids(&self) -> usize {
        self.watchers.len()
    }
}

/// Events of a single transaction, in emission order
pub struct TransactionWatch {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    hub: Weak<EventHub>,
    finished: bool,
}

impl TransactionWatch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event for this id; `None` after the terminal event or once the
    /// manager is gone
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        if self.finished {
            return None;
        }

        let event = self.rx.recv().await;
        self.finished = event.as_ref().map_or(true, LifecycleEvent::is_terminal);
        event
    }
}

impl Drop for TransactionWatch {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(hub) = self.hub.upgrade() {
            hub.forget_closed(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::legacy;

    fn included(id: Uuid) -> LifecycleEvent {
        LifecycleEvent::Included {
            id,
            hash: H256::repeat_byte(1),
            fees: legacy(10),
            nonce: 0,
            from: Address::zero(),
        }
    }

    #[tokio::test]
    async fn test_watch_filters_by_id_and_stops_at_terminal_event() {
        let hub = EventHub::new(16);
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut watch = hub.watch(id);

        hub.publish(LifecycleEvent::RetryFailed {
            id: other,
            error: "unrelated".to_string(),
        });
        hub.publish(LifecycleEvent::ProcessingBlockFailed {
            block_number: 4,
            error: "rpc down".to_string(),
        });
        hub.publish(included(id));
        hub.publish(LifecycleEvent::RetryFailed {
            id,
            error: "late".to_string(),
        });

        let event = watch.next().await.unwrap();
        assert_eq!(event.name(), "included");
        assert!(watch.next().await.is_none());
        assert_eq!(hub.watched_ids(), 0);
    }

    #[tokio::test]
    async fn test_watch_keeps_up_with_a_busy_chain() {
        let hub = EventHub::new(8);
        let id = Uuid::new_v4();
        let mut watch = hub.watch(id);
        let mut firehose = hub.subscribe();

        hub.publish(LifecycleEvent::RetryFailed {
            id,
            error: "underpriced".to_string(),
        });
        for block_number in 0..100 {
            hub.publish(LifecycleEvent::ProcessingBlockFailed {
                block_number,
                error: "timeout".to_string(),
            });
        }
        hub.publish(included(id));

        assert!(matches!(
            firehose.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(watch.next().await.unwrap().name(), "retry_failed");
        assert_eq!(watch.next().await.unwrap().name(), "included");
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_watch_is_forgotten() {
        let hub = EventHub::new(8);
        let id = Uuid::new_v4();
        let first = hub.watch(id);
        let mut second = hub.watch(id);

        drop(first);
        assert_eq!(hub.watched_ids(), 1);

        hub.publish(included(id));
        assert_eq!(second.next().await.unwrap().name(), "included");

        drop(second);
        assert_eq!(hub.watched_ids(), 0);
    }

    #[tokio::test]
    async fn test_watch_ends_when_hub_is_gone() {
        let hub = EventHub::new(8);
        let mut watch = hub.watch(Uuid::new_v4());

        drop(hub);
        assert!(watch.next().await.is_none());
    }

    #[test]
    fn test_cancel_failure_is_terminal_only_when_untracked() {
        let id = Uuid::new_v4();
        let pending = LifecycleEvent::CancelFailed {
            id,
            error: "underpriced".to_string(),
            still_pending: true,
        };
        let abandoned = LifecycleEvent::CancelFailed {
            id,
            error: "dropped".to_string(),
            still_pending: false,
        };
        assert!(!pending.is_terminal());
        assert!(abandoned.is_terminal());
        assert_eq!(abandoned.id(), Some(id));
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = LifecycleEvent::ProcessingBlockFailed {
            block_number: 9,
            error: "timeout".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "processing_block_failed");
        assert_eq!(json["block_number"], 9);
    }
}
