//! Chain notifications for subscribers outside the validation lock.

use coind_consensus::Hash256;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

pub const DEFAULT_EVENT_QUEUE: usize = 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChainEvent {
    UpdatedBlockTip {
        hash: Hash256,
        height: i32,
        initial_download: bool,
    },
    BlockConnected {
        hash: Hash256,
        txids: Vec<Hash256>,
    },
    BlockDisconnected {
        hash: Hash256,
        txids: Vec<Hash256>,
    },
    TxAccepted {
        txid: Hash256,
    },
    /// A mempool transaction was evicted by a block that spent its inputs.
    TxConflicted {
        txid: Hash256,
    },
}

/// Fan-out of [`ChainEvent`]s. Publishing never blocks; a subscriber that
/// falls behind loses events.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    subscribers: Vec<Sender<ChainEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, capacity: usize) -> Receiver<ChainEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: ChainEvent) {
        self.subscribers.retain(|subscriber| match subscriber.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                coind_log::log_debug!("event queue full, dropping {event:?}");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_and_closed_queue_unsubscribes() {
        let mut bus = EventBus::new();
        let first = bus.subscribe(1);
        let second = bus.subscribe(4);
        bus.publish(ChainEvent::TxAccepted { txid: [1u8; 32] });
        bus.publish(ChainEvent::TxAccepted { txid: [2u8; 32] });
        assert_eq!(first.try_iter().count(), 1);
        assert_eq!(second.try_iter().count(), 2);

        drop(first);
        bus.publish(ChainEvent::TxConflicted { txid: [3u8; 32] });
        assert_eq!(bus.subscriber_count(), 1);
    }
}
