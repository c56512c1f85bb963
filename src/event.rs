//! Node-wide event bus.

use crate::crypto::Hash;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A block sealed by the local miner was accepted.
    NewMinedBlock { number: u64, hash: Hash },
    /// The canonical head advanced.
    ChainHead { number: u64, hash: Hash },
    /// The canonical head was rewound.
    ChainRewound { number: u64, hash: Hash },
}

/// Fan-out of [`ChainEvent`]s to any number of subscribers. Cloning shares the
/// same channel.
#[derive(Debug, Clone)]
pub struct EventMux {
    sender: broadcast::Sender<ChainEvent>,
}

impl EventMux {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to current subscribers; returns how many received it.
    pub fn post(&self, event: ChainEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventMux {
    fn default() -> Self {
        Self::new()
    }
}
