//! Change feed
//!
//! Committed mutations are pushed to every subscriber in sequence order,
//! only after their record is durable. Subscribers that dropped their
//! receiver are pruned on the next publish.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

/// Kind of change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Set,
    Delete,
    /// The log was cut back to `seq`; derived state must be rebuilt
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub seq: u64,
    pub timestamp: u64,
}

impl ChangeEvent {
    pub fn set(key: Vec<u8>, value: Vec<u8>, seq: u64, timestamp: u64) -> Self {
        Self {
            op: ChangeOp::Set,
            key,
            value: Some(value),
            seq,
            timestamp,
        }
    }

    pub fn delete(key: Vec<u8>, seq: u64, timestamp: u64) -> Self {
        Self {
            op: ChangeOp::Delete,
            key,
            value: None,
            seq,
            timestamp,
        }
    }

    pub fn truncate(seq: u64, timestamp: u64) -> Self {
        Self {
            op: ChangeOp::Truncate,
            key: Vec::new(),
            value: None,
            seq,
            timestamp,
        }
    }
}

/// Fan-out of change events to subscribers
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: Mutex<Vec<Sender<ChangeEvent>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Reserve the feed; events sent through the returned publisher are
    /// ordered against every other publisher
    pub fn publisher(&self) -> Publisher<'_> {
        Publisher {
            subscribers: self.subscribers.lock(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Exclusive handle for publishing a batch of events
pub struct Publisher<'a> {
    subscribers: MutexGuard<'a, Vec<Sender<ChangeEvent>>>,
}

impl Publisher<'_> {
    pub fn send(mut self, events: Vec<ChangeEvent>) {
        if events.is_empty() || self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| {
            events
                .iter()
                .all(|event| tx.send(event.clone()).is_ok())
        });
        trace!(
            events = events.len(),
            subscribers = self.subscribers.len(),
            "published changes"
        );
    }
}
