//! Low-latency market data transport.
//!
//! A broadcast channel: no consumer acknowledgment, lagging receivers skip
//! ahead. Delivery is at-most-once by construction; the drop counter makes
//! that policy observable instead of accidental.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::debug;

use crate::core::Message;

#[derive(Debug)]
pub struct MarketBus {
    tx: broadcast::Sender<Message>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl MarketBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        debug!(capacity, "market bus initialized");
        Self {
            tx,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publishes a message to every current subscriber. Returns the number of
    /// subscribers that received it; a message published with no subscribers
    /// is counted as dropped, not treated as an error.
    pub fn publish(&self, message: Message) -> usize {
        match self.tx.send(message) {
            Ok(subscriber_count) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                subscriber_count
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
