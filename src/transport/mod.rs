//! Dual-transport event bus.
//!
//! Market data rides a low-latency broadcast channel (at-most-once) and is
//! mirrored onto the durable transport for audit and replay. Order,
//! portfolio, strategy and system events go to the durable transport only,
//! where consumers acknowledge and failures requeue.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{EventType, Message};

pub mod durable_bus;
pub mod market_bus;

pub use durable_bus::{DurableBus, EventHandler};
pub use market_bus::MarketBus;

pub struct EventBus {
    market: MarketBus,
    durable: DurableBus,
}

impl EventBus {
    pub fn new(market_capacity: usize) -> Self {
        let durable = DurableBus::new();
        for exchange in [
            "market.data",
            "order.events",
            "portfolio.events",
            "strategy.events",
            "system.events",
        ] {
            durable.declare_exchange(exchange);
        }
        Self {
            market: MarketBus::new(market_capacity),
            durable,
        }
    }

    /// Publishes market data on the low-latency channel and mirrors it onto
    /// the durable transport.
    pub async fn publish_market_data(&self, event_type: EventType, payload: Value) {
        let message = Message::new(event_type, payload);
        self.market.publish(message.clone());
        self.durable
            .publish(&event_type.exchange(), &event_type.routing_key(), message)
            .await;
    }

    pub async fn publish_order_event(&self, event_type: EventType, payload: Value) {
        self.publish_durable(event_type, payload).await;
    }

    pub async fn publish_portfolio_event(&self, event_type: EventType, payload: Value) {
        self.publish_durable(event_type, payload).await;
    }

    pub async fn publish_strategy_event(&self, event_type: EventType, payload: Value) {
        self.publish_durable(event_type, payload).await;
    }

    pub async fn publish_system_event(&self, event_type: EventType, payload: Value) {
        self.publish_durable(event_type, payload).await;
    }

    async fn publish_durable(&self, event_type: EventType, payload: Value) {
        let message = Message::new(event_type, payload);
        debug!(event = %event_type, "publishing durable event");
        self.durable
            .publish(&event_type.exchange(), &event_type.routing_key(), message)
            .await;
    }

    /// Low-latency subscription; lagging receivers skip, they are never
    /// waited on.
    pub fn subscribe_market_data(&self) -> broadcast::Receiver<Message> {
        self.market.subscribe()
    }

    /// Durable subscription for a named consumer. Each consumer gets its own
    /// queue (`<type>.<consumer>`) bound to the family exchange, so several
    /// consumers of one event type progress independently.
    pub fn subscribe_durable(
        &self,
        event_type: EventType,
        consumer: &str,
        handler: EventHandler,
    ) -> JoinHandle<()> {
        let queue = event_type.queue_name(consumer);
        self.durable
            .bind_queue(&queue, &event_type.exchange(), &event_type.routing_key());
        self.durable.consume(&queue, consumer, handler)
    }

    pub fn market_dropped_count(&self) -> u64 {
        self.market.dropped_count()
    }

    pub fn durable(&self) -> &DurableBus {
        &self.durable
    }
}

/// Shared handle the services hold.
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn market_data_is_mirrored_onto_the_durable_transport() {
        let bus = EventBus::new(16);
        let mut live = bus.subscribe_market_data();

        let audited = Arc::new(AtomicUsize::new(0));
        let counter = audited.clone();
        let handler: EventHandler = Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let worker = bus.subscribe_durable(EventType::MarketQuote, "audit", handler);

        bus.publish_market_data(EventType::MarketQuote, serde_json::json!({"last_price": 99.5}))
            .await;

        let message = live.recv().await.unwrap();
        assert_eq!(message.message_type, "market.quote");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(audited.load(Ordering::SeqCst), 1);
        worker.abort();
    }

    #[tokio::test]
    async fn order_events_reach_named_consumers() {
        let bus = EventBus::new(16);
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let handler: EventHandler = Arc::new(move |msg| {
            let counter = counter.clone();
            Box::pin(async move {
                assert_eq!(msg.message_type, "order.new");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let worker = bus.subscribe_durable(EventType::OrderNew, "ledger", handler);

        bus.publish_order_event(EventType::OrderNew, serde_json::json!({"order_id": "o1"}))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
        worker.abort();
    }
}
