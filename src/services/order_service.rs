//! Order service: resolves a venue by name and forwards the call.
//!
//! Stateless by design; safe for concurrent use from any number of callers.
//! Adapter errors are wrapped with the operation and broker that hit them; a
//! venue rejection stays a response value so batch callers can continue.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerRegistry};
use crate::core::{
    EventType, ModifyOrderRequest, Order, OrderRequest, OrderResponse, OrderStatus, Position, Quote,
};
use crate::store::OrderRepository;
use crate::transport::SharedEventBus;

#[derive(Debug, Error)]
pub enum OrderServiceError {
    #[error("unknown broker: {0}")]
    UnknownBroker(String),

    #[error("{operation} failed on broker {broker}: {source}")]
    Broker {
        broker: String,
        operation: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl OrderServiceError {
    fn broker(broker: &str, operation: &'static str, source: BrokerError) -> Self {
        Self::Broker {
            broker: broker.to_string(),
            operation,
            source,
        }
    }
}

pub struct OrderService {
    registry: Arc<BrokerRegistry>,
    orders: Arc<dyn OrderRepository>,
    bus: SharedEventBus,
}

impl OrderService {
    pub fn new(
        registry: Arc<BrokerRegistry>,
        orders: Arc<dyn OrderRepository>,
        bus: SharedEventBus,
    ) -> Self {
        Self {
            registry,
            orders,
            bus,
        }
    }

    fn resolve(&self, broker: &str) -> Result<Arc<dyn crate::broker::Broker>, OrderServiceError> {
        self.registry
            .get(broker)
            .map_err(|_| OrderServiceError::UnknownBroker(broker.to_string()))
    }

    /// Places an order at `broker` and records it. The record is stamped with
    /// the owning user and, when the order belongs to a strategy run, the
    /// strategy/leg linkage.
    pub async fn place_order(
        &self,
        broker: &str,
        user_id: &str,
        request: &OrderRequest,
        strategy_id: Option<&str>,
        leg_id: Option<&str>,
    ) -> Result<OrderResponse, OrderServiceError> {
        let adapter = self.resolve(broker)?;
        let response = adapter
            .place_order(request)
            .await
            .map_err(|e| OrderServiceError::broker(broker, "place_order", e))?;

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            broker_order_id: response.order_id.clone().unwrap_or_default(),
            user_id: user_id.to_string(),
            symbol: request.symbol.clone(),
            exchange: request.exchange.clone(),
            order_type: request.order_type,
            side: request.side,
            product_type: request.product_type,
            quantity: request.quantity,
            filled_quantity: 0,
            price: request.price,
            trigger_price: request.trigger_price,
            average_price: 0.0,
            status: if response.success {
                OrderStatus::Pending
            } else {
                OrderStatus::Rejected
            },
            status_message: response.message.clone(),
            strategy_id: strategy_id.map(str::to_string),
            leg_id: leg_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.orders.create(&order).await?;

        if response.success {
            debug!(
                broker = %broker,
                symbol = %request.symbol,
                order_id = response.order_id.as_deref().unwrap_or(""),
                "order placed"
            );
            self.bus
                .publish_order_event(EventType::OrderNew, serde_json::to_value(&order).unwrap_or_default())
                .await;
        } else {
            warn!(
                broker = %broker,
                symbol = %request.symbol,
                message = %response.message,
                "order rejected by venue"
            );
        }
        Ok(response)
    }

    pub async fn modify_order(
        &self,
        broker: &str,
        order_id: &str,
        request: &ModifyOrderRequest,
    ) -> Result<OrderResponse, OrderServiceError> {
        let adapter = self.resolve(broker)?;
        let response = adapter
            .modify_order(order_id, request)
            .await
            .map_err(|e| OrderServiceError::broker(broker, "modify_order", e))?;
        if response.success {
            self.bus
                .publish_order_event(
                    EventType::OrderUpdate,
                    serde_json::json!({"order_id": order_id, "broker": broker}),
                )
                .await;
        }
        Ok(response)
    }

    pub async fn cancel_order(
        &self,
        broker: &str,
        order_id: &str,
    ) -> Result<OrderResponse, OrderServiceError> {
        let adapter = self.resolve(broker)?;
        let response = adapter
            .cancel_order(order_id)
            .await
            .map_err(|e| OrderServiceError::broker(broker, "cancel_order", e))?;
        if response.success {
            self.bus
                .publish_order_event(
                    EventType::OrderCancel,
                    serde_json::json!({"order_id": order_id, "broker": broker}),
                )
                .await;
        }
        Ok(response)
    }

    /// Current venue-side state of an order.
    pub async fn get_order(&self, broker: &str, order_id: &str) -> Result<Order, OrderServiceError> {
        let adapter = self.resolve(broker)?;
        adapter
            .get_order(order_id)
            .await
            .map_err(|e| OrderServiceError::broker(broker, "get_order", e))
    }

    pub async fn get_orders(&self, broker: &str) -> Result<Vec<Order>, OrderServiceError> {
        let adapter = self.resolve(broker)?;
        adapter
            .get_orders()
            .await
            .map_err(|e| OrderServiceError::broker(broker, "get_orders", e))
    }

    pub async fn get_positions(&self, broker: &str) -> Result<Vec<Position>, OrderServiceError> {
        let adapter = self.resolve(broker)?;
        adapter
            .get_positions()
            .await
            .map_err(|e| OrderServiceError::broker(broker, "get_positions", e))
    }

    pub async fn get_quote(
        &self,
        broker: &str,
        symbol: &str,
        exchange: &str,
    ) -> Result<Quote, OrderServiceError> {
        let adapter = self.resolve(broker)?;
        adapter
            .get_quote(symbol, exchange)
            .await
            .map_err(|e| OrderServiceError::broker(broker, "get_quote", e))
    }

    /// Recorded orders belonging to a strategy, oldest first.
    pub async fn orders_for_strategy(
        &self,
        strategy_id: &str,
    ) -> Result<Vec<Order>, OrderServiceError> {
        Ok(self.orders.get_by_strategy(strategy_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::broker::PaperBroker;
    use crate::core::OrderSide;
    use crate::store::InMemoryOrderRepository;
    use crate::transport::EventBus;

    async fn service_with_paper() -> (OrderService, Arc<PaperBroker>) {
        let registry = Arc::new(BrokerRegistry::new());
        let paper = Arc::new(PaperBroker::new("paper"));
        paper.initialize().await.unwrap();
        paper.set_last_price("AAPL", 150.0);
        registry.register("paper", paper.clone());
        let service = OrderService::new(
            registry,
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(EventBus::new(16)),
        );
        (service, paper)
    }

    #[tokio::test]
    async fn unknown_broker_is_an_error() {
        let (service, _paper) = service_with_paper().await;
        let request = OrderRequest::market("AAPL", "NSECM", OrderSide::Buy, 1);
        let err = service
            .place_order("missing", "u1", &request, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderServiceError::UnknownBroker(name) if name == "missing"));
    }

    #[tokio::test]
    async fn placement_records_the_order_with_linkage() {
        let (service, _paper) = service_with_paper().await;
        let request = OrderRequest::market("AAPL", "NSECM", OrderSide::Buy, 10);
        let response = service
            .place_order("paper", "u1", &request, Some("strat-1"), Some("leg-1"))
            .await
            .unwrap();
        assert!(response.success);

        let recorded = service.orders_for_strategy("strat-1").await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].user_id, "u1");
        assert_eq!(recorded[0].leg_id.as_deref(), Some("leg-1"));
        assert_eq!(recorded[0].broker_order_id, response.order_id.unwrap());
    }

    #[tokio::test]
    async fn venue_rejection_is_a_response_not_an_error() {
        let (service, _paper) = service_with_paper().await;
        let mut request = OrderRequest::market("AAPL", "NSECM", OrderSide::Buy, 10);
        request.quantity = 0;
        let response = service
            .place_order("paper", "u1", &request, Some("strat-1"), None)
            .await
            .unwrap();
        assert!(!response.success);

        // The rejection is still recorded against the strategy.
        let recorded = service.orders_for_strategy("strat-1").await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn not_connected_errors_are_wrapped_with_context() {
        let registry = Arc::new(BrokerRegistry::new());
        registry.register("paper", Arc::new(PaperBroker::new("paper")));
        let service = OrderService::new(
            registry,
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(EventBus::new(16)),
        );
        let err = service.get_orders("paper").await.unwrap_err();
        match err {
            OrderServiceError::Broker {
                broker,
                operation,
                source,
            } => {
                assert_eq!(broker, "paper");
                assert_eq!(operation, "get_orders");
                assert!(matches!(source, BrokerError::NotConnected));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
