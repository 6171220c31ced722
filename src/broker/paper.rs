//! In-process simulation venue.
//!
//! Fills market and limit orders immediately against seeded last prices,
//! keeps stop orders live until cancelled, and derives positions from fills.
//! Used for paper trading and as the venue in engine tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tracing::debug;
use uuid::Uuid;

use crate::core::{
    Instrument, ModifyOrderRequest, Order, OrderRequest, OrderResponse, OrderStatus, OrderType,
    Position, Quote,
};

use super::{Broker, BrokerError};

pub struct PaperBroker {
    name: String,
    connected: AtomicBool,
    orders: DashMap<String, Order>,
    last_prices: DashMap<String, f64>,
    subscriptions: DashSet<String>,
}

impl PaperBroker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: AtomicBool::new(false),
            orders: DashMap::new(),
            last_prices: DashMap::new(),
            subscriptions: DashSet::new(),
        }
    }

    /// Seeds the simulated market price for a symbol.
    pub fn set_last_price(&self, symbol: &str, price: f64) {
        self.last_prices.insert(symbol.to_string(), price);
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Orders placed against this venue, insertion order not guaranteed.
    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.iter().map(|e| e.value().clone()).collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn fill_price(&self, request: &OrderRequest) -> f64 {
        match request.order_type {
            OrderType::Limit | OrderType::StopLimit => request.price.unwrap_or(0.0),
            OrderType::Market | OrderType::StopLoss => self
                .last_prices
                .get(&request.symbol)
                .map(|p| *p)
                .or(request.price)
                .unwrap_or(0.0),
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::Release);
        debug!(broker = %self.name, "paper venue session opened");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, BrokerError> {
        self.ensure_connected()?;
        if request.quantity <= 0 {
            return Ok(OrderResponse::rejected("quantity must be positive"));
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        // Stop orders rest until their trigger; everything else fills at once.
        let resting = matches!(request.order_type, OrderType::StopLoss | OrderType::StopLimit);
        let fill = self.fill_price(request);

        let order = Order {
            id: id.clone(),
            broker_order_id: id.clone(),
            user_id: String::new(),
            symbol: request.symbol.clone(),
            exchange: request.exchange.clone(),
            order_type: request.order_type,
            side: request.side,
            product_type: request.product_type,
            quantity: request.quantity,
            filled_quantity: if resting { 0 } else { request.quantity },
            price: request.price,
            trigger_price: request.trigger_price,
            average_price: if resting { 0.0 } else { fill },
            status: if resting {
                OrderStatus::Open
            } else {
                OrderStatus::Completed
            },
            status_message: String::new(),
            strategy_id: None,
            leg_id: None,
            created_at: now,
            updated_at: now,
        };
        self.orders.insert(id.clone(), order);
        Ok(OrderResponse::accepted(id))
    }

    async fn modify_order(
        &self,
        order_id: &str,
        request: &ModifyOrderRequest,
    ) -> Result<OrderResponse, BrokerError> {
        self.ensure_connected()?;
        let mut entry = match self.orders.get_mut(order_id) {
            Some(entry) => entry,
            None => return Ok(OrderResponse::rejected("order not found")),
        };
        if !entry.status.is_live() {
            return Ok(OrderResponse::rejected("order is no longer live"));
        }
        if let Some(order_type) = request.order_type {
            entry.order_type = order_type;
        }
        if let Some(quantity) = request.quantity {
            entry.quantity = quantity;
        }
        if request.price.is_some() {
            entry.price = request.price;
        }
        if request.trigger_price.is_some() {
            entry.trigger_price = request.trigger_price;
        }
        entry.updated_at = Utc::now();
        Ok(OrderResponse::accepted(order_id))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderResponse, BrokerError> {
        self.ensure_connected()?;
        let mut entry = match self.orders.get_mut(order_id) {
            Some(entry) => entry,
            None => return Ok(OrderResponse::rejected("order not found")),
        };
        if !entry.status.is_live() {
            return Ok(OrderResponse::rejected("order is no longer live"));
        }
        entry.status = OrderStatus::Cancelled;
        entry.updated_at = Utc::now();
        Ok(OrderResponse::accepted(order_id))
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, BrokerError> {
        self.ensure_connected()?;
        self.orders
            .get(order_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        self.ensure_connected()?;
        Ok(self.orders())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.ensure_connected()?;
        let mut by_symbol: std::collections::HashMap<String, Position> =
            std::collections::HashMap::new();
        for entry in self.orders.iter() {
            let order = entry.value();
            if order.filled_quantity == 0 {
                continue;
            }
            let signed = match order.side {
                crate::core::OrderSide::Buy => order.filled_quantity,
                crate::core::OrderSide::Sell => -order.filled_quantity,
            };
            let last = self
                .last_prices
                .get(&order.symbol)
                .map(|p| *p)
                .unwrap_or(order.average_price);
            let position = by_symbol
                .entry(order.symbol.clone())
                .or_insert_with(|| Position {
                    symbol: order.symbol.clone(),
                    exchange: order.exchange.clone(),
                    product_type: order.product_type,
                    quantity: 0,
                    average_price: order.average_price,
                    last_price: last,
                    realized_pnl: 0.0,
                    unrealized_pnl: 0.0,
                    strategy_id: order.strategy_id.clone(),
                    timestamp: Utc::now(),
                });
            position.quantity += signed;
            position.last_price = last;
            position.unrealized_pnl =
                (position.last_price - position.average_price) * position.quantity as f64;
        }
        Ok(by_symbol.into_values().collect())
    }

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<Quote, BrokerError> {
        self.ensure_connected()?;
        let last = self
            .last_prices
            .get(symbol)
            .map(|p| *p)
            .ok_or_else(|| BrokerError::invalid("get_quote", format!("no price for {symbol}")))?;
        Ok(Quote {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            last_price: last,
            bid_price: last,
            ask_price: last,
            volume: 0,
            open_interest: 0,
            timestamp: Utc::now(),
        })
    }

    async fn subscribe_quotes(&self, instruments: &[Instrument]) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        for instrument in instruments {
            self.subscriptions.insert(instrument.subscription_key());
        }
        Ok(())
    }

    async fn unsubscribe_quotes(&self, instruments: &[Instrument]) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        for instrument in instruments {
            self.subscriptions.remove(&instrument.subscription_key());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Idempotent: closing an already-closed venue is a no-op.
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OrderSide;

    #[tokio::test]
    async fn calls_fail_fast_before_initialize() {
        let broker = PaperBroker::new("sim");
        let request = OrderRequest::market("AAPL", "NSECM", OrderSide::Buy, 10);
        let err = broker.place_order(&request).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn market_order_fills_at_seeded_price() {
        let broker = PaperBroker::new("sim");
        broker.initialize().await.unwrap();
        broker.set_last_price("AAPL", 150.0);

        let request = OrderRequest::market("AAPL", "NSECM", OrderSide::Buy, 10);
        let response = broker.place_order(&request).await.unwrap();
        assert!(response.success);

        let order = broker
            .get_order(response.order_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.average_price, 150.0);
        assert_eq!(order.filled_quantity, 10);
    }

    #[tokio::test]
    async fn stop_orders_rest_until_cancelled() {
        let broker = PaperBroker::new("sim");
        broker.initialize().await.unwrap();
        broker.set_last_price("AAPL", 150.0);

        let mut request = OrderRequest::market("AAPL", "NSECM", OrderSide::Sell, 5);
        request.order_type = OrderType::StopLoss;
        request.trigger_price = Some(140.0);
        let response = broker.place_order(&request).await.unwrap();
        let id = response.order_id.unwrap();

        let order = broker.get_order(&id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Open);

        let cancel = broker.cancel_order(&id).await.unwrap();
        assert!(cancel.success);
        let order = broker.get_order(&id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);

        // A second cancel is a venue rejection, not a hard error.
        let again = broker.cancel_order(&id).await.unwrap();
        assert!(!again.success);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = PaperBroker::new("sim");
        broker.initialize().await.unwrap();
        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn positions_derive_from_fills() {
        let broker = PaperBroker::new("sim");
        broker.initialize().await.unwrap();
        broker.set_last_price("AAPL", 100.0);

        broker
            .place_order(&OrderRequest::market("AAPL", "NSECM", OrderSide::Buy, 10))
            .await
            .unwrap();
        broker
            .place_order(&OrderRequest::market("AAPL", "NSECM", OrderSide::Sell, 4))
            .await
            .unwrap();

        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 6);
    }
}
