//! Broker adapter abstraction.
//!
//! Each venue implements [`Broker`] against the canonical model; translation
//! of venue vocabularies happens entirely inside the adapter. The registry
//! resolves which venue handles a request by name.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::core::{
    Instrument, ModifyOrderRequest, Order, OrderRequest, OrderResponse, Position, Quote,
};

pub mod paper;
pub mod xts;
pub mod zerodha;

pub use paper::PaperBroker;
pub use xts::XtsBroker;
pub use zerodha::ZerodhaBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// An adapter method was called before a successful `initialize`.
    #[error("broker not connected, call initialize first")]
    NotConnected,

    /// Optional capability unsupported by this venue.
    #[error("{0} is not implemented by this broker")]
    NotImplemented(&'static str),

    /// The venue refused a session-level request (login, logout).
    #[error("venue returned {status}: {message}")]
    Venue { status: String, message: String },

    /// HTTP-level failure, wrapped with the operation that hit it.
    #[error("transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The venue answered with something the adapter could not interpret.
    #[error("invalid venue response during {operation}: {detail}")]
    InvalidResponse {
        operation: &'static str,
        detail: String,
    },

    #[error("unknown broker: {0}")]
    UnknownBroker(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),
}

impl BrokerError {
    pub(crate) fn transport(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Transport { operation, source }
    }

    pub(crate) fn invalid(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidResponse {
            operation,
            detail: detail.into(),
        }
    }
}

/// The fixed capability surface every venue adapter provides.
///
/// `initialize` authenticates and flips the adapter into the connected state;
/// every other call fails fast with [`BrokerError::NotConnected`] until then.
/// `close` invalidates the session and is idempotent. A venue rejection of an
/// order is reported through [`OrderResponse`] with `success = false`, never
/// as an `Err`.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, BrokerError>;

    async fn modify_order(
        &self,
        order_id: &str,
        request: &ModifyOrderRequest,
    ) -> Result<OrderResponse, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<OrderResponse, BrokerError>;

    async fn get_order(&self, order_id: &str) -> Result<Order, BrokerError>;

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<Quote, BrokerError>;

    async fn subscribe_quotes(&self, instruments: &[Instrument]) -> Result<(), BrokerError>;

    async fn unsubscribe_quotes(&self, instruments: &[Instrument]) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Named lookup from adapter identifier to adapter instance.
#[derive(Default)]
pub struct BrokerRegistry {
    brokers: DashMap<String, Arc<dyn Broker>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, broker: Arc<dyn Broker>) {
        tracing::info!(broker = %name, "registered broker adapter");
        self.brokers.insert(name.to_string(), broker);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        self.brokers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::UnknownBroker(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.brokers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_resolves_registered_brokers() {
        let registry = BrokerRegistry::new();
        let paper = Arc::new(PaperBroker::new("sim"));
        registry.register("sim", paper);

        assert!(registry.get("sim").is_ok());
        match registry.get("missing") {
            Err(err) => assert!(matches!(err, BrokerError::UnknownBroker(name) if name == "missing")),
            Ok(_) => panic!("expected UnknownBroker error"),
        }
    }
}
