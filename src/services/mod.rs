//! Stateless service façades over the broker layer.

pub mod order_service;

pub use order_service::{OrderService, OrderServiceError};
