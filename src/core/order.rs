//! Canonical order, position and quote model shared by every venue adapter.
//!
//! Venue-specific vocabularies (order-type strings, status codes, product
//! names) never leave the adapter that owns them; everything above the broker
//! layer speaks these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Product type: NRML carries overnight margin, MIS is intraday-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Nrml,
    Mis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Open,
    Completed,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Whether the order can still change state at the venue.
    pub fn is_live(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Open)
    }
}

/// A venue-agnostic trade record. Created on successful placement and mutated
/// only by status queries or execution updates; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub broker_order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub exchange: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub product_type: ProductType,
    pub quantity: i64,
    pub filled_quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    pub average_price: f64,
    pub status: OrderStatus,
    #[serde(default)]
    pub status_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leg_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_quantity(&self) -> i64 {
        self.quantity - self.filled_quantity
    }

    pub fn is_complete(&self) -> bool {
        self.filled_quantity == self.quantity
    }
}

/// Request to place an order at a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub product_type: ProductType,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: &str, exchange: &str, side: OrderSide, quantity: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            order_type: OrderType::Market,
            side,
            product_type: ProductType::Nrml,
            quantity,
            price: None,
            trigger_price: None,
        }
    }

    pub fn limit(symbol: &str, exchange: &str, side: OrderSide, quantity: i64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            order_type: OrderType::Limit,
            side,
            product_type: ProductType::Nrml,
            quantity,
            price: Some(price),
            trigger_price: None,
        }
    }
}

/// Request to modify a live order. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyOrderRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
}

/// Outcome of a place/modify/cancel call. A venue rejection is reported here
/// with `success = false` rather than as a hard error, so batch callers can
/// keep going.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl OrderResponse {
    pub fn accepted(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            message: String::new(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            message: message.into(),
        }
    }
}

/// A trading position, refreshed from venue queries. Derived state only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: String,
    pub product_type: ProductType,
    pub quantity: i64,
    pub average_price: f64,
    pub last_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn pnl(&self) -> f64 {
        self.realized_pnl + self.unrealized_pnl
    }

    /// Unrealized P&L as a percentage of the entry value. Zero when the
    /// position carries no cost basis.
    pub fn pnl_percent(&self) -> f64 {
        let basis = self.average_price * self.quantity.abs() as f64;
        if basis == 0.0 {
            return 0.0;
        }
        (self.unrealized_pnl / basis) * 100.0
    }
}

/// A market quote for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub exchange: String,
    pub last_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub volume: i64,
    pub open_interest: i64,
    pub timestamp: DateTime<Utc>,
}

/// An instrument addressed the way venues address it: exchange segment plus
/// venue instrument id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange_segment: String,
    pub instrument_id: String,
}

impl Instrument {
    pub fn new(exchange_segment: &str, instrument_id: &str) -> Self {
        Self {
            exchange_segment: exchange_segment.to_string(),
            instrument_id: instrument_id.to_string(),
        }
    }

    /// Key under which a subscription to this instrument is tracked.
    pub fn subscription_key(&self) -> String {
        format!("{}:{}", self.exchange_segment, self.instrument_id)
    }

    /// Parses a tracked subscription key back into an instrument. Instrument
    /// ids may themselves contain `:`; only the first separator splits.
    pub fn from_subscription_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(2, ':');
        let segment = parts.next()?;
        let id = parts.next()?;
        if segment.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(segment, id))
    }
}
