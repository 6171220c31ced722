//! Event envelope and the dotted event-type hierarchy used by the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed event families published on the bus. The dotted string is the wire
/// identity; topic and queue names are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    MarketQuote,
    MarketDepth,
    MarketOhlc,
    MarketTrade,
    OrderNew,
    OrderUpdate,
    OrderCancel,
    OrderExecution,
    PortfolioUpdate,
    PortfolioPosition,
    StrategySignal,
    StrategyExecution,
    SystemAlert,
    SystemNotification,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::MarketQuote => "market.quote",
            EventType::MarketDepth => "market.depth",
            EventType::MarketOhlc => "market.ohlc",
            EventType::MarketTrade => "market.trade",
            EventType::OrderNew => "order.new",
            EventType::OrderUpdate => "order.update",
            EventType::OrderCancel => "order.cancel",
            EventType::OrderExecution => "order.execution",
            EventType::PortfolioUpdate => "portfolio.update",
            EventType::PortfolioPosition => "portfolio.position",
            EventType::StrategySignal => "strategy.signal",
            EventType::StrategyExecution => "strategy.execution",
            EventType::SystemAlert => "system.alert",
            EventType::SystemNotification => "system.notification",
        }
    }

    /// First segment of the dotted type: `order` for `order.new`.
    pub fn family(self) -> &'static str {
        let s = self.as_str();
        s.split_once('.').map(|(family, _)| family).unwrap_or(s)
    }

    /// Everything after the family: `new` for `order.new`.
    pub fn suffix(self) -> &'static str {
        let s = self.as_str();
        s.split_once('.').map(|(_, suffix)| suffix).unwrap_or("")
    }

    /// Exchange that carries this family on the durable transport. Market
    /// data mirrors onto `market.data`; everything else lives under
    /// `<family>.events`.
    pub fn exchange(self) -> String {
        match self.family() {
            "market" => "market.data".to_string(),
            family => format!("{family}.events"),
        }
    }

    /// Routing key on the family exchange: `order.events.new`.
    pub fn routing_key(self) -> String {
        match self.family() {
            "market" => format!("market.data.{}", self.suffix()),
            family => format!("{family}.events.{}", self.suffix()),
        }
    }

    /// Durable queue name for a named consumer: `order.new.<consumer>`.
    /// Consumers of the same event type get independent queues while sharing
    /// one exchange.
    pub fn queue_name(self, consumer: &str) -> String {
        format!("{}.{consumer}", self.as_str())
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The immutable envelope every published event is wrapped in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Message {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            message_type: event_type.as_str().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
