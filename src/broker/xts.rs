//! XTS venue adapter.
//!
//! JSON REST transport. A session is opened with `appKey`/`secretKey` and the
//! returned token authorizes every subsequent call. All venue enum strings
//! are translated here and nowhere else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::core::{
    Instrument, ModifyOrderRequest, Order, OrderRequest, OrderResponse, OrderSide, OrderStatus,
    OrderType, Position, ProductType, Quote,
};

use super::{Broker, BrokerError};

#[derive(Debug, Clone)]
pub struct XtsConfig {
    pub api_key: String,
    pub api_secret: String,
    pub endpoint: String,
    pub source: String,
}

impl Default for XtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            endpoint: "https://developers.symphonyfintech.in/interactive".to_string(),
            source: "WEBAPI".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct XtsSession {
    token: String,
    user_id: String,
}

pub struct XtsBroker {
    name: String,
    config: XtsConfig,
    http: reqwest::Client,
    session: RwLock<Option<XtsSession>>,
    connected: AtomicBool,
}

/// Standard XTS response envelope.
#[derive(Debug, Deserialize)]
struct XtsEnvelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

impl XtsEnvelope {
    fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

#[derive(Debug, Deserialize)]
struct XtsLoginResult {
    token: String,
    #[serde(rename = "userID")]
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct XtsOrderIdResult {
    #[serde(rename = "AppOrderID")]
    app_order_id: Value,
}

#[derive(Debug, Deserialize)]
struct XtsOrderRecord {
    #[serde(rename = "AppOrderID")]
    app_order_id: Value,
    #[serde(rename = "ExchangeOrderID", default)]
    exchange_order_id: String,
    #[serde(rename = "ExchangeSegment", default)]
    exchange_segment: String,
    #[serde(rename = "TradingSymbol", default)]
    trading_symbol: String,
    #[serde(rename = "OrderSide", default)]
    order_side: String,
    #[serde(rename = "OrderType", default)]
    order_type: String,
    #[serde(rename = "ProductType", default)]
    product_type: String,
    #[serde(rename = "OrderQuantity", default)]
    order_quantity: i64,
    #[serde(rename = "CumulativeQuantity", default)]
    cumulative_quantity: i64,
    #[serde(rename = "OrderPrice", default)]
    order_price: f64,
    #[serde(rename = "OrderStopPrice", default)]
    order_stop_price: f64,
    #[serde(rename = "OrderAverageTradedPrice", default)]
    average_price: f64,
    #[serde(rename = "OrderStatus", default)]
    order_status: String,
    #[serde(rename = "OrderUniqueIdentifier", default)]
    unique_identifier: String,
}

#[derive(Debug, Deserialize)]
struct XtsPositionRecord {
    #[serde(rename = "TradingSymbol", default)]
    trading_symbol: String,
    #[serde(rename = "ExchangeSegment", default)]
    exchange_segment: String,
    #[serde(rename = "ProductType", default)]
    product_type: String,
    #[serde(rename = "Quantity", default)]
    quantity: i64,
    #[serde(rename = "AveragePrice", default)]
    average_price: f64,
    #[serde(rename = "LastTradedPrice", default)]
    last_traded_price: f64,
    #[serde(rename = "RealizedMTM", default)]
    realized_mtm: f64,
    #[serde(rename = "UnrealizedMTM", default)]
    unrealized_mtm: f64,
}

#[derive(Debug, Deserialize)]
struct XtsQuoteRecord {
    #[serde(rename = "TradingSymbol", default)]
    trading_symbol: String,
    #[serde(rename = "ExchangeSegment", default)]
    exchange_segment: String,
    #[serde(rename = "LastTradedPrice", default)]
    last_traded_price: f64,
    #[serde(rename = "BidPrice", default)]
    bid_price: f64,
    #[serde(rename = "AskPrice", default)]
    ask_price: f64,
    #[serde(rename = "TotalTradedQuantity", default)]
    volume: i64,
    #[serde(rename = "OpenInterest", default)]
    open_interest: i64,
}

impl XtsBroker {
    pub fn new(name: &str, config: XtsConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("default reqwest client");
        Self {
            name: name.to_string(),
            config,
            http,
            session: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self) -> Result<XtsSession, BrokerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(BrokerError::NotConnected);
        }
        self.session
            .read()
            .expect("session lock")
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn parse_envelope(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<XtsEnvelope, BrokerError> {
        response
            .json::<XtsEnvelope>()
            .await
            .map_err(|e| BrokerError::transport(operation, e))
    }

    fn result_as<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        envelope: &XtsEnvelope,
    ) -> Result<T, BrokerError> {
        serde_json::from_value(envelope.result.clone())
            .map_err(|e| BrokerError::invalid(operation, e.to_string()))
    }

    fn order_from_record(&self, record: XtsOrderRecord) -> Order {
        let now = Utc::now();
        Order {
            id: id_string(&record.app_order_id),
            broker_order_id: if record.exchange_order_id.is_empty() {
                id_string(&record.app_order_id)
            } else {
                record.exchange_order_id
            },
            user_id: record.unique_identifier,
            symbol: record.trading_symbol,
            exchange: record.exchange_segment,
            order_type: order_type_from_venue(&record.order_type),
            side: side_from_venue(&record.order_side),
            product_type: product_from_venue(&record.product_type),
            quantity: record.order_quantity,
            filled_quantity: record.cumulative_quantity,
            price: (record.order_price > 0.0).then_some(record.order_price),
            trigger_price: (record.order_stop_price > 0.0).then_some(record.order_stop_price),
            average_price: record.average_price,
            status: status_from_venue(&record.order_status),
            status_message: record.order_status,
            strategy_id: None,
            leg_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn order_payload(request: &OrderRequest) -> Value {
        let mut payload = json!({
            "exchangeSegment": request.exchange,
            "exchangeInstrumentID": request.symbol,
            "orderType": order_type_to_venue(request.order_type),
            "orderSide": side_to_venue(request.side),
            "productType": product_to_venue(request.product_type),
            "orderQuantity": request.quantity,
            "timeInForce": "DAY",
        });
        if matches!(request.order_type, OrderType::Limit | OrderType::StopLimit) {
            payload["limitPrice"] = json!(request.price.unwrap_or(0.0));
        }
        if matches!(request.order_type, OrderType::StopLoss | OrderType::StopLimit) {
            payload["stopPrice"] = json!(request.trigger_price.unwrap_or(0.0));
        }
        payload
    }
}

#[async_trait]
impl Broker for XtsBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), BrokerError> {
        let payload = json!({
            "appKey": self.config.api_key,
            "secretKey": self.config.api_secret,
            "source": self.config.source,
        });
        let response = self
            .http
            .post(self.url("/user/login"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::transport("login", e))?;
        let envelope = Self::parse_envelope("login", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::Venue {
                status: envelope.status,
                message: envelope.message,
            });
        }
        let login: XtsLoginResult = Self::result_as("login", &envelope)?;
        info!(broker = %self.name, user_id = %login.user_id, "venue session opened");
        *self.session.write().expect("session lock") = Some(XtsSession {
            token: login.token,
            user_id: login.user_id,
        });
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, BrokerError> {
        let session = self.ensure_connected()?;
        let payload = Self::order_payload(request);
        let response = self
            .http
            .post(self.url("/orders"))
            .header("Authorization", &session.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::transport("place_order", e))?;
        let envelope = Self::parse_envelope("place_order", response).await?;
        if !envelope.is_success() {
            return Ok(OrderResponse::rejected(envelope.message));
        }
        let result: XtsOrderIdResult = Self::result_as("place_order", &envelope)?;
        debug!(broker = %self.name, symbol = %request.symbol, "order accepted");
        Ok(OrderResponse::accepted(id_string(&result.app_order_id)))
    }

    async fn modify_order(
        &self,
        order_id: &str,
        request: &ModifyOrderRequest,
    ) -> Result<OrderResponse, BrokerError> {
        let session = self.ensure_connected()?;
        let mut payload = json!({ "appOrderID": order_id });
        if let Some(order_type) = request.order_type {
            payload["modifiedOrderType"] = json!(order_type_to_venue(order_type));
        }
        if let Some(quantity) = request.quantity {
            payload["modifiedOrderQuantity"] = json!(quantity);
        }
        if let Some(price) = request.price {
            payload["modifiedLimitPrice"] = json!(price);
        }
        if let Some(trigger) = request.trigger_price {
            payload["modifiedStopPrice"] = json!(trigger);
        }
        let response = self
            .http
            .put(self.url("/orders"))
            .header("Authorization", &session.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::transport("modify_order", e))?;
        let envelope = Self::parse_envelope("modify_order", response).await?;
        if !envelope.is_success() {
            return Ok(OrderResponse::rejected(envelope.message));
        }
        Ok(OrderResponse::accepted(order_id))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderResponse, BrokerError> {
        let session = self.ensure_connected()?;
        let response = self
            .http
            .delete(self.url("/orders"))
            .header("Authorization", &session.token)
            .query(&[("appOrderID", order_id)])
            .send()
            .await
            .map_err(|e| BrokerError::transport("cancel_order", e))?;
        let envelope = Self::parse_envelope("cancel_order", response).await?;
        if !envelope.is_success() {
            return Ok(OrderResponse::rejected(envelope.message));
        }
        Ok(OrderResponse::accepted(order_id))
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, BrokerError> {
        let session = self.ensure_connected()?;
        let response = self
            .http
            .get(self.url("/orders"))
            .header("Authorization", &session.token)
            .query(&[("appOrderID", order_id)])
            .send()
            .await
            .map_err(|e| BrokerError::transport("get_order", e))?;
        let envelope = Self::parse_envelope("get_order", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::OrderNotFound(order_id.to_string()));
        }
        // The venue returns the order's state history; the last entry is
        // current.
        let mut records: Vec<XtsOrderRecord> = Self::result_as("get_order", &envelope)?;
        let record = records
            .pop()
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;
        Ok(self.order_from_record(record))
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        let session = self.ensure_connected()?;
        let response = self
            .http
            .get(self.url("/orders"))
            .header("Authorization", &session.token)
            .send()
            .await
            .map_err(|e| BrokerError::transport("get_orders", e))?;
        let envelope = Self::parse_envelope("get_orders", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::invalid("get_orders", envelope.message));
        }
        let records: Vec<XtsOrderRecord> = Self::result_as("get_orders", &envelope)?;
        Ok(records
            .into_iter()
            .map(|record| self.order_from_record(record))
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let session = self.ensure_connected()?;
        let response = self
            .http
            .get(self.url("/portfolio/positions"))
            .header("Authorization", &session.token)
            .query(&[("dayOrNet", "NetWise")])
            .send()
            .await
            .map_err(|e| BrokerError::transport("get_positions", e))?;
        let envelope = Self::parse_envelope("get_positions", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::invalid("get_positions", envelope.message));
        }
        let records: Vec<XtsPositionRecord> = Self::result_as("get_positions", &envelope)?;
        Ok(records
            .into_iter()
            .map(|record| Position {
                symbol: record.trading_symbol,
                exchange: record.exchange_segment,
                product_type: product_from_venue(&record.product_type),
                quantity: record.quantity,
                average_price: record.average_price,
                last_price: record.last_traded_price,
                realized_pnl: record.realized_mtm,
                unrealized_pnl: record.unrealized_mtm,
                strategy_id: None,
                timestamp: Utc::now(),
            })
            .collect())
    }

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<Quote, BrokerError> {
        let session = self.ensure_connected()?;
        let response = self
            .http
            .get(self.url("/marketdata/quotes"))
            .header("Authorization", &session.token)
            .query(&[("exchangeSegment", exchange), ("exchangeInstrumentID", symbol)])
            .send()
            .await
            .map_err(|e| BrokerError::transport("get_quote", e))?;
        let envelope = Self::parse_envelope("get_quote", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::invalid("get_quote", envelope.message));
        }
        let record: XtsQuoteRecord = Self::result_as("get_quote", &envelope)?;
        Ok(Quote {
            symbol: if record.trading_symbol.is_empty() {
                symbol.to_string()
            } else {
                record.trading_symbol
            },
            exchange: if record.exchange_segment.is_empty() {
                exchange.to_string()
            } else {
                record.exchange_segment
            },
            last_price: record.last_traded_price,
            bid_price: record.bid_price,
            ask_price: record.ask_price,
            volume: record.volume,
            open_interest: record.open_interest,
            timestamp: Utc::now(),
        })
    }

    async fn subscribe_quotes(&self, instruments: &[Instrument]) -> Result<(), BrokerError> {
        let session = self.ensure_connected()?;
        let payload = subscription_payload(instruments);
        let response = self
            .http
            .post(self.url("/marketdata/subscription"))
            .header("Authorization", &session.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::transport("subscribe_quotes", e))?;
        let envelope = Self::parse_envelope("subscribe_quotes", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::invalid("subscribe_quotes", envelope.message));
        }
        debug!(broker = %self.name, count = instruments.len(), "subscribed instruments");
        Ok(())
    }

    async fn unsubscribe_quotes(&self, instruments: &[Instrument]) -> Result<(), BrokerError> {
        let session = self.ensure_connected()?;
        let payload = subscription_payload(instruments);
        let response = self
            .http
            .delete(self.url("/marketdata/subscription"))
            .header("Authorization", &session.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::transport("unsubscribe_quotes", e))?;
        let envelope = Self::parse_envelope("unsubscribe_quotes", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::invalid("unsubscribe_quotes", envelope.message));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Idempotent: a second close is a no-op.
        if !self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let session = self.ensure_connected()?;
        let response = self
            .http
            .delete(self.url("/user/session"))
            .header("Authorization", &session.token)
            .send()
            .await
            .map_err(|e| BrokerError::transport("logout", e))?;
        let _ = Self::parse_envelope("logout", response).await;
        *self.session.write().expect("session lock") = None;
        self.connected.store(false, Ordering::Release);
        info!(broker = %self.name, "venue session closed");
        Ok(())
    }
}

fn subscription_payload(instruments: &[Instrument]) -> Value {
    let list: Vec<Value> = instruments
        .iter()
        .map(|instrument| {
            json!({
                "exchangeSegment": instrument.exchange_segment,
                "exchangeInstrumentID": instrument.instrument_id,
            })
        })
        .collect();
    // 1501 is the venue's touchline stream.
    json!({ "instruments": list, "xtsMessageCode": 1501 })
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// Mapping tables. Unknown venue values map onto the nearest generic value
// rather than failing.

pub(crate) fn order_type_to_venue(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "STOPLOSS",
        OrderType::StopLimit => "STOPLIMIT",
    }
}

pub(crate) fn order_type_from_venue(value: &str) -> OrderType {
    match value.to_ascii_uppercase().as_str() {
        "LIMIT" => OrderType::Limit,
        "STOPLOSS" | "STOPMARKET" => OrderType::StopLoss,
        "STOPLIMIT" => OrderType::StopLimit,
        _ => OrderType::Market,
    }
}

pub(crate) fn side_to_venue(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

pub(crate) fn side_from_venue(value: &str) -> OrderSide {
    match value.to_ascii_uppercase().as_str() {
        "SELL" => OrderSide::Sell,
        _ => OrderSide::Buy,
    }
}

pub(crate) fn product_to_venue(product: ProductType) -> &'static str {
    match product {
        ProductType::Nrml => "NRML",
        ProductType::Mis => "MIS",
    }
}

pub(crate) fn product_from_venue(value: &str) -> ProductType {
    match value.to_ascii_uppercase().as_str() {
        "MIS" => ProductType::Mis,
        _ => ProductType::Nrml,
    }
}

pub(crate) fn status_to_venue(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "PendingNew",
        OrderStatus::Open => "New",
        OrderStatus::Completed => "Filled",
        OrderStatus::Cancelled => "Cancelled",
        OrderStatus::Rejected => "Rejected",
    }
}

pub(crate) fn status_from_venue(value: &str) -> OrderStatus {
    match value {
        "Filled" | "Complete" => OrderStatus::Completed,
        "New" | "Open" | "Replaced" | "PartiallyFilled" => OrderStatus::Open,
        "Cancelled" => OrderStatus::Cancelled,
        "Rejected" => OrderStatus::Rejected,
        // PendingNew, PendingReplace, PendingCancel and anything the venue
        // adds later.
        _ => OrderStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_type_round_trip() {
        for order_type in [
            OrderType::Market,
            OrderType::Limit,
            OrderType::StopLoss,
            OrderType::StopLimit,
        ] {
            assert_eq!(order_type_from_venue(order_type_to_venue(order_type)), order_type);
        }
    }

    #[test]
    fn side_round_trip() {
        for side in [OrderSide::Buy, OrderSide::Sell] {
            assert_eq!(side_from_venue(side_to_venue(side)), side);
        }
    }

    #[test]
    fn product_round_trip() {
        for product in [ProductType::Nrml, ProductType::Mis] {
            assert_eq!(product_from_venue(product_to_venue(product)), product);
        }
    }

    #[test]
    fn status_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Open,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
        ] {
            assert_eq!(status_from_venue(status_to_venue(status)), status);
        }
    }

    #[test]
    fn unknown_venue_values_map_to_defaults() {
        assert_eq!(order_type_from_venue("ICEBERG"), OrderType::Market);
        assert_eq!(side_from_venue("SHORT_EXEMPT"), OrderSide::Buy);
        assert_eq!(product_from_venue("CO"), ProductType::Nrml);
        assert_eq!(status_from_venue("Expired"), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn calls_fail_fast_before_login() {
        let broker = XtsBroker::new("xts", XtsConfig::default());
        let request = OrderRequest::market("22", "NSECM", OrderSide::Buy, 1);
        assert!(matches!(
            broker.place_order(&request).await.unwrap_err(),
            BrokerError::NotConnected
        ));
        assert!(matches!(
            broker.get_orders().await.unwrap_err(),
            BrokerError::NotConnected
        ));
    }

    #[tokio::test]
    async fn close_before_login_is_a_noop() {
        let broker = XtsBroker::new("xts", XtsConfig::default());
        assert!(broker.close().await.is_ok());
        assert!(!broker.is_connected());
    }

    #[test]
    fn order_payload_includes_prices_only_where_meaningful() {
        let market = OrderRequest::market("22", "NSECM", OrderSide::Buy, 1);
        let payload = XtsBroker::order_payload(&market);
        assert!(payload.get("limitPrice").is_none());
        assert!(payload.get("stopPrice").is_none());

        let mut stop_limit = OrderRequest::limit("22", "NSECM", OrderSide::Sell, 1, 101.5);
        stop_limit.order_type = OrderType::StopLimit;
        stop_limit.trigger_price = Some(102.0);
        let payload = XtsBroker::order_payload(&stop_limit);
        assert_eq!(payload["limitPrice"], 101.5);
        assert_eq!(payload["stopPrice"], 102.0);
        assert_eq!(payload["orderType"], "STOPLIMIT");
    }
}
