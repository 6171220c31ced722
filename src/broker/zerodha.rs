//! Zerodha venue adapter.
//!
//! Authentication is the venue's two-step flow: the caller first obtains a
//! request token from the hosted login page, then `initialize` exchanges it
//! for an access token. Without a request token, `initialize` fails with the
//! login URL in the error so the caller can complete the first step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::{
    Instrument, ModifyOrderRequest, Order, OrderRequest, OrderResponse, OrderSide, OrderStatus,
    OrderType, Position, ProductType, Quote,
};

use super::{Broker, BrokerError};

#[derive(Debug, Clone)]
pub struct ZerodhaConfig {
    pub api_key: String,
    pub api_secret: String,
    /// Obtained interactively from the hosted login page.
    pub request_token: String,
    pub endpoint: String,
}

impl Default for ZerodhaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            request_token: String::new(),
            endpoint: "https://api.kite.trade".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ZerodhaSession {
    access_token: String,
    user_id: String,
}

pub struct ZerodhaBroker {
    name: String,
    config: ZerodhaConfig,
    http: reqwest::Client,
    session: RwLock<Option<ZerodhaSession>>,
    connected: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct KiteEnvelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

impl KiteEnvelope {
    fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[derive(Debug, Deserialize)]
struct KiteSessionData {
    access_token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct KiteOrderIdData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct KiteOrderRecord {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    exchange_order_id: Option<String>,
    #[serde(default)]
    exchange: String,
    #[serde(default)]
    tradingsymbol: String,
    #[serde(default)]
    transaction_type: String,
    #[serde(default)]
    order_type: String,
    #[serde(default)]
    product: String,
    #[serde(default)]
    quantity: i64,
    #[serde(default)]
    filled_quantity: i64,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    trigger_price: f64,
    #[serde(default)]
    average_price: f64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    status_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KitePositionsData {
    #[serde(default)]
    net: Vec<KitePositionRecord>,
}

#[derive(Debug, Deserialize)]
struct KitePositionRecord {
    #[serde(default)]
    tradingsymbol: String,
    #[serde(default)]
    exchange: String,
    #[serde(default)]
    product: String,
    #[serde(default)]
    quantity: i64,
    #[serde(default)]
    average_price: f64,
    #[serde(default)]
    last_price: f64,
    #[serde(default)]
    realised: f64,
    #[serde(default)]
    unrealised: f64,
}

#[derive(Debug, Deserialize)]
struct KiteQuoteRecord {
    #[serde(default)]
    last_price: f64,
    #[serde(default)]
    volume: i64,
    #[serde(default)]
    oi: i64,
    #[serde(default)]
    depth: KiteDepth,
}

#[derive(Debug, Default, Deserialize)]
struct KiteDepth {
    #[serde(default)]
    buy: Vec<KiteDepthLevel>,
    #[serde(default)]
    sell: Vec<KiteDepthLevel>,
}

#[derive(Debug, Default, Deserialize)]
struct KiteDepthLevel {
    #[serde(default)]
    price: f64,
}

impl ZerodhaBroker {
    pub fn new(name: &str, config: ZerodhaConfig) -> Self {
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

    /// Hosted login page the user must visit to mint a request token.
    pub fn login_url(&self) -> String {
        format!(
            "https://kite.trade/connect/login?v=3&api_key={}",
            self.config.api_key
        )
    }

    fn ensure_connected(&self) -> Result<ZerodhaSession, BrokerError> {
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

    fn auth_header(&self, session: &ZerodhaSession) -> String {
        format!("token {}:{}", self.config.api_key, session.access_token)
    }

    async fn parse_envelope(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<KiteEnvelope, BrokerError> {
        response
            .json::<KiteEnvelope>()
            .await
            .map_err(|e| BrokerError::transport(operation, e))
    }

    fn data_as<T: serde::de::DeserializeOwned>(
        operation: &'static str,
        envelope: &KiteEnvelope,
    ) -> Result<T, BrokerError> {
        serde_json::from_value(envelope.data.clone())
            .map_err(|e| BrokerError::invalid(operation, e.to_string()))
    }

    fn order_from_record(record: KiteOrderRecord) -> Order {
        let now = Utc::now();
        Order {
            id: record.order_id.clone(),
            broker_order_id: record.exchange_order_id.unwrap_or(record.order_id),
            user_id: String::new(),
            symbol: record.tradingsymbol,
            exchange: exchange_from_venue(&record.exchange),
            order_type: order_type_from_venue(&record.order_type),
            side: side_from_venue(&record.transaction_type),
            product_type: product_from_venue(&record.product),
            quantity: record.quantity,
            filled_quantity: record.filled_quantity,
            price: (record.price > 0.0).then_some(record.price),
            trigger_price: (record.trigger_price > 0.0).then_some(record.trigger_price),
            average_price: record.average_price,
            status: status_from_venue(&record.status),
            status_message: record.status_message.unwrap_or_default(),
            strategy_id: None,
            leg_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn order_form(request: &OrderRequest) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("exchange", exchange_to_venue(&request.exchange).to_string()),
            ("tradingsymbol", request.symbol.clone()),
            ("transaction_type", side_to_venue(request.side).to_string()),
            ("order_type", order_type_to_venue(request.order_type).to_string()),
            ("product", product_to_venue(request.product_type).to_string()),
            ("quantity", request.quantity.to_string()),
            ("validity", "DAY".to_string()),
        ];
        if matches!(request.order_type, OrderType::Limit | OrderType::StopLimit) {
            form.push(("price", request.price.unwrap_or(0.0).to_string()));
        }
        if matches!(request.order_type, OrderType::StopLoss | OrderType::StopLimit) {
            form.push(("trigger_price", request.trigger_price.unwrap_or(0.0).to_string()));
        }
        form
    }
}

#[async_trait]
impl Broker for ZerodhaBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), BrokerError> {
        if self.config.request_token.is_empty() {
            // Two-step flow: the caller has to visit the login page first.
            return Err(BrokerError::Venue {
                status: "login_required".to_string(),
                message: format!("visit {} to obtain a request token", self.login_url()),
            });
        }
        let form = [
            ("api_key", self.config.api_key.as_str()),
            ("request_token", self.config.request_token.as_str()),
            ("api_secret", self.config.api_secret.as_str()),
        ];
        let response = self
            .http
            .post(self.url("/session/token"))
            .form(&form)
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
        let data: KiteSessionData = Self::data_as("login", &envelope)?;
        info!(broker = %self.name, user_id = %data.user_id, "venue session opened");
        *self.session.write().expect("session lock") = Some(ZerodhaSession {
            access_token: data.access_token,
            user_id: data.user_id,
        });
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, BrokerError> {
        let session = self.ensure_connected()?;
        let response = self
            .http
            .post(self.url("/orders/regular"))
            .header("Authorization", self.auth_header(&session))
            .form(&Self::order_form(request))
            .send()
            .await
            .map_err(|e| BrokerError::transport("place_order", e))?;
        let envelope = Self::parse_envelope("place_order", response).await?;
        if !envelope.is_success() {
            return Ok(OrderResponse::rejected(envelope.message));
        }
        let data: KiteOrderIdData = Self::data_as("place_order", &envelope)?;
        debug!(broker = %self.name, symbol = %request.symbol, "order accepted");
        Ok(OrderResponse::accepted(data.order_id))
    }

    async fn modify_order(
        &self,
        order_id: &str,
        request: &ModifyOrderRequest,
    ) -> Result<OrderResponse, BrokerError> {
        let session = self.ensure_connected()?;
        let mut form: Vec<(&str, String)> = Vec::new();
        if let Some(order_type) = request.order_type {
            form.push(("order_type", order_type_to_venue(order_type).to_string()));
        }
        if let Some(quantity) = request.quantity {
            form.push(("quantity", quantity.to_string()));
        }
        if let Some(price) = request.price {
            form.push(("price", price.to_string()));
        }
        if let Some(trigger) = request.trigger_price {
            form.push(("trigger_price", trigger.to_string()));
        }
        let response = self
            .http
            .put(self.url(&format!("/orders/regular/{order_id}")))
            .header("Authorization", self.auth_header(&session))
            .form(&form)
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
            .delete(self.url(&format!("/orders/regular/{order_id}")))
            .header("Authorization", self.auth_header(&session))
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
            .get(self.url(&format!("/orders/{order_id}")))
            .header("Authorization", self.auth_header(&session))
            .send()
            .await
            .map_err(|e| BrokerError::transport("get_order", e))?;
        let envelope = Self::parse_envelope("get_order", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::OrderNotFound(order_id.to_string()));
        }
        // The venue answers with the order's state history; last entry wins.
        let mut records: Vec<KiteOrderRecord> = Self::data_as("get_order", &envelope)?;
        let record = records
            .pop()
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;
        Ok(Self::order_from_record(record))
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        let session = self.ensure_connected()?;
        let response = self
            .http
            .get(self.url("/orders"))
            .header("Authorization", self.auth_header(&session))
            .send()
            .await
            .map_err(|e| BrokerError::transport("get_orders", e))?;
        let envelope = Self::parse_envelope("get_orders", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::invalid("get_orders", envelope.message));
        }
        let records: Vec<KiteOrderRecord> = Self::data_as("get_orders", &envelope)?;
        Ok(records.into_iter().map(Self::order_from_record).collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let session = self.ensure_connected()?;
        let response = self
            .http
            .get(self.url("/portfolio/positions"))
            .header("Authorization", self.auth_header(&session))
            .send()
            .await
            .map_err(|e| BrokerError::transport("get_positions", e))?;
        let envelope = Self::parse_envelope("get_positions", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::invalid("get_positions", envelope.message));
        }
        let data: KitePositionsData = Self::data_as("get_positions", &envelope)?;
        Ok(data
            .net
            .into_iter()
            .map(|record| Position {
                symbol: record.tradingsymbol,
                exchange: exchange_from_venue(&record.exchange),
                product_type: product_from_venue(&record.product),
                quantity: record.quantity,
                average_price: record.average_price,
                last_price: record.last_price,
                realized_pnl: record.realised,
                unrealized_pnl: record.unrealised,
                strategy_id: None,
                timestamp: Utc::now(),
            })
            .collect())
    }

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<Quote, BrokerError> {
        let session = self.ensure_connected()?;
        let key = format!("{}:{}", exchange_to_venue(exchange), symbol);
        let response = self
            .http
            .get(self.url("/quote"))
            .header("Authorization", self.auth_header(&session))
            .query(&[("i", key.as_str())])
            .send()
            .await
            .map_err(|e| BrokerError::transport("get_quote", e))?;
        let envelope = Self::parse_envelope("get_quote", response).await?;
        if !envelope.is_success() {
            return Err(BrokerError::invalid("get_quote", envelope.message));
        }
        let quotes: std::collections::HashMap<String, KiteQuoteRecord> =
            Self::data_as("get_quote", &envelope)?;
        let record = quotes
            .into_values()
            .next()
            .ok_or_else(|| BrokerError::invalid("get_quote", format!("no quote for {key}")))?;
        Ok(Quote {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            last_price: record.last_price,
            bid_price: record.depth.buy.first().map(|l| l.price).unwrap_or(0.0),
            ask_price: record.depth.sell.first().map(|l| l.price).unwrap_or(0.0),
            volume: record.volume,
            open_interest: record.oi,
            timestamp: Utc::now(),
        })
    }

    async fn subscribe_quotes(&self, _instruments: &[Instrument]) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        Err(BrokerError::NotImplemented("real-time quote subscription"))
    }

    async fn unsubscribe_quotes(&self, _instruments: &[Instrument]) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        Err(BrokerError::NotImplemented("real-time quote subscription"))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let session = self.ensure_connected()?;
        let response = self
            .http
            .delete(self.url("/session/token"))
            .header("Authorization", self.auth_header(&session))
            .query(&[("api_key", self.config.api_key.as_str())])
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

// Mapping tables. The canonical exchange segments follow the interactive
// venue's vocabulary; this venue uses shorter names.

pub(crate) fn exchange_to_venue(segment: &str) -> &str {
    match segment {
        "NSECM" => "NSE",
        "BSECM" => "BSE",
        "NSEFO" => "NFO",
        "BSEFO" => "BFO",
        "NSECD" => "CDS",
        "MCXFO" => "MCX",
        other => other,
    }
}

pub(crate) fn exchange_from_venue(exchange: &str) -> String {
    match exchange {
        "NSE" => "NSECM",
        "BSE" => "BSECM",
        "NFO" => "NSEFO",
        "BFO" => "BSEFO",
        "CDS" => "NSECD",
        "MCX" => "MCXFO",
        other => other,
    }
    .to_string()
}

pub(crate) fn order_type_to_venue(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        // SL-M triggers into a market order, SL triggers into a limit order.
        OrderType::StopLoss => "SL-M",
        OrderType::StopLimit => "SL",
    }
}

pub(crate) fn order_type_from_venue(value: &str) -> OrderType {
    match value {
        "LIMIT" => OrderType::Limit,
        "SL-M" => OrderType::StopLoss,
        "SL" => OrderType::StopLimit,
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
    match value {
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
    match value {
        "MIS" => ProductType::Mis,
        _ => ProductType::Nrml,
    }
}

pub(crate) fn status_to_venue(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "PENDING",
        OrderStatus::Open => "OPEN",
        OrderStatus::Completed => "COMPLETE",
        OrderStatus::Cancelled => "CANCELLED",
        OrderStatus::Rejected => "REJECTED",
    }
}

pub(crate) fn status_from_venue(value: &str) -> OrderStatus {
    match value {
        "COMPLETE" => OrderStatus::Completed,
        "OPEN" | "TRIGGER PENDING" => OrderStatus::Open,
        "CANCELLED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        // PENDING, PUT ORDER REQ RECEIVED, VALIDATION PENDING, and anything
        // the venue adds later.
        _ => OrderStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_segment_round_trip() {
        for segment in ["NSECM", "BSECM", "NSEFO", "BSEFO", "NSECD", "MCXFO"] {
            assert_eq!(exchange_from_venue(exchange_to_venue(segment)), segment);
        }
        // Unknown segments pass through unchanged.
        assert_eq!(exchange_to_venue("NYSE"), "NYSE");
        assert_eq!(exchange_from_venue("NYSE"), "NYSE");
    }

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
        assert_eq!(order_type_from_venue("AMO"), OrderType::Market);
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
        assert_eq!(status_from_venue("VALIDATION PENDING"), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn initialize_without_request_token_returns_login_url() {
        let broker = ZerodhaBroker::new(
            "zerodha",
            ZerodhaConfig {
                api_key: "key".into(),
                ..ZerodhaConfig::default()
            },
        );
        let err = broker.initialize().await.unwrap_err();
        match err {
            BrokerError::Venue { status, message } => {
                assert_eq!(status, "login_required");
                assert!(message.contains("api_key=key"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn quote_subscription_is_not_implemented() {
        let broker = ZerodhaBroker::new("zerodha", ZerodhaConfig::default());
        // Force the connected state so we get past the session guard.
        broker.connected.store(true, Ordering::Release);
        *broker.session.write().unwrap() = Some(ZerodhaSession {
            access_token: "t".into(),
            user_id: "u".into(),
        });
        let err = broker.subscribe_quotes(&[]).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotImplemented(_)));
    }
}
