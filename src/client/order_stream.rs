//! Order/trade streaming client.
//!
//! Same connection discipline as the market-data client, minus subscription
//! state: the venue pushes order, trade and position updates for the
//! authenticated session unprompted. Every typed update is republished onto
//! the durable transport so downstream consumers get at-least-once delivery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::EventType;
use crate::transport::SharedEventBus;

use super::{Backoff, ClientError, RAW_CHANNEL_CAPACITY, READ_DEADLINE};

pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

pub struct OrderStreamClient {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    token: String,
    user_id: String,
    bus: SharedEventBus,
    handlers: DashMap<String, MessageHandler>,
    raw_tx: mpsc::Sender<String>,
    raw_dropped: AtomicU64,
    connected: AtomicBool,
    stopping: AtomicBool,
    writer: Mutex<Option<WsSink>>,
    reconnect_tx: mpsc::Sender<()>,
    backoff: Mutex<Backoff>,
}

impl OrderStreamClient {
    pub fn new(
        endpoint: &str,
        token: &str,
        user_id: &str,
        bus: SharedEventBus,
    ) -> (Self, mpsc::Receiver<String>) {
        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let inner = Arc::new(Inner {
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            user_id: user_id.to_string(),
            bus,
            handlers: DashMap::new(),
            raw_tx,
            raw_dropped: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            writer: Mutex::new(None),
            reconnect_tx,
            backoff: Mutex::new(Backoff::default()),
        });
        tokio::spawn(Inner::reconnect_loop(Arc::clone(&inner), reconnect_rx));
        (Self { inner }, raw_rx)
    }

    pub fn register_handler(&self, message_type: &str, handler: MessageHandler) {
        self.inner.handlers.insert(message_type.to_string(), handler);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.raw_dropped.load(Ordering::Relaxed)
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.clone().connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        let mut writer = self.inner.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        self.inner.connected.store(false, Ordering::Release);
        info!("order stream client disconnected");
    }

    #[cfg(test)]
    fn dispatch(&self, text: &str) {
        self.inner.dispatch(text);
    }
}

impl Inner {
    fn connect_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.endpoint)?;
        url.query_pairs_mut()
            .append_pair("token", &self.token)
            .append_pair("userID", &self.user_id);
        Ok(url)
    }

    async fn connect(self: Arc<Self>) -> Result<(), ClientError> {
        let url = self.connect_url()?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(ClientError::Connect)?;
        let (sink, read) = stream.split();
        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::Release);
        self.backoff.lock().await.reset();
        info!(endpoint = %self.endpoint, "order stream connected");

        tokio::spawn(Arc::clone(&self).read_loop(read));
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ) {
        loop {
            let frame = tokio::time::timeout(READ_DEADLINE, read.next()).await;
            match frame {
                Ok(Some(Ok(WsMessage::Text(text)))) => self.dispatch(&text),
                Ok(Some(Ok(WsMessage::Binary(bytes)))) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        self.dispatch(&text);
                    }
                }
                Ok(Some(Ok(WsMessage::Ping(_)))) | Ok(Some(Ok(WsMessage::Pong(_)))) => {}
                Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => {
                    warn!("order stream closed by peer");
                    break;
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "order stream read error");
                    break;
                }
                Err(_) => {
                    warn!(deadline_secs = READ_DEADLINE.as_secs(), "order stream silent past deadline");
                    break;
                }
            }
        }
        self.connected.store(false, Ordering::Release);
        if !self.stopping.load(Ordering::Acquire) {
            let _ = self.reconnect_tx.try_send(());
        }
    }

    async fn reconnect_loop(self: Arc<Self>, mut requests: mpsc::Receiver<()>) {
        while requests.recv().await.is_some() {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            loop {
                let delay = self.backoff.lock().await.next_delay();
                warn!(delay_secs = delay.as_secs(), "order stream reconnect scheduled");
                tokio::time::sleep(delay).await;
                if self.stopping.load(Ordering::Acquire) {
                    return;
                }
                match Arc::clone(&self).connect().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "order stream reconnect failed");
                    }
                }
            }
        }
    }

    /// Typed dispatch, durable republication, raw forwarding.
    fn dispatch(&self, text: &str) {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if let Some(message_type) = value.get("messageType").and_then(Value::as_str) {
                if let Some(handler) = self.handlers.get(message_type) {
                    handler(value.clone());
                }
                let event = match message_type {
                    "order" => Some(EventType::OrderUpdate),
                    "trade" => Some(EventType::OrderExecution),
                    "position" => Some(EventType::PortfolioPosition),
                    _ => {
                        debug!(message_type = %message_type, "unmapped order stream message");
                        None
                    }
                };
                if let Some(event) = event {
                    let bus = Arc::clone(&self.bus);
                    let payload = value.clone();
                    tokio::spawn(async move {
                        match event {
                            EventType::PortfolioPosition => {
                                bus.publish_portfolio_event(event, payload).await
                            }
                            _ => bus.publish_order_event(event, payload).await,
                        }
                    });
                }
            }
        }
        if self.raw_tx.try_send(text.to_string()).is_err() {
            self.raw_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("raw order stream buffer full, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EventBus, EventHandler};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn client_with_bus() -> (OrderStreamClient, mpsc::Receiver<String>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(64));
        let (client, raw) = OrderStreamClient::new(
            "wss://stream.example.test/orders",
            "session-token",
            "u1",
            bus.clone(),
        );
        (client, raw, bus)
    }

    #[tokio::test]
    async fn order_updates_are_republished_durably() {
        let (client, _raw, bus) = client_with_bus();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let handler: EventHandler = Arc::new(move |msg| {
            let counter = counter.clone();
            Box::pin(async move {
                assert_eq!(msg.message_type, "order.update");
                assert_eq!(msg.payload["orderID"], "o-42");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let worker = bus.subscribe_durable(EventType::OrderUpdate, "ledger", handler);

        client.dispatch(r#"{"messageType":"order","orderID":"o-42","status":"Filled"}"#);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
        worker.abort();
    }

    #[tokio::test]
    async fn trade_and_position_updates_map_to_their_families() {
        let (client, _raw, bus) = client_with_bus();
        let trades = Arc::new(AtomicUsize::new(0));
        let positions = Arc::new(AtomicUsize::new(0));

        let counter = trades.clone();
        let trade_handler: EventHandler = Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let counter = positions.clone();
        let position_handler: EventHandler = Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let w1 = bus.subscribe_durable(EventType::OrderExecution, "audit", trade_handler);
        let w2 = bus.subscribe_durable(EventType::PortfolioPosition, "audit", position_handler);

        client.dispatch(r#"{"messageType":"trade","tradeID":"t-1"}"#);
        client.dispatch(r#"{"messageType":"position","symbol":"AAPL"}"#);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(trades.load(Ordering::SeqCst), 1);
        assert_eq!(positions.load(Ordering::SeqCst), 1);
        w1.abort();
        w2.abort();
    }

    #[tokio::test]
    async fn registered_handlers_see_their_messages() {
        let (client, mut raw, _bus) = client_with_bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        client.register_handler(
            "order",
            Arc::new(move |value| {
                assert_eq!(value["orderID"], "o-7");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        client.dispatch(r#"{"messageType":"order","orderID":"o-7"}"#);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(raw.recv().await.unwrap().contains("o-7"));
    }

    #[tokio::test]
    async fn unknown_types_reach_only_the_raw_channel() {
        let (client, mut raw, _bus) = client_with_bus();
        client.dispatch(r#"{"messageType":"heartbeat"}"#);
        let text = raw.recv().await.unwrap();
        assert!(text.contains("heartbeat"));
    }
}
