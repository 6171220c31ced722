//! Market-data streaming client.
//!
//! One persistent WebSocket authenticated through URL parameters. Inbound
//! messages dispatch by their `messageType` to registered handlers and are
//! always forwarded raw to a bounded channel; a full channel drops the
//! message and counts it. On connection loss the client reconnects with
//! exponential backoff and replays every tracked subscription.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::{EventType, Instrument};
use crate::transport::SharedEventBus;

use super::{Backoff, ClientError, RAW_CHANNEL_CAPACITY, READ_DEADLINE};

pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

pub struct MarketDataClient {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    token: String,
    user_id: String,
    bus: SharedEventBus,
    handlers: DashMap<String, MessageHandler>,
    /// Tracked `segment:instrument` keys, replayed after reconnect.
    subscriptions: DashSet<String>,
    raw_tx: mpsc::Sender<String>,
    raw_dropped: AtomicU64,
    connected: AtomicBool,
    stopping: AtomicBool,
    writer: Mutex<Option<WsSink>>,
    reconnect_tx: mpsc::Sender<()>,
    backoff: Mutex<Backoff>,
}

impl MarketDataClient {
    /// Builds the client and hands back the raw-message channel. The client
    /// stays offline until [`connect`](Self::connect).
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
            subscriptions: DashSet::new(),
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

    /// Registers a handler for one `messageType`. Unhandled types still reach
    /// the raw channel.
    pub fn register_handler(&self, message_type: &str, handler: MessageHandler) {
        self.inner.handlers.insert(message_type.to_string(), handler);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Raw messages dropped because the delivery buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.inner.raw_dropped.load(Ordering::Relaxed)
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.clone().connect().await
    }

    /// Subscribes to the given instruments and tracks them for replay.
    pub async fn subscribe(&self, instruments: &[Instrument]) -> Result<(), ClientError> {
        for instrument in instruments {
            self.inner.subscriptions.insert(instrument.subscription_key());
        }
        if self.is_connected() {
            for instrument in instruments {
                self.inner.send_subscribe(instrument, true).await?;
            }
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, instruments: &[Instrument]) -> Result<(), ClientError> {
        for instrument in instruments {
            self.inner.subscriptions.remove(&instrument.subscription_key());
        }
        if self.is_connected() {
            for instrument in instruments {
                self.inner.send_subscribe(instrument, false).await?;
            }
        }
        Ok(())
    }

    /// Instruments currently tracked, parsed back out of the key set.
    pub fn subscribed_instruments(&self) -> Vec<Instrument> {
        self.inner.subscribed_instruments()
    }

    /// Graceful shutdown: close frame, socket teardown, loops stopped.
    /// Idempotent.
    pub async fn disconnect(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        let mut writer = self.inner.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        self.inner.connected.store(false, Ordering::Release);
        info!("market data client disconnected");
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
        info!(endpoint = %self.endpoint, "market data stream connected");

        tokio::spawn(Arc::clone(&self).read_loop(read));
        Ok(())
    }

    /// Reads until error, close, or silence past the deadline, then requests
    /// a reconnect unless a deliberate disconnect is in progress.
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
                    warn!("market data stream closed by peer");
                    break;
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "market data read error");
                    break;
                }
                Err(_) => {
                    warn!(deadline_secs = READ_DEADLINE.as_secs(), "market data stream silent past deadline");
                    break;
                }
            }
        }
        self.connected.store(false, Ordering::Release);
        if !self.stopping.load(Ordering::Acquire) {
            // A full slot means a reconnect is already pending.
            let _ = self.reconnect_tx.try_send(());
        }
    }

    /// Waits out the backoff, re-connects, then replays every tracked
    /// subscription. Retries forever; only a deliberate disconnect ends it.
    async fn reconnect_loop(self: Arc<Self>, mut requests: mpsc::Receiver<()>) {
        while requests.recv().await.is_some() {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            loop {
                let delay = self.backoff.lock().await.next_delay();
                warn!(delay_secs = delay.as_secs(), "market data reconnect scheduled");
                tokio::time::sleep(delay).await;
                if self.stopping.load(Ordering::Acquire) {
                    return;
                }
                match Arc::clone(&self).connect().await {
                    Ok(()) => {
                        let replayed = self.resubscribe_all().await;
                        info!(replayed, "market data subscriptions replayed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "market data reconnect failed");
                    }
                }
            }
        }
    }

    fn subscribed_instruments(&self) -> Vec<Instrument> {
        self.subscriptions
            .iter()
            .filter_map(|key| Instrument::from_subscription_key(key.key()))
            .collect()
    }

    /// One subscribe request per tracked instrument. Returns how many were
    /// replayed.
    async fn resubscribe_all(&self) -> usize {
        let instruments = self.subscribed_instruments();
        let mut replayed = 0;
        for instrument in &instruments {
            match self.send_subscribe(instrument, true).await {
                Ok(()) => replayed += 1,
                Err(e) => {
                    warn!(
                        instrument = %instrument.subscription_key(),
                        error = %e,
                        "resubscription failed"
                    );
                }
            }
        }
        replayed
    }

    async fn send_subscribe(
        &self,
        instrument: &Instrument,
        subscribe: bool,
    ) -> Result<(), ClientError> {
        let payload = json!({
            "messageType": if subscribe { "subscribe" } else { "unsubscribe" },
            "exchangeSegment": instrument.exchange_segment,
            "instrumentID": instrument.instrument_id,
        });
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ClientError::NotConnected)?;
        sink.send(WsMessage::Text(payload.to_string()))
            .await
            .map_err(ClientError::Connect)?;
        Ok(())
    }

    /// Typed dispatch plus unconditional raw forwarding. A full raw channel
    /// drops the message and counts the drop.
    fn dispatch(&self, text: &str) {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if let Some(message_type) = value.get("messageType").and_then(Value::as_str) {
                if let Some(handler) = self.handlers.get(message_type) {
                    handler(value.clone());
                } else {
                    debug!(message_type = %message_type, "no handler registered");
                }
                if message_type == "quote" || message_type == "tick" {
                    let bus = Arc::clone(&self.bus);
                    let payload = value.clone();
                    tokio::spawn(async move {
                        bus.publish_market_data(EventType::MarketQuote, payload).await;
                    });
                }
            }
        }
        if self.raw_tx.try_send(text.to_string()).is_err() {
            self.raw_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("raw market data buffer full, message dropped");
        }
    }
}
