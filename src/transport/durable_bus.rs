//! Durable topic/queue transport.
//!
//! An in-process exchange with named durable queues bound by routing key.
//! Consumers acknowledge by returning `Ok`; a failed handler negatively
//! acknowledges and the message is requeued at the front, so delivery is
//! at-least-once per queue. Multiple consumers of the same event family
//! coexist on independent queues bound to one exchange.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::Message;

/// Handler a consumer runs per delivery. `Ok` acks, `Err` nacks with requeue.
pub type EventHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Delay before a nacked message is redelivered.
const REDELIVERY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct QueueInner {
    pending: Mutex<VecDeque<Message>>,
    notify: Notify,
    delivered: AtomicU64,
    redelivered: AtomicU64,
}

impl QueueInner {
    async fn push(&self, message: Message) {
        self.pending.lock().await.push_back(message);
        self.notify.notify_one();
    }

    async fn requeue(&self, message: Message) {
        self.pending.lock().await.push_front(message);
        self.redelivered.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Message {
        loop {
            if let Some(message) = self.pending.lock().await.pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

struct Binding {
    routing_key: String,
    queue: Arc<QueueInner>,
}

#[derive(Default)]
pub struct DurableBus {
    /// exchange name -> bindings
    exchanges: DashMap<String, Vec<Binding>>,
    /// queue name -> queue
    queues: DashMap<String, Arc<QueueInner>>,
}

impl DurableBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declaring an exchange twice is a no-op, as with any durable broker.
    pub fn declare_exchange(&self, name: &str) {
        self.exchanges.entry(name.to_string()).or_default();
    }

    /// Declares `queue` (if new) and binds it to `exchange` under
    /// `routing_key`.
    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) {
        let inner = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueInner::default()))
            .clone();
        let mut bindings = self.exchanges.entry(exchange.to_string()).or_default();
        let already_bound = bindings
            .iter()
            .any(|b| b.routing_key == routing_key && Arc::ptr_eq(&b.queue, &inner));
        if !already_bound {
            bindings.push(Binding {
                routing_key: routing_key.to_string(),
                queue: inner,
            });
        }
        debug!(queue, exchange, routing_key, "queue bound");
    }

    /// Copies the message into every queue bound under `routing_key`.
    pub async fn publish(&self, exchange: &str, routing_key: &str, message: Message) {
        let targets: Vec<Arc<QueueInner>> = match self.exchanges.get(exchange) {
            Some(bindings) => bindings
                .iter()
                .filter(|b| b.routing_key == routing_key)
                .map(|b| Arc::clone(&b.queue))
                .collect(),
            None => Vec::new(),
        };
        for queue in targets {
            queue.push(message.clone()).await;
        }
    }

    /// Spawns a consumer loop over `queue`. The loop delivers messages one at
    /// a time; a handler error requeues the message and retries after a short
    /// delay, so a consumer never silently loses an event.
    pub fn consume(&self, queue: &str, consumer: &str, handler: EventHandler) -> JoinHandle<()> {
        let inner = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueInner::default()))
            .clone();
        let queue = queue.to_string();
        let consumer = consumer.to_string();
        tokio::spawn(async move {
            loop {
                let message = inner.pop().await;
                inner.delivered.fetch_add(1, Ordering::Relaxed);
                match handler(message.clone()).await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(
                            queue = %queue,
                            consumer = %consumer,
                            message_type = %message.message_type,
                            error = %e,
                            "handler failed, requeueing message"
                        );
                        inner.requeue(message).await;
                        tokio::time::sleep(REDELIVERY_DELAY).await;
                    }
                }
            }
        })
    }

    /// Messages currently waiting in `queue`.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        match self.queues.get(queue) {
            Some(inner) => inner.pending.lock().await.len(),
            None => 0,
        }
    }

    pub fn redelivered_count(&self, queue: &str) -> u64 {
        self.queues
            .get(queue)
            .map(|inner| inner.redelivered.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
