//! Reconnecting real-time clients.
//!
//! Both clients hold one persistent WebSocket apiece, dispatch typed
//! messages to registered handlers, and recover from connection loss with
//! exponential backoff. Only an explicit disconnect is terminal.

use std::time::Duration;

use thiserror::Error;

pub mod market_data;
pub mod order_stream;

pub use market_data::MarketDataClient;
pub use order_stream::OrderStreamClient;

/// A silent peer past this deadline counts as a dead connection.
pub(crate) const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Raw-message delivery buffer. Full means drop, not block.
pub(crate) const RAW_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error("websocket connect failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("client is not connected")]
    NotConnected,
}

/// Reconnect wait policy: start at one second, double per failure, cap at
/// thirty, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The wait before the next attempt. Each call doubles the following
    /// wait, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        // Non-decreasing throughout.
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn success_resets_to_the_initial_delay() {
        let mut backoff = Backoff::default();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
