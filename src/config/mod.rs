//! Service configuration, loaded from a JSON file.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub brokers: Vec<BrokerConfig>,
    pub market_data: StreamConfig,
    pub order_stream: StreamConfig,
    pub bus: BusConfig,
    pub engine: EngineConfig,
}

/// One venue adapter registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub name: String,
    /// Adapter kind: `paper`, `xts` or `zerodha`.
    pub kind: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Capacity of the low-latency market data channel.
    pub market_capacity: usize,
    /// Durable-queue consumer name for this service instance.
    pub consumer_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default settlement window between sequential legs, seconds.
    pub settle_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            brokers: vec![BrokerConfig {
                name: "paper".to_string(),
                kind: "paper".to_string(),
                api_key: String::new(),
                api_secret: String::new(),
                endpoint: String::new(),
                user_id: String::new(),
            }],
            market_data: StreamConfig {
                url: "wss://localhost:3001/marketdata".to_string(),
                token: String::new(),
                user_id: String::new(),
                enabled: false,
            },
            order_stream: StreamConfig {
                url: "wss://localhost:3001/orders".to_string(),
                token: String::new(),
                user_id: String::new(),
                enabled: false,
            },
            bus: BusConfig {
                market_capacity: 1024,
                consumer_name: "kestrel".to_string(),
            },
            engine: EngineConfig {
                settle_window_secs: 1,
            },
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Loads `path`, falling back to development defaults when the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path, error = %e, "config not loaded, using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string_pretty(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = Config::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.brokers.len(), 1);
        assert_eq!(loaded.brokers[0].kind, "paper");
        assert_eq!(loaded.bus.market_capacity, 1024);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("/nonexistent/kestrel.json");
        assert_eq!(config.bus.consumer_name, "kestrel");
        assert!(!config.market_data.enabled);
    }

    #[test]
    fn partial_files_use_field_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "brokers": [{"name": "sim", "kind": "paper"}],
                "market_data": {"url": "wss://x/md", "enabled": true},
                "order_stream": {"url": "wss://x/orders", "enabled": false},
                "bus": {"market_capacity": 64, "consumer_name": "test"},
                "engine": {"settle_window_secs": 2}
            }"#,
        )
        .unwrap();

        let loaded = Config::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.brokers[0].name, "sim");
        assert!(loaded.brokers[0].api_key.is_empty());
        assert!(loaded.market_data.enabled);
    }
}
