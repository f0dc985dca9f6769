//! Configuration for an interbank node

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This bank
    pub bank: BankConfig,

    /// Counterparty bank
    pub peer: PeerConfig,

    /// Valuation oracle
    pub oracle: OracleConfig,

    /// Outbound delivery
    pub delivery: DeliveryConfig,

    /// Webhook server
    pub server: ServerConfig,

    /// Event store database (in-memory store when absent)
    pub database: DatabaseConfig,

    /// Logging
    pub logging: LoggingConfig,
}

/// This bank's identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BankConfig {
    /// Routing number, also the prefix of every local account number
    pub routing_number: u32,

    /// Key peers must present in `X-Api-Key`
    pub api_key: String,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            routing_number: 111,
            api_key: "change-me".to_string(),
        }
    }
}

/// Counterparty bank
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Counterparty routing number
    pub routing_number: u32,

    /// Counterparty webhook URL
    pub url: String,

    /// Key this bank presents to the counterparty
    pub api_key: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            routing_number: 222,
            url: "http://localhost:8082/interbank".to_string(),
            api_key: "change-me".to_string(),
        }
    }
}

/// Valuation oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Oracle endpoint
    pub url: String,

    /// Request timeout (milliseconds)
    pub timeout_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/interbank".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl OracleConfig {
    /// Per-request timeout for votes and commit notifications
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry policy for outbound messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per event, first one included
    pub max_attempts: u32,

    /// Fixed delay between attempts (milliseconds)
    pub retry_delay_ms: u64,

    /// Per-attempt HTTP timeout (milliseconds)
    pub request_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_ms: 20_000, // 20s
            request_timeout_ms: 10_000,
        }
    }
}

impl DeliveryConfig {
    /// Delay between attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Per-attempt timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Webhook server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,

    /// Public URL peers reach this node's webhook at, reported by `/health`
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8081".to_string(),
            public_url: "http://localhost:8081/interbank".to_string(),
        }
    }
}

/// Event store database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL
    pub url: Option<String>,

    /// Pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(v) = std::env::var("INTERBANK_ROUTING_NUMBER") {
            self.bank.routing_number = parse_var("INTERBANK_ROUTING_NUMBER", &v)?;
        }
        if let Ok(v) = std::env::var("INTERBANK_API_KEY") {
            self.bank.api_key = v;
        }
        if let Ok(v) = std::env::var("INTERBANK_PEER_ROUTING_NUMBER") {
            self.peer.routing_number = parse_var("INTERBANK_PEER_ROUTING_NUMBER", &v)?;
        }
        if let Ok(v) = std::env::var("INTERBANK_PEER_URL") {
            self.peer.url = v;
        }
        if let Ok(v) = std::env::var("INTERBANK_PEER_API_KEY") {
            self.peer.api_key = v;
        }
        if let Ok(v) = std::env::var("INTERBANK_ORACLE_URL") {
            self.oracle.url = v;
        }
        if let Ok(v) = std::env::var("INTERBANK_ORACLE_TIMEOUT_MS") {
            self.oracle.timeout_ms = parse_var("INTERBANK_ORACLE_TIMEOUT_MS", &v)?;
        }
        if let Ok(v) = std::env::var("INTERBANK_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Ok(v) = std::env::var("INTERBANK_PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Ok(v) = std::env::var("INTERBANK_DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = std::env::var("INTERBANK_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("INTERBANK_LOG_JSON") {
            self.logging.json = parse_var("INTERBANK_LOG_JSON", &v)?;
        }
        Ok(())
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.bank.routing_number == self.peer.routing_number {
            return Err(crate::Error::Config(
                "bank and peer routing numbers must differ".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(crate::Error::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.bank.api_key.is_empty() {
            return Err(crate::Error::Config("bank.api_key is empty".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("{}: {}", name, e)))
}
