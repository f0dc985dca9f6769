//! Configuration for the account ledger

use crate::types::Currency;
use serde::{Deserialize, Serialize};

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Actor mailbox capacity
    pub mailbox_capacity: usize,

    /// Currencies this bank holds accounts in
    pub currencies: Vec<Currency>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "ledger-core".to_string(),
            mailbox_capacity: 1000,
            currencies: Currency::all(),
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

        if let Ok(capacity) = std::env::var("LEDGER_MAILBOX_CAPACITY") {
            config.mailbox_capacity = capacity
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_MAILBOX_CAPACITY: {}", e)))?;
        }

        if let Ok(codes) = std::env::var("LEDGER_CURRENCIES") {
            config.currencies = codes
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(|code| {
                    Currency::from_code(code)
                        .ok_or_else(|| crate::Error::Config(format!("Unknown currency: {}", code)))
                })
                .collect::<crate::Result<_>>()?;
        }

        Ok(config)
    }
}
