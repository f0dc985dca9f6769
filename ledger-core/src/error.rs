//! Error types for the account ledger

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Account does not exist
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account number already taken
    #[error("Account already exists: {0}")]
    DuplicateAccount(String),

    /// Not enough available balance
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount requested
        required: Decimal,
        /// Amount free to spend
        available: Decimal,
    },

    /// Zero or negative amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Transfer currency differs from the account currency
    #[error("Currency mismatch on {account}: account holds {account_currency}, transfer is {transfer_currency}")]
    CurrencyMismatch {
        /// Account number
        account: String,
        /// Currency the account is held in
        account_currency: String,
        /// Currency of the transfer
        transfer_currency: String,
    },

    /// Transfer does not exist
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// Transition not allowed from the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
