//! Error types for the interbank core

use crate::codec::CodecError;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Result type for interbank operations
pub type Result<T> = std::result::Result<T, Error>;

/// Interbank errors
#[derive(Error, Debug)]
pub enum Error {
    /// Payload shape does not match its declared message type
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Local account could not be resolved
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    /// Currency code not supported by this bank
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    /// Not enough available balance at reservation time
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount requested
        required: rust_decimal::Decimal,
        /// Amount free to spend
        available: rust_decimal::Decimal,
    },

    /// Valuation oracle could not be reached or answered badly
    #[error("Oracle unreachable: {0}")]
    OracleUnreachable(String),

    /// Peer bank could not be reached
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// No stored NEW_TX for a referenced transaction id
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// A duplicate arrived while the first copy is still being processed
    #[error("Message {0} is still being processed")]
    InFlight(String),

    /// Request rejected before any side effect
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or wrong API key
    #[error("Unauthorized")]
    Unauthorized,

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Ledger collaborator error
    #[error("Ledger error: {0}")]
    Ledger(ledger_core::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Internal(String),
}

impl Error {
    fn error_type(&self) -> &str {
        match self {
            Error::Codec(_) => "schema_mismatch",
            Error::UnknownAccount(_) => "unknown_account",
            Error::UnknownCurrency(_) => "unknown_currency",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::OracleUnreachable(_) => "oracle_unreachable",
            Error::PeerUnreachable(_) => "peer_unreachable",
            Error::TransactionNotFound(_) => "not_found",
            Error::InFlight(_) => "in_flight",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Unauthorized => "unauthorized",
            Error::Database(_) => "database_error",
            Error::Ledger(_) => "ledger_error",
            Error::Serialization(_) => "serialization_error",
            Error::Config(_) => "config_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Codec(_) => StatusCode::BAD_REQUEST,
            Error::UnknownAccount(_) => StatusCode::NOT_FOUND,
            Error::UnknownCurrency(_) => StatusCode::BAD_REQUEST,
            Error::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::OracleUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            Error::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            Error::InFlight(_) => StatusCode::CONFLICT,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Database(_)
            | Error::Ledger(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ledger_core::Error> for Error {
    fn from(err: ledger_core::Error) -> Self {
        match err {
            ledger_core::Error::AccountNotFound(number) => Error::UnknownAccount(number),
            ledger_core::Error::InsufficientFunds {
                required,
                available,
            } => Error::InsufficientFunds {
                required,
                available,
            },
            other => Error::Ledger(other),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Internal(msg.to_string())
    }
}
