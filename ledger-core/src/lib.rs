//! DelTran Ledger Core
//!
//! Customer account ledger consumed by the interbank settlement core.
//!
//! # Architecture
//!
//! - **Single Writer**: One actor task owns all balances, so mutations on an
//!   account are serialized without locks
//! - **Reservations**: Outgoing funds move from available into reserved until
//!   the remote bank confirms or the transfer is rolled back
//! - **Idempotent transfers**: A transfer id is applied at most once
//!
//! # Invariants
//!
//! - Money conservation: reserving, releasing and completing never create funds
//! - Available balance never goes negative
//! - A completed or rolled back transfer never changes again

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod book;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{AccountLedger, CurrencyDirectory, Ledger};
pub use types::{Account, AccountId, Currency, Transfer, TransferStatus, TransferType};
