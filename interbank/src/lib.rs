//! DelTran Interbank Core
//!
//! Two-phase commit between two banks over HTTP webhooks.
//!
//! # Flow
//!
//! 1. The originating bank reserves the debited amount and sends `NEW_TX`
//! 2. The counterparty votes `YES` or `NO` with reasons; non-monetary legs
//!    are voted on by the valuation oracle
//! 3. On `YES` the originator sends `COMMIT_TX` and both sides settle; on `NO`
//!    or an undeliverable proposal it releases the hold and sends `ROLLBACK_TX`
//!
//! # Guarantees
//!
//! - Every message is recorded once per `(idempotence key, message type)`;
//!   duplicates are answered with the first reply, byte for byte
//! - Outbound messages are retried with a fixed delay until the peer answers
//! - A transaction settles at most once on each side

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod applier;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod oracle;
pub mod orchestrator;
pub mod protocol;
pub mod resolve;
pub mod server;
pub mod store;
pub mod transport;
pub mod vote;

// Re-exports
pub use codec::{CodecError, InterbankMessage, MessageBody};
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Collaborators, Orchestrator, OutboundTransfer};
pub use protocol::{IdempotenceKey, MessageType, Vote};
