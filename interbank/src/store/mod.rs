//! Idempotency ledger
//!
//! Durable record of every interbank message this bank has seen or sent,
//! keyed by `(idempotence key, message type)`, and of every attempt to
//! deliver or answer it.
//!
//! [`EventStore::record_if_new`] is the single serialization point of the
//! protocol: under concurrent duplicate delivery exactly one caller sees
//! `is_new = true`. Both implementations push that guarantee into the
//! storage layer (one critical section in memory, a unique index in
//! Postgres).

mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

use crate::protocol::{ForeignBankId, IdempotenceKey, MessageType};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTTP status recorded for attempts that never got an HTTP response
pub const NETWORK_FAILURE_STATUS: i32 = -1;

/// Which side originated the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Received from a peer
    Incoming,
    /// Sent by this bank
    Outgoing,
}

impl Direction {
    /// Storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "INCOMING",
            Direction::Outgoing => "OUTGOING",
        }
    }
}

/// Event processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Being delivered or processed
    Pending,
    /// Delivered or answered
    Success,
    /// Gave up, or processing errored
    Failed,
}

impl EventStatus {
    /// Storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Success => "SUCCESS",
            EventStatus::Failed => "FAILED",
        }
    }
}

/// Outcome of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// 2xx with a well-formed body
    Success,
    /// Anything else
    Failed,
}

impl DeliveryStatus {
    /// Storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

/// Event about to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Dedup key
    pub idempotence_key: IdempotenceKey,
    /// Message kind
    pub message_type: MessageType,
    /// Direction
    pub direction: Direction,
    /// Serialized envelope
    pub payload: String,
    /// Source (incoming) or target (outgoing) URL
    pub url: String,
    /// Transaction id carried by a NEW_TX body, for reverse lookup
    pub transaction_id: Option<ForeignBankId>,
}

/// One logical message instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Store-assigned id
    pub id: i64,
    /// Dedup key
    pub idempotence_key: IdempotenceKey,
    /// Message kind
    pub message_type: MessageType,
    /// Direction
    pub direction: Direction,
    /// Serialized envelope
    pub payload: String,
    /// Source or target URL
    pub url: String,
    /// Transaction id carried by a NEW_TX body
    pub transaction_id: Option<ForeignBankId>,
    /// Processing state
    pub status: EventStatus,
    /// First sight
    pub created_at: DateTime<Utc>,
}

/// Delivery attempt about to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewDelivery {
    /// Owning event
    pub event_id: i64,
    /// Outcome
    pub status: DeliveryStatus,
    /// HTTP status, or [`NETWORK_FAILURE_STATUS`]
    pub http_status: i32,
    /// Response body as received or sent
    pub response_body: String,
    /// Attempt duration
    pub duration_ms: i64,
}

/// One attempt to transmit or answer an event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDelivery {
    /// Store-assigned id
    pub id: i64,
    /// Owning event
    pub event_id: i64,
    /// Outcome
    pub status: DeliveryStatus,
    /// HTTP status, or [`NETWORK_FAILURE_STATUS`]
    pub http_status: i32,
    /// Response body
    pub response_body: String,
    /// Attempt duration
    pub duration_ms: i64,
    /// Attempt time
    pub sent_at: DateTime<Utc>,
}

/// Storage for events and their deliveries
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert unless an event with the same `(key, type)` exists.
    /// Returns the stored event and whether this call created it.
    async fn record_if_new(&self, event: NewEvent) -> Result<(Event, bool)>;

    /// Earliest event recorded under `key`, any type
    async fn find(&self, key: &IdempotenceKey) -> Result<Option<Event>>;

    /// Event recorded under `(key, type)`
    async fn find_typed(
        &self,
        key: &IdempotenceKey,
        message_type: MessageType,
    ) -> Result<Option<Event>>;

    /// Earliest NEW_TX whose body carries `transaction_id`
    async fn find_by_transaction_id(&self, transaction_id: &ForeignBankId)
        -> Result<Option<Event>>;

    /// Event by id
    async fn get(&self, id: i64) -> Result<Option<Event>>;

    /// Overwrite status
    async fn set_status(&self, id: i64, status: EventStatus) -> Result<()>;

    /// Compare-and-set status; `false` if the event was not in `from`
    async fn transition(&self, id: i64, from: EventStatus, to: EventStatus) -> Result<bool>;

    /// Append a delivery attempt
    async fn append_delivery(&self, delivery: NewDelivery) -> Result<EventDelivery>;

    /// First attempt recorded for an event
    async fn first_delivery(&self, event_id: i64) -> Result<Option<EventDelivery>>;

    /// First successful attempt recorded for an event
    async fn first_successful_delivery(&self, event_id: i64) -> Result<Option<EventDelivery>>;

    /// Every attempt, oldest first
    async fn deliveries(&self, event_id: i64) -> Result<Vec<EventDelivery>>;
}
