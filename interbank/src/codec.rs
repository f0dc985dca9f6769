//! Message codec and validator
//!
//! Decoding is two-step: the envelope first, then the body against the
//! declared message type. Nothing downstream ever sees a body whose shape
//! disagrees with its type tag.

use crate::protocol::{
    CommitTransaction, Envelope, ForeignBankId, IdempotenceKey, MessageType, RawEnvelope,
    RollbackTransaction, Transaction,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Codec failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Body does not have the shape its declared type requires
    #[error("Schema mismatch: {message_type} body rejected: {reason}")]
    SchemaMismatch {
        /// Declared type
        message_type: MessageType,
        /// Parser diagnostic
        reason: String,
    },

    /// Not an envelope at all
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// A body checked against its declared type
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Proposal
    NewTx(Transaction),
    /// Commit
    CommitTx(CommitTransaction),
    /// Rollback
    RollbackTx(RollbackTransaction),
}

impl MessageBody {
    /// Type tag matching this body
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::NewTx(_) => MessageType::NewTx,
            MessageBody::CommitTx(_) => MessageType::CommitTx,
            MessageBody::RollbackTx(_) => MessageType::RollbackTx,
        }
    }

    /// Transaction the body is about
    pub fn transaction_id(&self) -> &ForeignBankId {
        match self {
            MessageBody::NewTx(tx) => &tx.transaction_id,
            MessageBody::CommitTx(commit) => &commit.transaction_id,
            MessageBody::RollbackTx(rollback) => &rollback.transaction_id,
        }
    }

    /// Body as JSON
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            MessageBody::NewTx(tx) => serde_json::to_value(tx),
            MessageBody::CommitTx(commit) => serde_json::to_value(commit),
            MessageBody::RollbackTx(rollback) => serde_json::to_value(rollback),
        }
    }
}

/// Check that `payload` has the shape `message_type` requires.
///
/// Runs before any side effect.
pub fn validate(message_type: MessageType, payload: &Value) -> Result<MessageBody, CodecError> {
    match message_type {
        MessageType::NewTx => parse(message_type, payload).map(MessageBody::NewTx),
        MessageType::CommitTx => parse(message_type, payload).map(MessageBody::CommitTx),
        MessageType::RollbackTx => parse(message_type, payload).map(MessageBody::RollbackTx),
    }
}

fn parse<T: DeserializeOwned>(message_type: MessageType, payload: &Value) -> Result<T, CodecError> {
    T::deserialize(payload).map_err(|e| CodecError::SchemaMismatch {
        message_type,
        reason: e.to_string(),
    })
}

/// A validated interbank message
#[derive(Debug, Clone, PartialEq)]
pub struct InterbankMessage {
    /// Dedup key
    pub idempotence_key: IdempotenceKey,
    /// Validated body
    pub body: MessageBody,
}

impl InterbankMessage {
    /// Build a message
    pub fn new(idempotence_key: IdempotenceKey, body: MessageBody) -> Self {
        Self {
            idempotence_key,
            body,
        }
    }

    /// Declared type
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Decode and validate raw request bytes
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let envelope: RawEnvelope =
            serde_json::from_slice(raw).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Self::from_envelope(&envelope)
    }

    /// Validate an already parsed envelope
    pub fn from_envelope(envelope: &RawEnvelope) -> Result<Self, CodecError> {
        let body = validate(envelope.message_type, &envelope.message)?;
        Ok(Self::new(envelope.idempotence_key.clone(), body))
    }

    /// Envelope with a JSON body
    pub fn to_envelope(&self) -> serde_json::Result<RawEnvelope> {
        Ok(Envelope {
            idempotence_key: self.idempotence_key.clone(),
            message_type: self.message_type(),
            message: self.body.to_value()?,
        })
    }

    /// Serialized envelope
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_envelope()?)
    }
}
