//! Wire types of the interbank protocol
//!
//! Every message travels in an [`Envelope`]:
//!
//! ```json
//! {
//!   "idempotenceKey": {"routingNumber": 111, "locallyGeneratedKey": "..."},
//!   "messageType": "NEW_TX",
//!   "message": { ... }
//! }
//! ```
//!
//! and every answer is a [`Vote`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one logical message across all participants
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotenceKey {
    /// Routing number of the bank that first originated the message
    pub routing_number: u32,
    /// Opaque key, unique within the originating bank
    pub locally_generated_key: String,
}

impl IdempotenceKey {
    /// Build a key
    pub fn new(routing_number: u32, locally_generated_key: impl Into<String>) -> Self {
        Self {
            routing_number,
            locally_generated_key: locally_generated_key.into(),
        }
    }

    /// Fresh key for a message this bank originates
    pub fn generate(routing_number: u32) -> Self {
        Self::new(routing_number, uuid::Uuid::new_v4().to_string())
    }

    /// The same identity, in the form used as a transaction id
    pub fn as_transaction_id(&self) -> ForeignBankId {
        ForeignBankId::new(self.routing_number, self.locally_generated_key.clone())
    }
}

impl fmt::Display for IdempotenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.routing_number, self.locally_generated_key)
    }
}

/// An object owned by some bank: a person, a transaction, a negotiation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignBankId {
    /// Owning bank
    pub routing_number: u32,
    /// Opaque id within that bank
    pub id: String,
}

impl ForeignBankId {
    /// Build an id
    pub fn new(routing_number: u32, id: impl Into<String>) -> Self {
        Self {
            routing_number,
            id: id.into(),
        }
    }
}

impl fmt::Display for ForeignBankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.routing_number, self.id)
    }
}

/// The three message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Transaction proposal
    NewTx,
    /// Commit a previously accepted proposal
    CommitTx,
    /// Abandon a proposal
    RollbackTx,
}

impl MessageType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::NewTx => "NEW_TX",
            MessageType::CommitTx => "COMMIT_TX",
            MessageType::RollbackTx => "ROLLBACK_TX",
        }
    }

    /// Parse a wire name
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "NEW_TX" => Some(MessageType::NewTx),
            "COMMIT_TX" => Some(MessageType::CommitTx),
            "ROLLBACK_TX" => Some(MessageType::RollbackTx),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a posting debits or credits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxAccount {
    /// Account number, prefixed by the owning bank's routing number
    Account {
        /// Account number
        #[serde(default)]
        num: Option<String>,
    },
    /// A person at some bank
    Person {
        /// Person identity
        id: ForeignBankId,
    },
    /// A negotiated option contract
    #[serde(rename = "OPTION")]
    OptionContract {
        /// Negotiation identity
        id: ForeignBankId,
    },
}

/// Currency leg descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonetaryAsset {
    /// ISO currency code
    #[serde(default)]
    pub currency: Option<String>,
}

/// What a posting moves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "asset", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Asset {
    /// Money in one currency
    #[serde(rename = "MONAS")]
    Monetary(MonetaryAsset),
    /// Stock position, evaluated by the oracle
    Stock(serde_json::Value),
    /// Option contract, evaluated by the oracle
    #[serde(rename = "OPTION")]
    OptionContract(serde_json::Value),
}

impl Asset {
    /// Monetary asset in `currency`
    pub fn money(currency: impl Into<String>) -> Self {
        Asset::Monetary(MonetaryAsset {
            currency: Some(currency.into()),
        })
    }

    /// Whether this is a currency leg
    pub fn is_monetary(&self) -> bool {
        matches!(self, Asset::Monetary(_))
    }
}

/// One signed leg of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    /// Debited (negative) or credited (positive) party
    pub account: TxAccount,
    /// Signed amount
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    /// Asset moved
    pub asset: Asset,
}

/// NEW_TX body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Ordered postings
    pub postings: Vec<Posting>,
    /// Free text
    #[serde(default)]
    pub message: String,
    /// Transaction identity
    pub transaction_id: ForeignBankId,
    /// Origination time, as sent by the originator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// COMMIT_TX body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CommitTransaction {
    /// The NEW_TX being committed
    pub transaction_id: ForeignBankId,
}

/// ROLLBACK_TX body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RollbackTransaction {
    /// The NEW_TX being rolled back
    pub transaction_id: ForeignBankId,
}

/// Message wrapper shared by all three kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Dedup key
    pub idempotence_key: IdempotenceKey,
    /// Declared kind
    pub message_type: MessageType,
    /// Body
    pub message: T,
}

/// Envelope whose body has not been checked against its declared type yet
pub type RawEnvelope = Envelope<serde_json::Value>;

/// Accept or reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Accept
    Yes,
    /// Reject
    No,
}

/// Structured rejection reason
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReasonCode {
    /// Posting count is neither 2 nor 4
    NoPostings,
    /// Missing or mixed currency
    NoSuchAsset,
    /// Local account does not exist
    NoSuchAccount,
    /// Local person does not exist
    NoSuchUser,
    /// Posting is structurally invalid
    InvalidPostingFormat,
    /// Commit could not be applied
    CommitTxFailed,
    /// Code this bank does not know, kept verbatim
    Other(String),
}

impl ReasonCode {
    /// Wire name
    pub fn as_str(&self) -> &str {
        match self {
            ReasonCode::NoPostings => "NO_POSTINGS",
            ReasonCode::NoSuchAsset => "NO_SUCH_ASSET",
            ReasonCode::NoSuchAccount => "NO_SUCH_ACCOUNT",
            ReasonCode::NoSuchUser => "NO_SUCH_USER",
            ReasonCode::InvalidPostingFormat => "INVALID_POSTING_FORMAT",
            ReasonCode::CommitTxFailed => "COMMIT_TX_FAILED",
            ReasonCode::Other(code) => code,
        }
    }
}

impl From<String> for ReasonCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "NO_POSTINGS" => ReasonCode::NoPostings,
            "NO_SUCH_ASSET" => ReasonCode::NoSuchAsset,
            "NO_SUCH_ACCOUNT" => ReasonCode::NoSuchAccount,
            "NO_SUCH_USER" => ReasonCode::NoSuchUser,
            "INVALID_POSTING_FORMAT" => ReasonCode::InvalidPostingFormat,
            "COMMIT_TX_FAILED" => ReasonCode::CommitTxFailed,
            _ => ReasonCode::Other(code),
        }
    }
}

impl From<ReasonCode> for String {
    fn from(code: ReasonCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reason attached to a NO vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteReason {
    /// Reason code (`reason` is accepted as an alternative spelling)
    #[serde(alias = "reason")]
    pub code: ReasonCode,
    /// Offending posting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posting: Option<Posting>,
}

/// A bank's answer to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Decision
    pub vote: Decision,
    /// Reasons, empty for YES
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<VoteReason>,
}

impl Vote {
    /// Accept
    pub fn yes() -> Self {
        Self {
            vote: Decision::Yes,
            reasons: Vec::new(),
        }
    }

    /// Reject for one reason
    pub fn no(code: ReasonCode, posting: Option<Posting>) -> Self {
        Self {
            vote: Decision::No,
            reasons: vec![VoteReason { code, posting }],
        }
    }

    /// Whether the vote accepts
    pub fn is_yes(&self) -> bool {
        self.vote == Decision::Yes
    }

    /// First reason code, if any
    pub fn first_reason(&self) -> Option<&ReasonCode> {
        self.reasons.first().map(|r| &r.code)
    }
}
