//! Core types for the account ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Cheap cloning out of the actor (no shared mutable state)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account number, prefixed by the owning bank's routing number (e.g. `111-A`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the number belongs to the bank with this routing number
    pub fn belongs_to(&self, routing_number: u32) -> bool {
        self.0.starts_with(&routing_number.to_string())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currency codes (ISO 4217)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// Swiss Franc
    CHF,
    /// Serbian Dinar
    RSD,
    /// UAE Dirham
    AED,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::CHF => "CHF",
            Currency::RSD => "RSD",
            Currency::AED => "AED",
        }
    }

    /// Parse from string
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            "CHF" => Some(Currency::CHF),
            "RSD" => Some(Currency::RSD),
            "AED" => Some(Currency::AED),
            _ => None,
        }
    }

    /// Every supported currency
    pub fn all() -> Vec<Currency> {
        vec![
            Currency::USD,
            Currency::EUR,
            Currency::GBP,
            Currency::CHF,
            Currency::RSD,
            Currency::AED,
        ]
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A customer account held at this bank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account number
    pub number: AccountId,

    /// Owner identifier, the `id` half of a person's interbank identity
    pub owner_id: String,

    /// Account currency
    pub currency: Currency,

    /// Funds free to spend
    pub available: Decimal,

    /// Funds held for transfers awaiting remote confirmation
    pub reserved: Decimal,

    /// Opening timestamp
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Open an account with an initial available balance
    pub fn open(
        number: impl Into<String>,
        owner_id: impl Into<String>,
        currency: Currency,
        available: Decimal,
    ) -> Self {
        Self {
            number: AccountId::new(number),
            owner_id: owner_id.into(),
            currency,
            available,
            reserved: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    /// Available plus reserved
    pub fn total(&self) -> Decimal {
        self.available + self.reserved
    }
}

/// Transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// Created, nothing moved yet
    Pending,
    /// Funds held on the sending account
    Reserved,
    /// Funds moved
    Completed,
    /// Could not be executed
    Failed,
    /// Reservation released back to available balance
    RolledBack,
}

impl TransferStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::RolledBack
        )
    }
}

/// Transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferType {
    /// Between two accounts of this bank
    Internal,
    /// Card or clearing network
    External,
    /// Leg of an interbank transaction
    ForeignBank,
}

/// Local side effect of a settled or reserved transaction leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    /// Unique transfer id, derived from the transaction's locally generated key
    pub id: String,

    /// Locally generated key of the interbank transaction this leg belongs to
    pub transaction_id: String,

    /// Debited account (None for incoming foreign legs)
    pub from_account: Option<AccountId>,

    /// Credited account (None for outgoing foreign legs)
    pub to_account: Option<AccountId>,

    /// Amount (always positive)
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Current status
    pub status: TransferStatus,

    /// Transfer type
    pub transfer_type: TransferType,

    /// Free text carried over from the transaction
    pub description: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    /// Incoming foreign-bank leg crediting a local account
    pub fn incoming(
        id: impl Into<String>,
        transaction_id: impl Into<String>,
        to_account: AccountId,
        amount: Decimal,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            transaction_id: transaction_id.into(),
            from_account: None,
            to_account: Some(to_account),
            amount,
            currency,
            status: TransferStatus::Pending,
            transfer_type: TransferType::ForeignBank,
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Outgoing foreign-bank leg debiting a local account
    pub fn outgoing(
        id: impl Into<String>,
        transaction_id: impl Into<String>,
        from_account: AccountId,
        amount: Decimal,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            transaction_id: transaction_id.into(),
            from_account: Some(from_account),
            to_account: None,
            amount,
            currency,
            status: TransferStatus::Pending,
            transfer_type: TransferType::ForeignBank,
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_account_prefix() {
        let account = AccountId::new("111-A");
        assert!(account.belongs_to(111));
        assert!(!account.belongs_to(222));
    }

    #[test]
    fn test_currency_codes() {
        for currency in Currency::all() {
            assert_eq!(Currency::from_code(currency.code()), Some(currency));
        }
        assert_eq!(Currency::from_code("XXX"), None);
    }

    #[test]
    fn test_account_total() {
        let mut account = Account::open("111-A", "p1", Currency::EUR, dec!(100));
        account.available -= dec!(40);
        account.reserved += dec!(40);
        assert_eq!(account.total(), dec!(100));
    }
}
