//! Account ledger interface
//!
//! [`AccountLedger`] and [`CurrencyDirectory`] are the narrow seams the
//! interbank core consumes. [`Ledger`] implements both on top of the actor.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{Account, AccountLedger, Config, Currency, Ledger};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> ledger_core::Result<()> {
//!     let ledger = Ledger::start(Config::default());
//!     ledger
//!         .open_account(Account::open("111-A", "p1", Currency::EUR, Decimal::new(10000, 2)))
//!         .await?;
//!
//!     let account = ledger.find_by_owner_and_currency("p1", Currency::EUR).await?;
//!     assert!(account.is_some());
//!     Ok(())
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    book::AccountBook,
    types::{Account, AccountId, Currency, Transfer},
    Config, Result,
};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Account operations, each atomic per account
#[async_trait]
pub trait AccountLedger: Send + Sync {
    /// Account by number
    async fn find_by_account_number(&self, number: &AccountId) -> Result<Option<Account>>;

    /// All accounts of one owner
    async fn find_by_owner(&self, owner_id: &str) -> Result<Vec<Account>>;

    /// First account of one owner in one currency
    async fn find_by_owner_and_currency(
        &self,
        owner_id: &str,
        currency: Currency,
    ) -> Result<Option<Account>>;

    /// Increase available balance
    async fn credit(&self, number: &AccountId, amount: Decimal) -> Result<Account>;

    /// Decrease available balance
    async fn debit(&self, number: &AccountId, amount: Decimal) -> Result<Account>;

    /// Hold funds pending remote confirmation
    async fn reserve(&self, number: &AccountId, amount: Decimal) -> Result<Account>;

    /// Return held funds to available balance
    async fn release(&self, number: &AccountId, amount: Decimal) -> Result<Account>;

    /// Credit the destination and/or debit the source and record the
    /// transfer as completed. `Ok(false)` means a transfer with this id was
    /// already settled.
    async fn settle(&self, transfer: Transfer) -> Result<bool>;

    /// Reserve on the source and record the transfer as reserved.
    /// `Ok(false)` means a transfer with this id already exists.
    async fn reserve_outgoing(&self, transfer: Transfer) -> Result<bool>;

    /// Turn a reservation into a completed debit
    async fn complete_reservation(&self, id: &str) -> Result<Transfer>;

    /// Release a reservation; no-op unless it is still reserved
    async fn release_reservation(&self, id: &str) -> Result<Transfer>;

    /// Transfer by id
    async fn find_transfer(&self, id: &str) -> Result<Option<Transfer>>;

    /// Transfers recorded for one interbank transaction
    async fn transfers_for(&self, transaction_id: &str) -> Result<Vec<Transfer>>;
}

/// Currency lookup
pub trait CurrencyDirectory: Send + Sync {
    /// Currency by ISO code, if this bank supports it
    fn find_by_code(&self, code: &str) -> Option<Currency>;
}

/// Actor-backed ledger
#[derive(Clone, Debug)]
pub struct Ledger {
    /// Actor handle for async operations
    handle: LedgerHandle,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Spawn the actor with an empty book
    pub fn start(config: Config) -> Self {
        let handle = spawn_ledger_actor(AccountBook::new(), config.mailbox_capacity);
        tracing::info!(
            service = %config.service_name,
            currencies = config.currencies.len(),
            "Account ledger started"
        );
        Self { handle, config }
    }

    /// Register an account
    pub async fn open_account(&self, account: Account) -> Result<Account> {
        self.handle.open_account(account).await
    }

    /// Sum of available and reserved funds in one currency
    pub async fn total_funds(&self, currency: Currency) -> Result<Decimal> {
        self.handle.total_funds(currency).await
    }

    /// Stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[async_trait]
impl AccountLedger for Ledger {
    async fn find_by_account_number(&self, number: &AccountId) -> Result<Option<Account>> {
        self.handle.get_account(number.clone()).await
    }

    async fn find_by_owner(&self, owner_id: &str) -> Result<Vec<Account>> {
        self.handle.get_accounts_of(owner_id.to_string()).await
    }

    async fn find_by_owner_and_currency(
        &self,
        owner_id: &str,
        currency: Currency,
    ) -> Result<Option<Account>> {
        self.handle
            .get_account_of(owner_id.to_string(), currency)
            .await
    }

    async fn credit(&self, number: &AccountId, amount: Decimal) -> Result<Account> {
        self.handle.credit(number.clone(), amount).await
    }

    async fn debit(&self, number: &AccountId, amount: Decimal) -> Result<Account> {
        self.handle.debit(number.clone(), amount).await
    }

    async fn reserve(&self, number: &AccountId, amount: Decimal) -> Result<Account> {
        self.handle.reserve(number.clone(), amount).await
    }

    async fn release(&self, number: &AccountId, amount: Decimal) -> Result<Account> {
        self.handle.release(number.clone(), amount).await
    }

    async fn settle(&self, transfer: Transfer) -> Result<bool> {
        self.handle.settle(transfer).await
    }

    async fn reserve_outgoing(&self, transfer: Transfer) -> Result<bool> {
        self.handle.reserve_outgoing(transfer).await
    }

    async fn complete_reservation(&self, id: &str) -> Result<Transfer> {
        self.handle.complete_reservation(id.to_string()).await
    }

    async fn release_reservation(&self, id: &str) -> Result<Transfer> {
        self.handle.release_reservation(id.to_string()).await
    }

    async fn find_transfer(&self, id: &str) -> Result<Option<Transfer>> {
        self.handle.get_transfer(id.to_string()).await
    }

    async fn transfers_for(&self, transaction_id: &str) -> Result<Vec<Transfer>> {
        self.handle.get_transfers_for(transaction_id.to_string()).await
    }
}

impl CurrencyDirectory for Ledger {
    fn find_by_code(&self, code: &str) -> Option<Currency> {
        Currency::from_code(code).filter(|c| self.config.currencies.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferStatus;
    use rust_decimal_macros::dec;

    async fn ledger() -> Ledger {
        let ledger = Ledger::start(Config::default());
        ledger
            .open_account(Account::open("111-A", "p1", Currency::EUR, dec!(1000)))
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_outgoing_lifecycle() {
        let ledger = ledger().await;
        let transfer = Transfer::outgoing("k1", "k1", AccountId::new("111-A"), dec!(100), Currency::EUR);

        assert!(ledger.reserve_outgoing(transfer.clone()).await.unwrap());
        assert!(!ledger.reserve_outgoing(transfer).await.unwrap());

        let account = ledger
            .find_by_account_number(&AccountId::new("111-A"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.reserved, dec!(100));
        assert_eq!(account.available, dec!(900));

        let done = ledger.complete_reservation("k1").await.unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(ledger.total_funds(Currency::EUR).await.unwrap(), dec!(900));
    }

    #[tokio::test]
    async fn test_currency_directory_respects_config() {
        let ledger = Ledger::start(Config {
            currencies: vec![Currency::EUR],
            ..Config::default()
        });
        assert_eq!(ledger.find_by_code("EUR"), Some(Currency::EUR));
        assert_eq!(ledger.find_by_code("USD"), None);
        assert_eq!(ledger.find_by_code("eur"), None);
    }

    #[tokio::test]
    async fn test_find_by_owner() {
        let ledger = ledger().await;
        ledger
            .open_account(Account::open("111-B", "p1", Currency::USD, dec!(5)))
            .await
            .unwrap();

        assert_eq!(ledger.find_by_owner("p1").await.unwrap().len(), 2);
        let usd = ledger
            .find_by_owner_and_currency("p1", Currency::USD)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usd.number, AccountId::new("111-B"));
    }
}
