//! In-memory account book
//!
//! Owned exclusively by the ledger actor, so every method takes `&mut self`
//! and runs to completion without interleaving. Each mutation checks all of
//! its preconditions before touching a balance: an operation either applies
//! fully or leaves the book unchanged.

use crate::types::{Account, AccountId, Currency, Transfer, TransferStatus};
use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Accounts and the transfers executed against them
#[derive(Debug, Default)]
pub struct AccountBook {
    accounts: HashMap<AccountId, Account>,
    /// Opening order, so owner lookups return the first-opened account
    order: Vec<AccountId>,
    transfers: HashMap<String, Transfer>,
}

impl AccountBook {
    /// Empty book
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new account
    pub fn open_account(&mut self, account: Account) -> Result<Account> {
        if self.accounts.contains_key(&account.number) {
            return Err(Error::DuplicateAccount(account.number.to_string()));
        }
        self.order.push(account.number.clone());
        self.accounts.insert(account.number.clone(), account.clone());
        Ok(account)
    }

    /// Account by number
    pub fn account(&self, number: &AccountId) -> Option<&Account> {
        self.accounts.get(number)
    }

    /// All accounts of one owner, in opening order
    pub fn accounts_of(&self, owner_id: &str) -> Vec<Account> {
        self.order
            .iter()
            .filter_map(|number| self.accounts.get(number))
            .filter(|account| account.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// First account of an owner held in `currency`
    pub fn account_of(&self, owner_id: &str, currency: Currency) -> Option<Account> {
        self.accounts_of(owner_id)
            .into_iter()
            .find(|account| account.currency == currency)
    }

    /// Increase available balance
    pub fn credit(&mut self, number: &AccountId, amount: Decimal) -> Result<Account> {
        check_amount(amount)?;
        let account = self.account_mut(number)?;
        account.available += amount;
        Ok(account.clone())
    }

    /// Decrease available balance
    pub fn debit(&mut self, number: &AccountId, amount: Decimal) -> Result<Account> {
        check_amount(amount)?;
        let account = self.account_mut(number)?;
        check_funds(account, amount)?;
        account.available -= amount;
        Ok(account.clone())
    }

    /// Move funds from available into reserved
    pub fn reserve(&mut self, number: &AccountId, amount: Decimal) -> Result<Account> {
        check_amount(amount)?;
        let account = self.account_mut(number)?;
        check_funds(account, amount)?;
        account.available -= amount;
        account.reserved += amount;
        Ok(account.clone())
    }

    /// Move funds from reserved back into available
    pub fn release(&mut self, number: &AccountId, amount: Decimal) -> Result<Account> {
        check_amount(amount)?;
        let account = self.account_mut(number)?;
        if account.reserved < amount {
            return Err(Error::InvalidState(format!(
                "cannot release {} from {}: only {} reserved",
                amount, number, account.reserved
            )));
        }
        account.reserved -= amount;
        account.available += amount;
        Ok(account.clone())
    }

    /// Execute a transfer immediately and record it as completed: credit
    /// `to_account` and/or debit `from_account`, whichever are local.
    ///
    /// Returns `false` without touching any balance when a transfer with the
    /// same id was already recorded.
    pub fn settle(&mut self, mut transfer: Transfer) -> Result<bool> {
        if self.transfers.contains_key(&transfer.id) {
            return Ok(false);
        }
        if transfer.from_account.is_none() && transfer.to_account.is_none() {
            return Err(Error::InvalidState(format!(
                "transfer {} has neither source nor destination",
                transfer.id
            )));
        }
        check_amount(transfer.amount)?;

        if let Some(ref from) = transfer.from_account {
            self.check_currency(from, transfer.currency)?;
            let account = self
                .accounts
                .get(from)
                .ok_or_else(|| Error::AccountNotFound(from.to_string()))?;
            check_funds(account, transfer.amount)?;
        }
        if let Some(ref to) = transfer.to_account {
            self.check_currency(to, transfer.currency)?;
        }

        if let Some(ref from) = transfer.from_account {
            self.debit(from, transfer.amount)?;
        }
        if let Some(ref to) = transfer.to_account {
            self.credit(to, transfer.amount)?;
        }

        transfer.status = TransferStatus::Completed;
        transfer.updated_at = Utc::now();
        self.transfers.insert(transfer.id.clone(), transfer);
        Ok(true)
    }

    /// Reserve funds on the source of an outgoing transfer and record it as reserved.
    ///
    /// Returns `false` without touching any balance when a transfer with the
    /// same id was already recorded.
    pub fn reserve_outgoing(&mut self, mut transfer: Transfer) -> Result<bool> {
        if self.transfers.contains_key(&transfer.id) {
            return Ok(false);
        }
        let from = transfer
            .from_account
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("transfer {} has no source", transfer.id)))?;
        self.check_currency(&from, transfer.currency)?;
        self.reserve(&from, transfer.amount)?;

        transfer.status = TransferStatus::Reserved;
        transfer.updated_at = Utc::now();
        self.transfers.insert(transfer.id.clone(), transfer);
        Ok(true)
    }

    /// Turn a reservation into a completed debit. Completing twice is a no-op.
    pub fn complete_reservation(&mut self, id: &str) -> Result<Transfer> {
        let transfer = self
            .transfers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TransferNotFound(id.to_string()))?;

        match transfer.status {
            TransferStatus::Completed => return Ok(transfer),
            TransferStatus::Reserved => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "transfer {} is {:?}, cannot complete",
                    id, other
                )))
            }
        }

        let from = transfer
            .from_account
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("transfer {} has no source", id)))?;
        let account = self.account_mut(&from)?;
        if account.reserved < transfer.amount {
            return Err(Error::InvalidState(format!(
                "reservation {} exceeds reserved balance of {}",
                id, from
            )));
        }
        account.reserved -= transfer.amount;

        self.set_status(id, TransferStatus::Completed)
    }

    /// Release a reservation back to available balance.
    ///
    /// Releasing a completed or already released transfer is a no-op.
    pub fn release_reservation(&mut self, id: &str) -> Result<Transfer> {
        let transfer = self
            .transfers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TransferNotFound(id.to_string()))?;

        if transfer.status != TransferStatus::Reserved {
            return Ok(transfer);
        }

        let from = transfer
            .from_account
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("transfer {} has no source", id)))?;
        self.release(&from, transfer.amount)?;

        self.set_status(id, TransferStatus::RolledBack)
    }

    /// Transfer by id
    pub fn transfer(&self, id: &str) -> Option<&Transfer> {
        self.transfers.get(id)
    }

    /// Every transfer recorded for one interbank transaction, ordered by id
    pub fn transfers_for(&self, transaction_id: &str) -> Vec<Transfer> {
        let mut transfers: Vec<Transfer> = self
            .transfers
            .values()
            .filter(|t| t.transaction_id == transaction_id)
            .cloned()
            .collect();
        transfers.sort_by(|a, b| a.id.cmp(&b.id));
        transfers
    }

    /// Sum of available and reserved over all accounts in `currency`
    pub fn total_funds(&self, currency: Currency) -> Decimal {
        self.accounts
            .values()
            .filter(|a| a.currency == currency)
            .map(Account::total)
            .sum()
    }

    fn account_mut(&mut self, number: &AccountId) -> Result<&mut Account> {
        self.accounts
            .get_mut(number)
            .ok_or_else(|| Error::AccountNotFound(number.to_string()))
    }

    fn check_currency(&self, number: &AccountId, currency: Currency) -> Result<()> {
        let account = self
            .accounts
            .get(number)
            .ok_or_else(|| Error::AccountNotFound(number.to_string()))?;
        if account.currency != currency {
            return Err(Error::CurrencyMismatch {
                account: number.to_string(),
                account_currency: account.currency.to_string(),
                transfer_currency: currency.to_string(),
            });
        }
        Ok(())
    }

    fn set_status(&mut self, id: &str, status: TransferStatus) -> Result<Transfer> {
        let transfer = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::TransferNotFound(id.to_string()))?;
        transfer.status = status;
        transfer.updated_at = Utc::now();
        Ok(transfer.clone())
    }
}

fn check_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(amount));
    }
    Ok(())
}

fn check_funds(account: &Account, amount: Decimal) -> Result<()> {
    if account.available < amount {
        return Err(Error::InsufficientFunds {
            required: amount,
            available: account.available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book() -> AccountBook {
        let mut book = AccountBook::new();
        book.open_account(Account::open("111-A", "p1", Currency::EUR, dec!(500)))
            .unwrap();
        book.open_account(Account::open("111-B", "p1", Currency::USD, dec!(50)))
            .unwrap();
        book.open_account(Account::open("111-C", "p2", Currency::EUR, dec!(0)))
            .unwrap();
        book
    }

    fn id(s: &str) -> AccountId {
        AccountId::new(s)
    }

    #[test]
    fn test_owner_lookup_returns_first_match() {
        let mut book = book();
        book.open_account(Account::open("111-D", "p1", Currency::EUR, dec!(1)))
            .unwrap();

        let account = book.account_of("p1", Currency::EUR).unwrap();
        assert_eq!(account.number, id("111-A"));
        assert_eq!(book.accounts_of("p1").len(), 3);
        assert!(book.account_of("p2", Currency::USD).is_none());
        assert!(book.account_of("nobody", Currency::EUR).is_none());
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let mut book = book();
        let err = book
            .open_account(Account::open("111-A", "p9", Currency::EUR, dec!(0)))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateAccount("111-A".to_string()));
    }

    #[test]
    fn test_reserve_insufficient_funds_leaves_balance() {
        let mut book = book();
        let err = book.reserve(&id("111-B"), dec!(60)).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let account = book.account(&id("111-B")).unwrap();
        assert_eq!(account.available, dec!(50));
        assert_eq!(account.reserved, dec!(0));
    }

    #[test]
    fn test_invalid_amount() {
        let mut book = book();
        assert_eq!(
            book.credit(&id("111-A"), dec!(0)).unwrap_err(),
            Error::InvalidAmount(dec!(0))
        );
        assert!(book.debit(&id("111-A"), dec!(-5)).is_err());
    }

    #[test]
    fn test_settle_is_idempotent() {
        let mut book = book();
        let transfer = Transfer::incoming("k1", "k1", id("111-C"), dec!(100), Currency::EUR);

        assert!(book.settle(transfer.clone()).unwrap());
        assert!(!book.settle(transfer).unwrap());

        assert_eq!(book.account(&id("111-C")).unwrap().available, dec!(100));
        assert_eq!(book.transfer("k1").unwrap().status, TransferStatus::Completed);
    }

    #[test]
    fn test_settle_currency_mismatch() {
        let mut book = book();
        let transfer = Transfer::incoming("k1", "k1", id("111-B"), dec!(10), Currency::EUR);
        let err = book.settle(transfer).unwrap_err();
        assert!(matches!(err, Error::CurrencyMismatch { .. }));
        assert!(book.transfer("k1").is_none());
        assert_eq!(book.account(&id("111-B")).unwrap().available, dec!(50));
    }

    #[test]
    fn test_settle_debit_and_internal() {
        let mut book = book();
        let debit = Transfer::outgoing("k5", "k5", id("111-A"), dec!(600), Currency::EUR);
        assert!(matches!(
            book.settle(debit).unwrap_err(),
            Error::InsufficientFunds { .. }
        ));

        let mut internal = Transfer::outgoing("k6", "k6", id("111-A"), dec!(100), Currency::EUR);
        internal.to_account = Some(id("111-C"));
        assert!(book.settle(internal).unwrap());
        assert_eq!(book.account(&id("111-A")).unwrap().available, dec!(400));
        assert_eq!(book.account(&id("111-C")).unwrap().available, dec!(100));
        assert_eq!(book.total_funds(Currency::EUR), dec!(500));
    }

    #[test]
    fn test_reservation_complete() {
        let mut book = book();
        let transfer = Transfer::outgoing("k2", "k2", id("111-A"), dec!(100), Currency::EUR);
        assert!(book.reserve_outgoing(transfer).unwrap());

        let account = book.account(&id("111-A")).unwrap();
        assert_eq!(account.available, dec!(400));
        assert_eq!(account.reserved, dec!(100));

        let done = book.complete_reservation("k2").unwrap();
        assert_eq!(done.status, TransferStatus::Completed);
        let account = book.account(&id("111-A")).unwrap();
        assert_eq!(account.available, dec!(400));
        assert_eq!(account.reserved, dec!(0));

        // Second completion and late release change nothing
        book.complete_reservation("k2").unwrap();
        let after = book.release_reservation("k2").unwrap();
        assert_eq!(after.status, TransferStatus::Completed);
        let account = book.account(&id("111-A")).unwrap();
        assert_eq!(account.available, dec!(400));
        assert_eq!(account.reserved, dec!(0));
    }

    #[test]
    fn test_reservation_release_once() {
        let mut book = book();
        let transfer = Transfer::outgoing("k3", "k3", id("111-A"), dec!(200), Currency::EUR);
        book.reserve_outgoing(transfer).unwrap();

        book.release_reservation("k3").unwrap();
        book.release_reservation("k3").unwrap();

        let account = book.account(&id("111-A")).unwrap();
        assert_eq!(account.available, dec!(500));
        assert_eq!(account.reserved, dec!(0));
        assert_eq!(book.transfer("k3").unwrap().status, TransferStatus::RolledBack);

        let err = book.complete_reservation("k3").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_transfers_for_transaction() {
        let mut book = book();
        book.settle(Transfer::incoming("k4:1", "k4", id("111-C"), dec!(1), Currency::EUR))
            .unwrap();
        book.reserve_outgoing(Transfer::outgoing("k4:0", "k4", id("111-A"), dec!(1), Currency::EUR))
            .unwrap();

        let ids: Vec<String> = book.transfers_for("k4").into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["k4:0".to_string(), "k4:1".to_string()]);
        assert!(book.transfers_for("other").is_empty());
    }

    #[test]
    fn test_unknown_transfer() {
        let mut book = book();
        assert_eq!(
            book.complete_reservation("missing").unwrap_err(),
            Error::TransferNotFound("missing".to_string())
        );
        assert!(book.release_reservation("missing").is_err());
    }
}
