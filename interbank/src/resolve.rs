//! Mapping of posting parties onto local accounts

use crate::protocol::{Posting, ReasonCode, Transaction, TxAccount};
use crate::{Error, Result};
use ledger_core::{Account, AccountId, AccountLedger, Currency, CurrencyDirectory};
use std::sync::Arc;

/// Where a posting's party lives
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A local account in the posting's currency
    Local(Account),
    /// Belongs to another bank
    Foreign,
    /// Targets this bank but nothing matches
    Missing(ReasonCode),
}

/// Resolves `TxAccount`s against the account ledger of one bank
#[derive(Clone)]
pub struct AccountResolver {
    routing_number: u32,
    ledger: Arc<dyn AccountLedger>,
    currencies: Arc<dyn CurrencyDirectory>,
}

impl AccountResolver {
    /// Resolver for the bank with `routing_number`
    pub fn new(
        routing_number: u32,
        ledger: Arc<dyn AccountLedger>,
        currencies: Arc<dyn CurrencyDirectory>,
    ) -> Self {
        Self {
            routing_number,
            ledger,
            currencies,
        }
    }

    /// This bank's routing number
    pub fn routing_number(&self) -> u32 {
        self.routing_number
    }

    /// Account ledger
    pub fn ledger(&self) -> &Arc<dyn AccountLedger> {
        &self.ledger
    }

    /// Currency by code, `UnknownCurrency` if unsupported
    pub fn currency(&self, code: &str) -> Result<Currency> {
        self.currencies
            .find_by_code(code)
            .ok_or_else(|| Error::UnknownCurrency(code.to_string()))
    }

    /// The single currency of a proposal's monetary legs
    pub fn currency_of(&self, tx: &Transaction) -> Result<Currency> {
        let code = tx
            .postings
            .iter()
            .find_map(|p| match &p.asset {
                crate::protocol::Asset::Monetary(m) => m.currency.clone(),
                _ => None,
            })
            .ok_or_else(|| Error::UnknownCurrency("<none>".to_string()))?;
        self.currency(&code)
    }

    /// Resolve one party in `currency`
    pub async fn resolve(&self, account: &TxAccount, currency: Currency) -> Result<Resolution> {
        match account {
            TxAccount::Account { num: None } => Ok(Resolution::Missing(ReasonCode::NoSuchAccount)),
            TxAccount::Account { num: Some(num) } => {
                let number = AccountId::new(num.as_str());
                if !number.belongs_to(self.routing_number) {
                    return Ok(Resolution::Foreign);
                }
                match self.ledger.find_by_account_number(&number).await? {
                    Some(account) if account.currency == currency => Ok(Resolution::Local(account)),
                    _ => Ok(Resolution::Missing(ReasonCode::NoSuchAccount)),
                }
            }
            TxAccount::Person { id } if id.routing_number == self.routing_number => {
                let accounts = self.ledger.find_by_owner(&id.id).await?;
                if accounts.is_empty() {
                    return Ok(Resolution::Missing(ReasonCode::NoSuchUser));
                }
                Ok(accounts
                    .into_iter()
                    .find(|a| a.currency == currency)
                    .map(Resolution::Local)
                    .unwrap_or(Resolution::Missing(ReasonCode::NoSuchAccount)))
            }
            TxAccount::Person { .. } | TxAccount::OptionContract { .. } => Ok(Resolution::Foreign),
        }
    }

    /// Monetary postings that resolve to local accounts, with their index
    pub async fn local_legs<'a>(
        &self,
        tx: &'a Transaction,
        currency: Currency,
    ) -> Result<Vec<(usize, &'a Posting, Account)>> {
        let mut legs = Vec::new();
        for (index, posting) in tx.postings.iter().enumerate() {
            if !posting.asset.is_monetary() {
                continue;
            }
            if let Resolution::Local(account) = self.resolve(&posting.account, currency).await? {
                legs.push((index, posting, account));
            }
        }
        Ok(legs)
    }
}
