//! Settlement applier
//!
//! Turns protocol outcomes into ledger mutations. Transfer ids are derived
//! from the full transaction id, routing number included (`<routing>/<key>`
//! for the single local leg of a 2-posting transaction,
//! `<routing>/<key>:<posting index>` for 4-posting ones), and the ledger
//! applies a transfer id at most once. Replaying a commit or rollback is
//! therefore harmless.

use crate::oracle::ValuationOracle;
use crate::protocol::{
    CommitTransaction, Envelope, ForeignBankId, Posting, RollbackTransaction, Transaction,
};
use crate::resolve::AccountResolver;
use crate::store::EventStore;
use crate::{Error, Result};
use ledger_core::{Account, Currency, Transfer, TransferStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ledger-side reference of an interbank transaction
pub fn transaction_ref(transaction_id: &ForeignBankId) -> String {
    transaction_id.to_string()
}

/// Id of the transfer that settles posting `index` of a transaction
pub fn leg_transfer_id(transaction_id: &ForeignBankId, posting_count: usize, index: usize) -> String {
    if posting_count == 4 {
        format!("{}:{}", transaction_ref(transaction_id), index)
    } else {
        transaction_ref(transaction_id)
    }
}

/// Applies commits, rollbacks and reservations to the account ledger
pub struct SettlementApplier {
    resolver: AccountResolver,
    store: Arc<dyn EventStore>,
    oracle: Arc<dyn ValuationOracle>,
}

impl SettlementApplier {
    /// Create applier
    pub fn new(
        resolver: AccountResolver,
        store: Arc<dyn EventStore>,
        oracle: Arc<dyn ValuationOracle>,
    ) -> Self {
        Self {
            resolver,
            store,
            oracle,
        }
    }

    /// Settle the proposal a COMMIT_TX refers to.
    ///
    /// The proposal is recovered from the stored NEW_TX event; the commit
    /// message itself carries no postings.
    pub async fn apply_commit(&self, commit: &CommitTransaction) -> Result<()> {
        let event = self
            .store
            .find_by_transaction_id(&commit.transaction_id)
            .await?
            .ok_or_else(|| Error::TransactionNotFound(commit.transaction_id.to_string()))?;
        let proposal: Envelope<Transaction> = serde_json::from_str(&event.payload)?;
        let tx = &proposal.message;

        match tx.postings.len() {
            2 => {
                if tx.postings.iter().any(|p| !p.asset.is_monetary()) {
                    info!(
                        transaction_id = %tx.transaction_id,
                        "Non-monetary commit handed to oracle"
                    );
                    return self.oracle.notify_commit(&proposal).await;
                }

                let currency = self.resolver.currency_of(tx)?;
                let legs = self.single_local_leg(tx, currency).await?;
                for (index, posting, account) in legs {
                    self.settle_leg(tx, index, posting, &account, currency).await?;
                }
                Ok(())
            }
            4 => {
                if let Err(e) = self.oracle.notify_commit(&proposal).await {
                    warn!(
                        transaction_id = %tx.transaction_id,
                        error = %e,
                        "Oracle commit notification failed"
                    );
                }

                if !tx.postings.iter().any(|p| p.asset.is_monetary()) {
                    return Ok(());
                }
                let currency = self.resolver.currency_of(tx)?;
                for (index, posting, account) in self.resolver.local_legs(tx, currency).await? {
                    self.settle_leg(tx, index, posting, &account, currency).await?;
                }
                Ok(())
            }
            n => Err(Error::Internal(format!(
                "stored proposal {} has {} postings",
                tx.transaction_id, n
            ))),
        }
    }

    /// The local legs of a 2-posting transaction, which must be exactly one
    async fn single_local_leg<'a>(
        &self,
        tx: &'a Transaction,
        currency: Currency,
    ) -> Result<Vec<(usize, &'a Posting, Account)>> {
        let legs = self.resolver.local_legs(tx, currency).await?;
        match legs.len() {
            0 => Err(Error::UnknownAccount(format!(
                "no local leg in transaction {}",
                tx.transaction_id
            ))),
            1 => Ok(legs),
            n => Err(Error::InvalidRequest(format!(
                "transaction {} has {} local legs, expected one",
                tx.transaction_id, n
            ))),
        }
    }

    async fn settle_leg(
        &self,
        tx: &Transaction,
        index: usize,
        posting: &Posting,
        account: &Account,
        currency: Currency,
    ) -> Result<()> {
        let id = leg_transfer_id(&tx.transaction_id, tx.postings.len(), index);
        let reference = transaction_ref(&tx.transaction_id);
        let amount = posting.amount.abs();
        let transfer = if posting.amount.is_sign_negative() {
            Transfer::outgoing(&id, &reference, account.number.clone(), amount, currency)
        } else {
            Transfer::incoming(&id, &reference, account.number.clone(), amount, currency)
        }
        .with_description(tx.message.clone());

        // A leg this bank reserved when it proposed settles by completing the hold
        if let Some(existing) = self.resolver.ledger().find_transfer(&id).await? {
            match existing.status {
                TransferStatus::Reserved => {
                    self.resolver.ledger().complete_reservation(&id).await?;
                    info!(transfer_id = %id, "Completed reserved leg");
                }
                TransferStatus::Completed => debug!(transfer_id = %id, "Leg already settled"),
                status => {
                    return Err(Error::Ledger(ledger_core::Error::InvalidState(format!(
                        "transfer {} is {:?}, cannot settle",
                        id, status
                    ))))
                }
            }
            return Ok(());
        }

        if self.resolver.ledger().settle(transfer).await? {
            info!(
                transfer_id = %id,
                account = %account.number,
                amount = %posting.amount,
                currency = %currency,
                "Settled interbank leg"
            );
        }
        Ok(())
    }

    /// Release whatever this bank still holds for a rolled back transaction
    pub async fn apply_rollback(&self, rollback: &RollbackTransaction) -> Result<usize> {
        self.release_outbound(&rollback.transaction_id).await
    }

    /// Hold funds for a transfer this bank originates.
    ///
    /// Fails synchronously with `InsufficientFunds` or `UnknownAccount`.
    /// Returns `false` when the reservation already exists.
    pub async fn reserve_outbound(&self, transfer: Transfer) -> Result<bool> {
        let id = transfer.id.clone();
        let created = self.resolver.ledger().reserve_outgoing(transfer).await?;
        if created {
            info!(transfer_id = %id, "Reserved outbound funds");
        }
        Ok(created)
    }

    /// Hold funds for every local debit leg of a proposal this bank sends.
    ///
    /// Legs are reserved under the same ids `apply_commit` settles them with,
    /// so the commit completes the holds instead of debiting twice.
    pub async fn reserve_proposal(&self, tx: &Transaction) -> Result<usize> {
        if !tx.postings.iter().any(|p| p.asset.is_monetary()) {
            return Ok(0);
        }
        let currency = self.resolver.currency_of(tx)?;
        let legs = if tx.postings.len() == 2 {
            self.single_local_leg(tx, currency).await?
        } else {
            self.resolver.local_legs(tx, currency).await?
        };
        let mut reserved = 0;
        for (index, posting, account) in legs {
            if !posting.amount.is_sign_negative() {
                continue;
            }
            let id = leg_transfer_id(&tx.transaction_id, tx.postings.len(), index);
            let transfer = Transfer::outgoing(
                id,
                transaction_ref(&tx.transaction_id),
                account.number.clone(),
                posting.amount.abs(),
                currency,
            )
            .with_description(tx.message.clone());
            if self.reserve_outbound(transfer).await? {
                reserved += 1;
            }
        }
        Ok(reserved)
    }

    /// Release every reservation of a transaction still on hold
    pub async fn release_outbound(&self, transaction_id: &ForeignBankId) -> Result<usize> {
        let mut released = 0;
        for transfer in self
            .resolver
            .ledger()
            .transfers_for(&transaction_ref(transaction_id))
            .await? {
            if transfer.status == TransferStatus::Reserved {
                self.resolver.ledger().release_reservation(&transfer.id).await?;
                released += 1;
            }
        }
        if released > 0 {
            info!(transaction_id = %transaction_id, released, "Released outbound reservations");
        }
        Ok(released)
    }
}
