//! Actor-based concurrency for the account ledger
//!
//! Every balance mutation goes through one Tokio task that owns the
//! [`AccountBook`]. Concurrent commits, rollbacks and reservations that touch
//! the same account are therefore applied one after another, never
//! interleaved.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        Settlement applier / interbank handlers        │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │                 owns AccountBook                      │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::book::AccountBook;
use crate::metrics::LEDGER_OPERATIONS_TOTAL;
use crate::types::{Account, AccountId, Currency, Transfer};
use crate::{Error, Result};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Register an account
    OpenAccount {
        account: Account,
        response: Reply<Account>,
    },

    /// Look up an account by number
    GetAccount {
        number: AccountId,
        response: Reply<Option<Account>>,
    },

    /// Accounts of one owner
    GetAccountsOf {
        owner_id: String,
        response: Reply<Vec<Account>>,
    },

    /// First account of one owner in one currency
    GetAccountOf {
        owner_id: String,
        currency: Currency,
        response: Reply<Option<Account>>,
    },

    /// Credit available balance
    Credit {
        number: AccountId,
        amount: Decimal,
        response: Reply<Account>,
    },

    /// Debit available balance
    Debit {
        number: AccountId,
        amount: Decimal,
        response: Reply<Account>,
    },

    /// Move available into reserved
    Reserve {
        number: AccountId,
        amount: Decimal,
        response: Reply<Account>,
    },

    /// Move reserved back into available
    Release {
        number: AccountId,
        amount: Decimal,
        response: Reply<Account>,
    },

    /// Execute and record a transfer unless its id is known
    Settle {
        transfer: Transfer,
        response: Reply<bool>,
    },

    /// Reserve and record an outgoing transfer unless its id is known
    ReserveOutgoing {
        transfer: Transfer,
        response: Reply<bool>,
    },

    /// Turn a reservation into a completed debit
    CompleteReservation {
        id: String,
        response: Reply<Transfer>,
    },

    /// Release a reservation
    ReleaseReservation {
        id: String,
        response: Reply<Transfer>,
    },

    /// Transfer by id
    GetTransfer {
        id: String,
        response: Reply<Option<Transfer>>,
    },

    /// Transfers of one interbank transaction
    GetTransfersFor {
        transaction_id: String,
        response: Reply<Vec<Transfer>>,
    },

    /// Sum of all balances in one currency
    TotalFunds {
        currency: Currency,
        response: Reply<Decimal>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger messages
#[derive(Debug)]
pub struct LedgerActor {
    /// Account state
    book: AccountBook,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(book: AccountBook, mailbox: mpsc::Receiver<LedgerMessage>) -> Self {
        Self { book, mailbox }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let LedgerMessage::Shutdown = msg {
                tracing::info!("Ledger actor shutting down");
                break;
            }
            self.handle_message(msg);
        }
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::OpenAccount { account, response } => {
                let result = self.book.open_account(account);
                let _ = response.send(observe("open_account", result));
            }

            LedgerMessage::GetAccount { number, response } => {
                let _ = response.send(Ok(self.book.account(&number).cloned()));
            }

            LedgerMessage::GetAccountsOf { owner_id, response } => {
                let _ = response.send(Ok(self.book.accounts_of(&owner_id)));
            }

            LedgerMessage::GetAccountOf {
                owner_id,
                currency,
                response,
            } => {
                let _ = response.send(Ok(self.book.account_of(&owner_id, currency)));
            }

            LedgerMessage::Credit {
                number,
                amount,
                response,
            } => {
                let result = self.book.credit(&number, amount);
                let _ = response.send(observe("credit", result));
            }

            LedgerMessage::Debit {
                number,
                amount,
                response,
            } => {
                let result = self.book.debit(&number, amount);
                let _ = response.send(observe("debit", result));
            }

            LedgerMessage::Reserve {
                number,
                amount,
                response,
            } => {
                let result = self.book.reserve(&number, amount);
                let _ = response.send(observe("reserve", result));
            }

            LedgerMessage::Release {
                number,
                amount,
                response,
            } => {
                let result = self.book.release(&number, amount);
                let _ = response.send(observe("release", result));
            }

            LedgerMessage::Settle { transfer, response } => {
                let id = transfer.id.clone();
                let result = self.book.settle(transfer);
                if let Ok(false) = result {
                    tracing::debug!(transfer_id = %id, "Transfer already settled");
                }
                let _ = response.send(observe("settle", result));
            }

            LedgerMessage::ReserveOutgoing { transfer, response } => {
                let result = self.book.reserve_outgoing(transfer);
                let _ = response.send(observe("reserve_outgoing", result));
            }

            LedgerMessage::CompleteReservation { id, response } => {
                let result = self.book.complete_reservation(&id);
                let _ = response.send(observe("complete_reservation", result));
            }

            LedgerMessage::ReleaseReservation { id, response } => {
                let result = self.book.release_reservation(&id);
                let _ = response.send(observe("release_reservation", result));
            }

            LedgerMessage::GetTransfer { id, response } => {
                let _ = response.send(Ok(self.book.transfer(&id).cloned()));
            }

            LedgerMessage::GetTransfersFor {
                transaction_id,
                response,
            } => {
                let _ = response.send(Ok(self.book.transfers_for(&transaction_id)));
            }

            LedgerMessage::TotalFunds { currency, response } => {
                let _ = response.send(Ok(self.book.total_funds(currency)));
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }
}

fn observe<T>(operation: &str, result: Result<T>) -> Result<T> {
    let status = if result.is_ok() { "ok" } else { "error" };
    LEDGER_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
    if let Err(ref e) = result {
        tracing::debug!(operation, error = %e, "Ledger operation rejected");
    }
    result
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> LedgerMessage) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Register an account
    pub async fn open_account(&self, account: Account) -> Result<Account> {
        self.request(|response| LedgerMessage::OpenAccount { account, response })
            .await
    }

    /// Account by number
    pub async fn get_account(&self, number: AccountId) -> Result<Option<Account>> {
        self.request(|response| LedgerMessage::GetAccount { number, response })
            .await
    }

    /// Accounts of one owner
    pub async fn get_accounts_of(&self, owner_id: String) -> Result<Vec<Account>> {
        self.request(|response| LedgerMessage::GetAccountsOf { owner_id, response })
            .await
    }

    /// First account of one owner in one currency
    pub async fn get_account_of(
        &self,
        owner_id: String,
        currency: Currency,
    ) -> Result<Option<Account>> {
        self.request(|response| LedgerMessage::GetAccountOf {
            owner_id,
            currency,
            response,
        })
        .await
    }

    /// Credit available balance
    pub async fn credit(&self, number: AccountId, amount: Decimal) -> Result<Account> {
        self.request(|response| LedgerMessage::Credit {
            number,
            amount,
            response,
        })
        .await
    }

    /// Debit available balance
    pub async fn debit(&self, number: AccountId, amount: Decimal) -> Result<Account> {
        self.request(|response| LedgerMessage::Debit {
            number,
            amount,
            response,
        })
        .await
    }

    /// Reserve funds
    pub async fn reserve(&self, number: AccountId, amount: Decimal) -> Result<Account> {
        self.request(|response| LedgerMessage::Reserve {
            number,
            amount,
            response,
        })
        .await
    }

    /// Release reserved funds
    pub async fn release(&self, number: AccountId, amount: Decimal) -> Result<Account> {
        self.request(|response| LedgerMessage::Release {
            number,
            amount,
            response,
        })
        .await
    }

    /// Execute a transfer
    pub async fn settle(&self, transfer: Transfer) -> Result<bool> {
        self.request(|response| LedgerMessage::Settle { transfer, response })
            .await
    }

    /// Reserve an outgoing transfer
    pub async fn reserve_outgoing(&self, transfer: Transfer) -> Result<bool> {
        self.request(|response| LedgerMessage::ReserveOutgoing { transfer, response })
            .await
    }

    /// Complete a reservation
    pub async fn complete_reservation(&self, id: String) -> Result<Transfer> {
        self.request(|response| LedgerMessage::CompleteReservation { id, response })
            .await
    }

    /// Release a reservation
    pub async fn release_reservation(&self, id: String) -> Result<Transfer> {
        self.request(|response| LedgerMessage::ReleaseReservation { id, response })
            .await
    }

    /// Transfer by id
    pub async fn get_transfer(&self, id: String) -> Result<Option<Transfer>> {
        self.request(|response| LedgerMessage::GetTransfer { id, response })
            .await
    }

    /// Transfers of one interbank transaction
    pub async fn get_transfers_for(&self, transaction_id: String) -> Result<Vec<Transfer>> {
        self.request(|response| LedgerMessage::GetTransfersFor {
            transaction_id,
            response,
        })
        .await
    }

    /// Sum of all balances in one currency
    pub async fn total_funds(&self, currency: Currency) -> Result<Decimal> {
        self.request(|response| LedgerMessage::TotalFunds { currency, response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(book: AccountBook, mailbox_capacity: usize) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let actor = LedgerActor::new(book, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}
