//! Protocol orchestrator
//!
//! Ties the event store, vote engine, settlement applier and delivery engine
//! into the two-phase commit protocol.
//!
//! Inbound: decode, record exactly once, process, and answer with a vote that
//! is stored so duplicates get the identical body back.
//!
//! Outbound: record, hand to the delivery engine, and react to the peer's
//! vote by sending COMMIT_TX or ROLLBACK_TX under the proposal's key.

use crate::applier::{leg_transfer_id, transaction_ref, SettlementApplier};
use crate::codec::{InterbankMessage, MessageBody};
use crate::config::Config;
use crate::delivery::{DeliveryEngine, DeliveryOutcome, RetryPolicy};
use crate::metrics::{INBOUND_MESSAGES_TOTAL, REPLAYS_TOTAL, VOTES_TOTAL};
use crate::oracle::ValuationOracle;
use crate::protocol::{
    Asset, CommitTransaction, Envelope, ForeignBankId, IdempotenceKey, MessageType, Posting,
    ReasonCode, RollbackTransaction, Transaction, TxAccount, Vote,
};
use crate::resolve::{AccountResolver, Resolution};
use crate::store::{
    DeliveryStatus, Direction, Event, EventDelivery, EventStatus, EventStore, NewDelivery,
    NewEvent,
};
use crate::transport::PeerTransport;
use crate::vote::VoteEngine;
use crate::{Error, Result};
use actix_web::ResponseError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ledger_core::{AccountId, AccountLedger, CurrencyDirectory, Transfer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Services the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    /// Idempotency ledger
    pub store: Arc<dyn EventStore>,
    /// Account ledger
    pub ledger: Arc<dyn AccountLedger>,
    /// Supported currencies
    pub currencies: Arc<dyn CurrencyDirectory>,
    /// Valuation oracle for non-monetary legs
    pub oracle: Arc<dyn ValuationOracle>,
    /// Outbound HTTP
    pub transport: Arc<dyn PeerTransport>,
}

/// Answer to an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReply {
    /// JSON vote, byte-identical across duplicates
    pub body: String,
    /// Whether the body was replayed from the first successful handling
    pub replayed: bool,
}

/// Result of forwarding a message on behalf of an internal service
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutcome {
    /// Already delivered earlier; nothing was sent
    AlreadyDelivered(Event),
    /// Recorded and handed to the delivery engine
    Forwarded(Event),
}

/// Money transfer requested by a local client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundTransfer {
    /// Local account to debit
    pub from_account: String,
    /// Recipient at the peer bank
    pub to: TxAccount,
    /// Positive amount
    pub amount: Decimal,
    /// ISO currency code
    pub currency: String,
    /// Free text
    #[serde(default)]
    pub message: String,
}

/// An event with its delivery history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventHistory {
    /// The event
    pub event: Event,
    /// Every attempt, oldest first
    pub deliveries: Vec<EventDelivery>,
}

struct Inner {
    routing_number: u32,
    peer_url: String,
    store: Arc<dyn EventStore>,
    resolver: AccountResolver,
    votes: VoteEngine,
    applier: SettlementApplier,
    delivery: DeliveryEngine,
    /// Inbound events a task of this process is handling right now
    handling: DashMap<i64, ()>,
}

/// Exclusive right to handle one inbound event, released on drop
struct Claim {
    inner: Arc<Inner>,
    event_id: i64,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.inner.handling.remove(&self.event_id);
    }
}

/// Two-phase commit coordinator and participant for one bank
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
    outcome_loop: Arc<AbortHandle>,
}

impl Orchestrator {
    /// Wire the components together and start reacting to delivery outcomes.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: &Config, collaborators: Collaborators) -> Self {
        let resolver = AccountResolver::new(
            config.bank.routing_number,
            collaborators.ledger,
            collaborators.currencies,
        );
        let votes = VoteEngine::new(resolver.clone(), collaborators.oracle.clone());
        let applier = SettlementApplier::new(
            resolver.clone(),
            collaborators.store.clone(),
            collaborators.oracle,
        );
        let policy = RetryPolicy {
            max_attempts: config.delivery.max_attempts,
            delay: config.delivery.retry_delay(),
        };
        let (delivery, outcomes) = DeliveryEngine::new(
            collaborators.store.clone(),
            collaborators.transport,
            policy,
            config.peer.api_key.clone(),
        );

        let inner = Arc::new(Inner {
            routing_number: config.bank.routing_number,
            peer_url: config.peer.url.clone(),
            store: collaborators.store,
            resolver,
            votes,
            applier,
            delivery,
            handling: DashMap::new(),
        });

        let outcome_loop = tokio::spawn(Self::outcome_loop(inner.clone(), outcomes)).abort_handle();

        info!(
            routing_number = config.bank.routing_number,
            peer = %config.peer.url,
            "Interbank orchestrator started"
        );

        Self {
            inner,
            outcome_loop: Arc::new(outcome_loop),
        }
    }

    async fn outcome_loop(inner: Arc<Inner>, mut outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>) {
        while let Some(outcome) = outcomes.recv().await {
            let event_id = outcome.event().id;
            if let Err(e) = inner.handle_outcome(outcome).await {
                error!(event_id, error = %e, "Failed to act on delivery outcome");
            }
        }
    }

    /// This bank's routing number
    pub fn routing_number(&self) -> u32 {
        self.inner.routing_number
    }

    /// Handle a message POSTed by a peer bank.
    ///
    /// Schema errors are returned before anything is recorded. A duplicate
    /// of a handled message gets the first reply back verbatim; a duplicate
    /// of one still being handled gets `InFlight`.
    ///
    /// Processing runs on its own task, so a caller that goes away does not
    /// leave the event half handled. A PENDING event that no task of this
    /// process holds was orphaned (crash, store failure) and is taken over.
    pub async fn receive_inbound(&self, raw: &[u8], source_url: &str) -> Result<InboundReply> {
        let message = match InterbankMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                INBOUND_MESSAGES_TOTAL
                    .with_label_values(&["unknown", "rejected"])
                    .inc();
                return Err(e.into());
            }
        };
        let message_type = message.message_type();
        let transaction_id = match &message.body {
            MessageBody::NewTx(tx) => Some(tx.transaction_id.clone()),
            _ => None,
        };

        let (event, created) = self
            .inner
            .store
            .record_if_new(NewEvent {
                idempotence_key: message.idempotence_key.clone(),
                message_type,
                direction: Direction::Incoming,
                payload: String::from_utf8_lossy(raw).into_owned(),
                url: source_url.to_string(),
                transaction_id,
            })
            .await?;

        let in_flight = |event: &Event| {
            INBOUND_MESSAGES_TOTAL
                .with_label_values(&[message_type.as_str(), "in_flight"])
                .inc();
            Err(Error::InFlight(event.idempotence_key.to_string()))
        };

        let Some(claim) = self.inner.claim(event.id) else {
            return in_flight(&event);
        };

        if !created {
            // The holder of the previous claim may have finished in between
            let status = self
                .inner
                .store
                .get(event.id)
                .await?
                .map_or(event.status, |current| current.status);
            match status {
                EventStatus::Success => return self.inner.replay(&event).await,
                EventStatus::Pending => {
                    if self.inner.store.first_successful_delivery(event.id).await?.is_some() {
                        self.inner.store.set_status(event.id, EventStatus::Success).await?;
                        return self.inner.replay(&event).await;
                    }
                    warn!(event_id = event.id, "Taking over orphaned message");
                }
                EventStatus::Failed => {
                    // Reprocess, unless another node reclaimed it first
                    if !self
                        .inner
                        .store
                        .transition(event.id, EventStatus::Failed, EventStatus::Pending)
                        .await?
                    {
                        return in_flight(&event);
                    }
                    info!(event_id = event.id, "Reprocessing previously failed message");
                }
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _claim = claim;
            inner.process(&event, message).await
        })
        .await
        .unwrap_or_else(|e| Err(Error::Internal(format!("inbound handler aborted: {}", e))))
    }

    /// Propose a money transfer from a local account to the peer bank.
    ///
    /// The amount is reserved before anything is sent; validation and
    /// funding errors are returned synchronously and leave no event behind.
    pub async fn originate(&self, request: OutboundTransfer) -> Result<IdempotenceKey> {
        let inner = &self.inner;
        if request.amount <= Decimal::ZERO {
            return Err(Error::InvalidRequest(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        let currency = inner.resolver.currency(&request.currency)?;

        let from = AccountId::new(request.from_account.as_str());
        if !from.belongs_to(inner.routing_number) {
            return Err(Error::InvalidRequest(format!(
                "{} is not an account of bank {}",
                from, inner.routing_number
            )));
        }
        let account = inner
            .resolver
            .ledger()
            .find_by_account_number(&from)
            .await?
            .ok_or_else(|| Error::UnknownAccount(from.to_string()))?;
        if account.currency != currency {
            return Err(Error::InvalidRequest(format!(
                "account {} holds {}, not {}",
                from, account.currency, currency
            )));
        }

        if !matches!(
            inner.resolver.resolve(&request.to, currency).await?,
            Resolution::Foreign
        ) {
            return Err(Error::InvalidRequest(format!(
                "recipient {:?} is not at another bank",
                request.to
            )));
        }

        let key = IdempotenceKey::generate(inner.routing_number);
        let transaction_id = key.as_transaction_id();
        let tx = Transaction {
            postings: vec![
                Posting {
                    account: TxAccount::Account {
                        num: Some(from.to_string()),
                    },
                    amount: -request.amount,
                    asset: Asset::money(currency.code()),
                },
                Posting {
                    account: request.to,
                    amount: request.amount,
                    asset: Asset::money(currency.code()),
                },
            ],
            message: request.message,
            transaction_id: transaction_id.clone(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        };

        let transfer = Transfer::outgoing(
            leg_transfer_id(&transaction_id, 2, 0),
            transaction_ref(&transaction_id),
            from,
            request.amount,
            currency,
        )
        .with_description(tx.message.clone());
        inner.applier.reserve_outbound(transfer).await?;

        let message = InterbankMessage::new(key.clone(), MessageBody::NewTx(tx));
        if let Err(e) = inner.send_message(message, &inner.peer_url).await {
            if let Err(release) = inner.applier.release_outbound(&transaction_id).await {
                error!(transaction_id = %transaction_id, error = %release, "Failed to release reservation");
            }
            return Err(e);
        }

        info!(
            transaction_id = %transaction_id,
            amount = %request.amount,
            currency = %currency,
            "Transfer proposed"
        );
        Ok(key)
    }

    /// Send a message an internal service built, at most once.
    ///
    /// Local debit legs of a NEW_TX are reserved before it leaves.
    pub async fn internal_forward(&self, message: InterbankMessage) -> Result<ForwardOutcome> {
        let inner = &self.inner;
        if let Some(existing) = inner
            .store
            .find_typed(&message.idempotence_key, message.message_type())
            .await?
        {
            if inner.store.first_successful_delivery(existing.id).await?.is_some() {
                return Ok(ForwardOutcome::AlreadyDelivered(existing));
            }
        }

        let proposal = match &message.body {
            MessageBody::NewTx(tx) => {
                inner.applier.reserve_proposal(tx).await?;
                Some(tx.transaction_id.clone())
            }
            _ => None,
        };

        match inner.send_message(message, &inner.peer_url).await {
            Ok(event) => Ok(ForwardOutcome::Forwarded(event)),
            Err(e) => {
                if let Some(transaction_id) = proposal {
                    if let Err(release) = inner.applier.release_outbound(&transaction_id).await {
                        error!(transaction_id = %transaction_id, error = %release, "Failed to release reservation");
                    }
                }
                Err(e)
            }
        }
    }

    /// Record and deliver a message given as a type tag and raw body
    pub async fn send_outbound(
        &self,
        idempotence_key: IdempotenceKey,
        message_type: MessageType,
        payload: &serde_json::Value,
        target_url: &str,
    ) -> Result<Event> {
        let body = crate::codec::validate(message_type, payload)?;
        self.inner
            .send_message(InterbankMessage::new(idempotence_key, body), target_url)
            .await
    }

    /// An event and its delivery history
    pub async fn event_history(&self, event_id: i64) -> Result<Option<EventHistory>> {
        let Some(event) = self.inner.store.get(event_id).await? else {
            return Ok(None);
        };
        let deliveries = self.inner.store.deliveries(event_id).await?;
        Ok(Some(EventHistory { event, deliveries }))
    }

    /// Outbound chains still running
    pub fn deliveries_in_flight(&self) -> usize {
        self.inner.delivery.in_flight()
    }

    /// Stop delivering and reacting to outcomes
    pub fn shutdown(&self) {
        self.inner.delivery.shutdown();
        self.outcome_loop.abort();
    }
}

impl Inner {
    fn claim(self: &Arc<Self>, event_id: i64) -> Option<Claim> {
        match self.handling.entry(event_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Claim {
                    inner: self.clone(),
                    event_id,
                })
            }
        }
    }

    async fn replay(&self, event: &Event) -> Result<InboundReply> {
        let stored = self
            .store
            .first_successful_delivery(event.id)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("event {} has no stored response", event.id))
            })?;
        REPLAYS_TOTAL
            .with_label_values(&[event.message_type.as_str()])
            .inc();
        INBOUND_MESSAGES_TOTAL
            .with_label_values(&[event.message_type.as_str(), "replayed"])
            .inc();
        info!(
            event_id = event.id,
            idempotence_key = %event.idempotence_key,
            "Replaying stored response"
        );
        Ok(InboundReply {
            body: stored.response_body,
            replayed: true,
        })
    }

    async fn process(&self, event: &Event, message: InterbankMessage) -> Result<InboundReply> {
        let started = Instant::now();
        let message_type = message.message_type();

        let outcome = match message.body {
            MessageBody::NewTx(tx) => {
                let proposal = Envelope {
                    idempotence_key: message.idempotence_key,
                    message_type,
                    message: tx,
                };
                self.votes.vote(&proposal).await
            }
            MessageBody::CommitTx(commit) => match self.applier.apply_commit(&commit).await {
                Ok(()) => Ok(Vote::yes()),
                Err(e) => {
                    warn!(
                        transaction_id = %commit.transaction_id,
                        error = %e,
                        "Commit could not be applied"
                    );
                    Ok(Vote::no(ReasonCode::CommitTxFailed, None))
                }
            },
            MessageBody::RollbackTx(rollback) => {
                if let Err(e) = self.applier.apply_rollback(&rollback).await {
                    error!(
                        transaction_id = %rollback.transaction_id,
                        error = %e,
                        "Rollback could not be applied"
                    );
                }
                Ok(Vote::yes())
            }
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        match outcome {
            Ok(vote) => {
                let body = serde_json::to_string(&vote)?;
                self.store
                    .append_delivery(NewDelivery {
                        event_id: event.id,
                        status: DeliveryStatus::Success,
                        http_status: 200,
                        response_body: body.clone(),
                        duration_ms,
                    })
                    .await?;
                self.store.set_status(event.id, EventStatus::Success).await?;

                let decision = if vote.is_yes() { "YES" } else { "NO" };
                VOTES_TOTAL
                    .with_label_values(&[message_type.as_str(), decision])
                    .inc();
                INBOUND_MESSAGES_TOTAL
                    .with_label_values(&[message_type.as_str(), "processed"])
                    .inc();
                info!(
                    event_id = event.id,
                    idempotence_key = %event.idempotence_key,
                    message_type = %message_type,
                    vote = decision,
                    "Inbound message handled"
                );
                Ok(InboundReply {
                    body,
                    replayed: false,
                })
            }
            Err(e) => {
                let recorded = self
                    .store
                    .append_delivery(NewDelivery {
                        event_id: event.id,
                        status: DeliveryStatus::Failed,
                        http_status: i32::from(e.status_code().as_u16()),
                        response_body: e.to_string(),
                        duration_ms,
                    })
                    .await;
                if let Err(store_error) = recorded {
                    error!(event_id = event.id, error = %store_error, "Failed to record failed handling");
                }
                self.store.set_status(event.id, EventStatus::Failed).await?;
                INBOUND_MESSAGES_TOTAL
                    .with_label_values(&[message_type.as_str(), "error"])
                    .inc();
                warn!(event_id = event.id, error = %e, "Inbound message failed");
                Err(e)
            }
        }
    }

    /// Record an outgoing message and start delivering it.
    ///
    /// Re-sending a recorded message reuses the stored event; a running or
    /// finished chain is not started again.
    async fn send_message(&self, message: InterbankMessage, url: &str) -> Result<Event> {
        let payload = message.encode()?;
        let transaction_id = match &message.body {
            MessageBody::NewTx(tx) => Some(tx.transaction_id.clone()),
            _ => None,
        };

        let (event, created) = self
            .store
            .record_if_new(NewEvent {
                idempotence_key: message.idempotence_key.clone(),
                message_type: message.message_type(),
                direction: Direction::Outgoing,
                payload,
                url: url.to_string(),
                transaction_id,
            })
            .await?;

        if created || event.status == EventStatus::Pending {
            self.delivery.enqueue(event.clone());
        }
        Ok(event)
    }

    async fn follow_up(
        &self,
        proposal: &Event,
        message_type: MessageType,
        transaction_id: ForeignBankId,
    ) -> Result<Event> {
        let body = match message_type {
            MessageType::CommitTx => MessageBody::CommitTx(CommitTransaction { transaction_id }),
            MessageType::RollbackTx => {
                MessageBody::RollbackTx(RollbackTransaction { transaction_id })
            }
            MessageType::NewTx => {
                return Err(Error::Internal("NEW_TX is not a follow-up".to_string()))
            }
        };
        let message = InterbankMessage::new(proposal.idempotence_key.clone(), body);
        self.send_message(message, &proposal.url).await
    }

    async fn abort_proposal(&self, event: &Event, transaction_id: ForeignBankId) -> Result<()> {
        self.applier.release_outbound(&transaction_id).await?;
        self.follow_up(event, MessageType::RollbackTx, transaction_id)
            .await
            .map(|_| ())
    }

    async fn handle_outcome(&self, outcome: DeliveryOutcome) -> Result<()> {
        let event = outcome.event();
        let transaction_id = InterbankMessage::decode(event.payload.as_bytes())?
            .body
            .transaction_id()
            .clone();

        match (event.message_type, &outcome) {
            (MessageType::NewTx, DeliveryOutcome::Delivered { vote, .. }) if vote.is_yes() => {
                info!(transaction_id = %transaction_id, "Proposal accepted, committing");
                self.follow_up(event, MessageType::CommitTx, transaction_id)
                    .await?;
            }
            (MessageType::NewTx, DeliveryOutcome::Delivered { vote, .. }) => {
                info!(
                    transaction_id = %transaction_id,
                    reason = ?vote.first_reason(),
                    "Proposal rejected, rolling back"
                );
                self.abort_proposal(event, transaction_id).await?;
            }
            (MessageType::NewTx, DeliveryOutcome::Exhausted { .. }) => {
                warn!(transaction_id = %transaction_id, "Proposal undeliverable, rolling back");
                self.abort_proposal(event, transaction_id).await?;
            }
            (MessageType::CommitTx, DeliveryOutcome::Delivered { vote, .. }) if vote.is_yes() => {
                self.applier
                    .apply_commit(&CommitTransaction {
                        transaction_id: transaction_id.clone(),
                    })
                    .await?;
                info!(transaction_id = %transaction_id, "Transaction committed");
            }
            (MessageType::CommitTx, DeliveryOutcome::Delivered { vote, .. }) => {
                error!(
                    transaction_id = %transaction_id,
                    reason = ?vote.first_reason(),
                    "Peer could not apply commit, releasing reservation"
                );
                self.applier.release_outbound(&transaction_id).await?;
            }
            (MessageType::CommitTx, DeliveryOutcome::Exhausted { .. }) => {
                error!(
                    transaction_id = %transaction_id,
                    "Commit undeliverable, reservation kept for manual resolution"
                );
            }
            (MessageType::RollbackTx, DeliveryOutcome::Delivered { .. }) => {
                info!(transaction_id = %transaction_id, "Rollback acknowledged");
            }
            (MessageType::RollbackTx, DeliveryOutcome::Exhausted { .. }) => {
                error!(transaction_id = %transaction_id, "Rollback undeliverable");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use crate::transport::HttpReply;
    use async_trait::async_trait;
    use ledger_core::{Account, Currency, Ledger, TransferStatus};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoOracle;

    #[async_trait]
    impl ValuationOracle for NoOracle {
        async fn vote(&self, _proposal: &Envelope<Transaction>) -> Result<Vote> {
            Err(Error::OracleUnreachable("no oracle".to_string()))
        }

        async fn notify_commit(&self, _proposal: &Envelope<Transaction>) -> Result<()> {
            Ok(())
        }
    }

    /// Takes five seconds to approve anything
    struct SlowOracle;

    #[async_trait]
    impl ValuationOracle for SlowOracle {
        async fn vote(&self, _proposal: &Envelope<Transaction>) -> Result<Vote> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(Vote::yes())
        }

        async fn notify_commit(&self, _proposal: &Envelope<Transaction>) -> Result<()> {
            Ok(())
        }
    }

    /// Memory store whose next write of SUCCESS fails
    #[derive(Default)]
    struct FlakyStore {
        events: MemoryEventStore,
        fail_success: AtomicBool,
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn record_if_new(&self, event: NewEvent) -> Result<(Event, bool)> {
            self.events.record_if_new(event).await
        }

        async fn find(&self, key: &IdempotenceKey) -> Result<Option<Event>> {
            self.events.find(key).await
        }

        async fn find_typed(
            &self,
            key: &IdempotenceKey,
            message_type: MessageType,
        ) -> Result<Option<Event>> {
            self.events.find_typed(key, message_type).await
        }

        async fn find_by_transaction_id(
            &self,
            transaction_id: &ForeignBankId,
        ) -> Result<Option<Event>> {
            self.events.find_by_transaction_id(transaction_id).await
        }

        async fn get(&self, id: i64) -> Result<Option<Event>> {
            self.events.get(id).await
        }

        async fn set_status(&self, id: i64, status: EventStatus) -> Result<()> {
            if status == EventStatus::Success && self.fail_success.swap(false, Ordering::SeqCst) {
                return Err(Error::Database(sqlx::Error::PoolTimedOut));
            }
            self.events.set_status(id, status).await
        }

        async fn transition(&self, id: i64, from: EventStatus, to: EventStatus) -> Result<bool> {
            self.events.transition(id, from, to).await
        }

        async fn append_delivery(&self, delivery: NewDelivery) -> Result<EventDelivery> {
            self.events.append_delivery(delivery).await
        }

        async fn first_delivery(&self, event_id: i64) -> Result<Option<EventDelivery>> {
            self.events.first_delivery(event_id).await
        }

        async fn first_successful_delivery(&self, event_id: i64) -> Result<Option<EventDelivery>> {
            self.events.first_successful_delivery(event_id).await
        }

        async fn deliveries(&self, event_id: i64) -> Result<Vec<EventDelivery>> {
            self.events.deliveries(event_id).await
        }
    }

    /// Answers every POST with the same vote and keeps what it was sent
    struct Peer {
        vote: Option<Vote>,
        sent: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl PeerTransport for Peer {
        async fn post(&self, _url: &str, _api_key: Option<&str>, body: String) -> Result<HttpReply> {
            self.sent.lock().push(serde_json::from_str(&body)?);
            match &self.vote {
                Some(vote) => Ok(HttpReply {
                    status: 200,
                    body: serde_json::to_string(vote)?,
                }),
                None => Err(Error::PeerUnreachable("down".to_string())),
            }
        }
    }

    struct Node {
        orchestrator: Orchestrator,
        ledger: Arc<Ledger>,
        store: Arc<MemoryEventStore>,
        peer: Arc<Peer>,
    }

    async fn node(peer_vote: Option<Vote>) -> Node {
        node_with(peer_vote, Arc::new(NoOracle)).await
    }

    async fn node_with(peer_vote: Option<Vote>, oracle: Arc<dyn ValuationOracle>) -> Node {
        let mut config = Config::default();
        config.bank.routing_number = 222;
        config.peer.routing_number = 111;
        config.peer.url = "http://bank-111/interbank".to_string();
        config.delivery.max_attempts = 2;

        let ledger = Arc::new(Ledger::start(ledger_core::Config::default()));
        ledger
            .open_account(Account::open("222-X", "p1", Currency::EUR, dec!(1000)))
            .await
            .unwrap();
        let store = Arc::new(MemoryEventStore::new());
        let peer = Arc::new(Peer {
            vote: peer_vote,
            sent: Mutex::new(Vec::new()),
        });
        let orchestrator = Orchestrator::start(
            &config,
            Collaborators {
                store: store.clone(),
                ledger: ledger.clone(),
                currencies: ledger.clone(),
                oracle,
                transport: peer.clone(),
            },
        );
        Node {
            orchestrator,
            ledger,
            store,
            peer,
        }
    }

    fn proposal(key: &str, amount: f64) -> Vec<u8> {
        json!({
            "idempotenceKey": {"routingNumber": 111, "locallyGeneratedKey": key},
            "messageType": "NEW_TX",
            "message": {
                "transactionId": {"routingNumber": 111, "id": key},
                "message": "rent",
                "postings": [
                    {"account": {"type": "ACCOUNT", "num": "111-A"}, "amount": -amount,
                     "asset": {"type": "MONAS", "asset": {"currency": "EUR"}}},
                    {"account": {"type": "PERSON", "id": {"routingNumber": 222, "id": "p1"}},
                     "amount": amount, "asset": {"type": "MONAS", "asset": {"currency": "EUR"}}}
                ]
            }
        })
        .to_string()
        .into_bytes()
    }

    fn follow_up(key: &str, message_type: &str) -> Vec<u8> {
        json!({
            "idempotenceKey": {"routingNumber": 111, "locallyGeneratedKey": key},
            "messageType": message_type,
            "message": {"transactionId": {"routingNumber": 111, "id": key}}
        })
        .to_string()
        .into_bytes()
    }

    async fn available(ledger: &Ledger, number: &str) -> Decimal {
        ledger
            .find_by_account_number(&AccountId::new(number))
            .await
            .unwrap()
            .unwrap()
            .available
    }

    #[tokio::test]
    async fn test_inbound_proposal_then_commit() {
        let n = node(None).await;

        let reply = n
            .orchestrator
            .receive_inbound(&proposal("t1", 100.0), "http://bank-111")
            .await
            .unwrap();
        assert_eq!(reply.body, r#"{"vote":"YES"}"#);
        assert!(!reply.replayed);
        assert_eq!(available(&n.ledger, "222-X").await, dec!(1000));

        let reply = n
            .orchestrator
            .receive_inbound(&follow_up("t1", "COMMIT_TX"), "http://bank-111")
            .await
            .unwrap();
        assert_eq!(reply.body, r#"{"vote":"YES"}"#);
        assert_eq!(available(&n.ledger, "222-X").await, dec!(1100));

        // Duplicate commit is answered from the store and credits nothing
        let again = n
            .orchestrator
            .receive_inbound(&follow_up("t1", "COMMIT_TX"), "http://bank-111")
            .await
            .unwrap();
        assert!(again.replayed);
        assert_eq!(again.body, reply.body);
        assert_eq!(available(&n.ledger, "222-X").await, dec!(1100));
    }

    #[tokio::test]
    async fn test_schema_error_records_nothing() {
        let n = node(None).await;
        let bad = json!({
            "idempotenceKey": {"routingNumber": 111, "locallyGeneratedKey": "bad"},
            "messageType": "COMMIT_TX",
            "message": {"postings": []}
        })
        .to_string();

        let err = n
            .orchestrator
            .receive_inbound(bad.as_bytes(), "http://bank-111")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
        assert!(n
            .store
            .find(&IdempotenceKey::new(111, "bad"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_commit_for_unknown_transaction_votes_no() {
        let n = node(None).await;
        let reply = n
            .orchestrator
            .receive_inbound(&follow_up("ghost", "COMMIT_TX"), "http://bank-111")
            .await
            .unwrap();
        let vote: Vote = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::CommitTxFailed));
    }

    #[tokio::test]
    async fn test_failed_handling_is_retried() {
        let n = node(None).await;
        let raw = json!({
            "idempotenceKey": {"routingNumber": 111, "locallyGeneratedKey": "opt"},
            "messageType": "NEW_TX",
            "message": {
                "transactionId": {"routingNumber": 111, "id": "opt"},
                "postings": [
                    {"account": {"type": "PERSON", "id": {"routingNumber": 222, "id": "p1"}},
                     "amount": 1, "asset": {"type": "STOCK", "asset": {"ticker": "X"}}},
                    {"account": {"type": "PERSON", "id": {"routingNumber": 111, "id": "s"}},
                     "amount": -1, "asset": {"type": "STOCK", "asset": {"ticker": "X"}}}
                ]
            }
        })
        .to_string();

        for _ in 0..2 {
            let err = n
                .orchestrator
                .receive_inbound(raw.as_bytes(), "http://bank-111")
                .await
                .unwrap_err();
            assert!(matches!(err, Error::OracleUnreachable(_)));
        }

        let event = n
            .store
            .find(&IdempotenceKey::new(111, "opt"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        let deliveries = n.store.deliveries(event.id).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].http_status, 503);
    }

    #[tokio::test]
    async fn test_originate_rejections_are_synchronous() {
        let n = node(None).await;
        let request = |from: &str, amount: Decimal, currency: &str| OutboundTransfer {
            from_account: from.to_string(),
            to: TxAccount::Person {
                id: ForeignBankId::new(111, "q"),
            },
            amount,
            currency: currency.to_string(),
            message: String::new(),
        };

        let err = n
            .orchestrator
            .originate(request("222-X", dec!(5000), "EUR"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let err = n
            .orchestrator
            .originate(request("222-NOPE", dec!(5), "EUR"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAccount(_)));

        let err = n
            .orchestrator
            .originate(request("222-X", dec!(5), "XAU"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCurrency(_)));

        let err = n
            .orchestrator
            .originate(request("222-X", dec!(-5), "EUR"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        // Both legs would be local to this bank
        let mut to_self = request("222-X", dec!(5), "EUR");
        to_self.to = TxAccount::Person {
            id: ForeignBankId::new(222, "p1"),
        };
        let err = n.orchestrator.originate(to_self).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        assert!(n.peer.sent.lock().is_empty());
        assert_eq!(available(&n.ledger, "222-X").await, dec!(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_originate_commits_on_yes() {
        let n = node(Some(Vote::yes())).await;
        let key = n
            .orchestrator
            .originate(OutboundTransfer {
                from_account: "222-X".to_string(),
                to: TxAccount::Person {
                    id: ForeignBankId::new(111, "q"),
                },
                amount: dec!(250),
                currency: "EUR".to_string(),
                message: "tuition".to_string(),
            })
            .await
            .unwrap();

        while n.orchestrator.deliveries_in_flight() > 0
            || n.store.find_typed(&key, MessageType::CommitTx).await.unwrap().map(|e| e.status)
                != Some(EventStatus::Success)
        {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // let the outcome loop apply the commit
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let sent = n.peer.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["messageType"], "NEW_TX");
        assert_eq!(sent[1]["messageType"], "COMMIT_TX");
        assert_eq!(sent[1]["idempotenceKey"], sent[0]["idempotenceKey"]);

        let transfer = n.ledger.find_transfer(&key.to_string()).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert_eq!(available(&n.ledger, "222-X").await, dec!(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_originate_rolls_back_on_no() {
        let n = node(Some(Vote::no(ReasonCode::NoSuchUser, None))).await;
        let key = n
            .orchestrator
            .originate(OutboundTransfer {
                from_account: "222-X".to_string(),
                to: TxAccount::Person {
                    id: ForeignBankId::new(111, "nobody"),
                },
                amount: dec!(250),
                currency: "EUR".to_string(),
                message: String::new(),
            })
            .await
            .unwrap();

        while n
            .store
            .find_typed(&key, MessageType::RollbackTx)
            .await
            .unwrap()
            .map(|e| e.status)
            != Some(EventStatus::Success)
        {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let transfer = n.ledger.find_transfer(&key.to_string()).await.unwrap().unwrap();
        assert_eq!(transfer.status, TransferStatus::RolledBack);
        assert_eq!(available(&n.ledger, "222-X").await, dec!(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_forward_once() {
        let n = node(Some(Vote::yes())).await;
        let message = InterbankMessage::new(
            IdempotenceKey::new(222, "rb-1"),
            MessageBody::RollbackTx(RollbackTransaction {
                transaction_id: ForeignBankId::new(222, "rb-1"),
            }),
        );

        let first = n.orchestrator.internal_forward(message.clone()).await.unwrap();
        let ForwardOutcome::Forwarded(event) = first else {
            panic!("expected a forward");
        };
        while n.store.first_successful_delivery(event.id).await.unwrap().is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let second = n.orchestrator.internal_forward(message).await.unwrap();
        assert!(matches!(second, ForwardOutcome::AlreadyDelivered(_)));
        assert_eq!(n.peer.sent.lock().len(), 1);

        let history = n.orchestrator.event_history(event.id).await.unwrap().unwrap();
        assert_eq!(history.deliveries.len(), 1);
    }

    fn stock_proposal(key: &str) -> Vec<u8> {
        json!({
            "idempotenceKey": {"routingNumber": 111, "locallyGeneratedKey": key},
            "messageType": "NEW_TX",
            "message": {
                "transactionId": {"routingNumber": 111, "id": key},
                "message": "shares",
                "postings": [
                    {"account": {"type": "PERSON", "id": {"routingNumber": 222, "id": "p1"}},
                     "amount": 5.0, "asset": {"type": "STOCK", "asset": {"ticker": "ACME"}}},
                    {"account": {"type": "PERSON", "id": {"routingNumber": 111, "id": "s"}},
                     "amount": -5.0, "asset": {"type": "STOCK", "asset": {"ticker": "ACME"}}}
                ]
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_still_completes() {
        let n = node_with(None, Arc::new(SlowOracle)).await;
        let raw = stock_proposal("s");

        let first = {
            let orchestrator = n.orchestrator.clone();
            let raw = raw.clone();
            tokio::spawn(async move { orchestrator.receive_inbound(&raw, "http://bank-111").await })
        };
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        first.abort();

        // Still being voted on by the oracle
        let retry = n.orchestrator.receive_inbound(&raw, "http://bank-111").await;
        assert!(matches!(retry, Err(Error::InFlight(_))));

        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        let key = IdempotenceKey::new(111, "s");
        let event = n.store.find_typed(&key, MessageType::NewTx).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Success);

        let retry = n
            .orchestrator
            .receive_inbound(&raw, "http://bank-111")
            .await
            .unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.body, r#"{"vote":"YES"}"#);
    }

    #[tokio::test]
    async fn test_orphaned_pending_event_is_taken_over() {
        let mut config = Config::default();
        config.bank.routing_number = 222;
        config.peer.routing_number = 111;

        let ledger = Arc::new(Ledger::start(ledger_core::Config::default()));
        ledger
            .open_account(Account::open("222-X", "p1", Currency::EUR, dec!(1000)))
            .await
            .unwrap();
        let store = Arc::new(FlakyStore::default());
        store.fail_success.store(true, Ordering::SeqCst);
        let orchestrator = Orchestrator::start(
            &config,
            Collaborators {
                store: store.clone(),
                ledger: ledger.clone(),
                currencies: ledger,
                oracle: Arc::new(NoOracle),
                transport: Arc::new(Peer {
                    vote: None,
                    sent: Mutex::new(Vec::new()),
                }),
            },
        );

        // The vote is recorded but the status write fails
        let raw = proposal("o1", 10.0);
        let err = orchestrator
            .receive_inbound(&raw, "http://bank-111")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        let key = IdempotenceKey::new(111, "o1");
        let event = store.find_typed(&key, MessageType::NewTx).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Pending);

        let retry = orchestrator
            .receive_inbound(&raw, "http://bank-111")
            .await
            .unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.body, r#"{"vote":"YES"}"#);
        let event = store.get(event.id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Success);
        assert_eq!(store.deliveries(event.id).await.unwrap().len(), 1);
    }
}
