//! Outbound delivery engine
//!
//! Each outgoing event gets one background task that POSTs its payload to the
//! event's URL until the peer answers 2xx with a readable vote, or the retry
//! budget runs out. At most one task runs per event id. Every attempt is
//! appended to the event's delivery history, and the final result is
//! published on the outcome channel.

use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, DELIVERY_DURATION};
use crate::protocol::Vote;
use crate::store::{
    DeliveryStatus, Event, EventStatus, EventStore, NewDelivery, NETWORK_FAILURE_STATUS,
};
use crate::transport::PeerTransport;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Fixed-delay retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(20),
        }
    }
}

/// Terminal result of delivering one event
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Peer answered with a vote
    Delivered {
        /// The event, status `SUCCESS`
        event: Event,
        /// Peer's vote
        vote: Vote,
    },
    /// Every attempt failed
    Exhausted {
        /// The event, status `FAILED`
        event: Event,
    },
}

impl DeliveryOutcome {
    /// The delivered or abandoned event
    pub fn event(&self) -> &Event {
        match self {
            DeliveryOutcome::Delivered { event, .. } | DeliveryOutcome::Exhausted { event } => event,
        }
    }
}

struct Inner {
    store: Arc<dyn EventStore>,
    transport: Arc<dyn PeerTransport>,
    policy: RetryPolicy,
    api_key: String,
    tasks: DashMap<i64, AbortHandle>,
    outcomes: mpsc::UnboundedSender<DeliveryOutcome>,
}

/// Schedules and runs delivery chains
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<Inner>,
}

impl DeliveryEngine {
    /// Create an engine and the receiver its outcomes are published on
    pub fn new(
        store: Arc<dyn EventStore>,
        transport: Arc<dyn PeerTransport>,
        policy: RetryPolicy,
        api_key: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryOutcome>) {
        let (outcomes, receiver) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Arc::new(Inner {
                store,
                transport,
                policy,
                api_key: api_key.into(),
                tasks: DashMap::new(),
                outcomes,
            }),
        };
        (engine, receiver)
    }

    /// Start delivering `event` unless a chain for it is already running.
    ///
    /// Returns whether a new chain was started.
    pub fn enqueue(&self, event: Event) -> bool {
        let id = event.id;
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let inner = self.inner.clone();

        // The chain waits for the start signal so it can never run unregistered
        let handle = tokio::spawn(async move {
            if start_rx.await.is_err() {
                return;
            }
            inner.run(event).await;
            inner.tasks.remove(&id);
        });

        let scheduled = match self.inner.tasks.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle.abort_handle());
                true
            }
        };

        if scheduled {
            let _ = start_tx.send(());
            debug!(event_id = id, "Delivery scheduled");
        } else {
            handle.abort();
            debug!(event_id = id, "Delivery already running");
        }
        scheduled
    }

    /// Whether a chain is running for `event_id`
    pub fn is_scheduled(&self, event_id: i64) -> bool {
        self.inner.tasks.contains_key(&event_id)
    }

    /// Number of running chains
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Abort every running chain. Their events stay `PENDING`.
    pub fn shutdown(&self) {
        let ids: Vec<i64> = self.inner.tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.inner.tasks.remove(&id) {
                handle.abort();
            }
        }
        info!("Delivery engine stopped");
    }
}

impl Inner {
    async fn run(&self, mut event: Event) {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if let Some(vote) = self.attempt(&event, attempt).await {
                event.status = EventStatus::Success;
                if let Err(e) = self.store.set_status(event.id, EventStatus::Success).await {
                    error!(event_id = event.id, error = %e, "Failed to mark event delivered");
                }
                info!(
                    event_id = event.id,
                    message_type = %event.message_type,
                    attempt,
                    vote = ?vote.vote,
                    "Message delivered"
                );
                let _ = self.outcomes.send(DeliveryOutcome::Delivered { event, vote });
                return;
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        event.status = EventStatus::Failed;
        if let Err(e) = self.store.set_status(event.id, EventStatus::Failed).await {
            error!(event_id = event.id, error = %e, "Failed to mark event failed");
        }
        warn!(
            event_id = event.id,
            message_type = %event.message_type,
            attempts = max_attempts,
            "Delivery attempts exhausted"
        );
        let _ = self.outcomes.send(DeliveryOutcome::Exhausted { event });
    }

    /// One POST; `Some(vote)` on success
    async fn attempt(&self, event: &Event, attempt: u32) -> Option<Vote> {
        let started = Instant::now();
        let result = self
            .transport
            .post(&event.url, Some(&self.api_key), event.payload.clone())
            .await;
        let elapsed = started.elapsed();

        let (http_status, body, vote) = match result {
            Ok(reply) => {
                let vote = if reply.is_success() {
                    serde_json::from_str::<Vote>(&reply.body).ok()
                } else {
                    None
                };
                (i32::from(reply.status), reply.body, vote)
            }
            Err(e) => {
                warn!(event_id = event.id, attempt, error = %e, "Delivery attempt failed");
                (NETWORK_FAILURE_STATUS, e.to_string(), None)
            }
        };

        let status = if vote.is_some() {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Failed
        };

        let message_type = event.message_type.as_str();
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[message_type, status.as_str()])
            .inc();
        DELIVERY_DURATION
            .with_label_values(&[message_type])
            .observe(elapsed.as_secs_f64());

        if let Err(e) = self
            .store
            .append_delivery(NewDelivery {
                event_id: event.id,
                status,
                http_status,
                response_body: body,
                duration_ms: elapsed.as_millis() as i64,
            })
            .await
        {
            error!(event_id = event.id, error = %e, "Failed to record delivery attempt");
        }

        debug!(event_id = event.id, attempt, http_status, "Delivery attempt finished");
        vote
    }
}
