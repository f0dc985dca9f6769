//! In-memory event store

use super::{
    DeliveryStatus, Event, EventDelivery, EventStatus, EventStore, NewDelivery, NewEvent,
};
use crate::protocol::{ForeignBankId, IdempotenceKey, MessageType};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Inner {
    /// Indexed by id - 1
    events: Vec<Event>,
    unique: HashMap<(IdempotenceKey, MessageType), i64>,
    deliveries: Vec<EventDelivery>,
}

impl Inner {
    fn event_mut(&mut self, id: i64) -> Result<&mut Event> {
        usize::try_from(id - 1)
            .ok()
            .and_then(|idx| self.events.get_mut(idx))
            .ok_or_else(|| Error::Internal(format!("Event {} not found", id)))
    }
}

/// Event store held in process memory
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
}

impl MemoryEventStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn record_if_new(&self, event: NewEvent) -> Result<(Event, bool)> {
        let mut inner = self.inner.lock();
        let index_key = (event.idempotence_key.clone(), event.message_type);

        if let Some(&id) = inner.unique.get(&index_key) {
            let existing = inner.event_mut(id)?.clone();
            return Ok((existing, false));
        }

        let id = inner.events.len() as i64 + 1;
        let stored = Event {
            id,
            idempotence_key: event.idempotence_key,
            message_type: event.message_type,
            direction: event.direction,
            payload: event.payload,
            url: event.url,
            transaction_id: event.transaction_id,
            status: EventStatus::Pending,
            created_at: Utc::now(),
        };
        inner.events.push(stored.clone());
        inner.unique.insert(index_key, id);
        Ok((stored, true))
    }

    async fn find(&self, key: &IdempotenceKey) -> Result<Option<Event>> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .find(|e| &e.idempotence_key == key)
            .cloned())
    }

    async fn find_typed(
        &self,
        key: &IdempotenceKey,
        message_type: MessageType,
    ) -> Result<Option<Event>> {
        let mut inner = self.inner.lock();
        match inner.unique.get(&(key.clone(), message_type)).copied() {
            Some(id) => Ok(Some(inner.event_mut(id)?.clone())),
            None => Ok(None),
        }
    }

    async fn find_by_transaction_id(
        &self,
        transaction_id: &ForeignBankId,
    ) -> Result<Option<Event>> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .find(|e| {
                e.message_type == MessageType::NewTx
                    && e.transaction_id.as_ref() == Some(transaction_id)
            })
            .cloned())
    }

    async fn get(&self, id: i64) -> Result<Option<Event>> {
        let mut inner = self.inner.lock();
        Ok(inner.event_mut(id).ok().map(|e| e.clone()))
    }

    async fn set_status(&self, id: i64, status: EventStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.event_mut(id)?.status = status;
        Ok(())
    }

    async fn transition(&self, id: i64, from: EventStatus, to: EventStatus) -> Result<bool> {
        let mut inner = self.inner.lock();
        let event = inner.event_mut(id)?;
        if event.status != from {
            return Ok(false);
        }
        event.status = to;
        Ok(true)
    }

    async fn append_delivery(&self, delivery: NewDelivery) -> Result<EventDelivery> {
        let mut inner = self.inner.lock();
        inner.event_mut(delivery.event_id)?;

        let stored = EventDelivery {
            id: inner.deliveries.len() as i64 + 1,
            event_id: delivery.event_id,
            status: delivery.status,
            http_status: delivery.http_status,
            response_body: delivery.response_body,
            duration_ms: delivery.duration_ms,
            sent_at: Utc::now(),
        };
        inner.deliveries.push(stored.clone());
        Ok(stored)
    }

    async fn first_delivery(&self, event_id: i64) -> Result<Option<EventDelivery>> {
        let inner = self.inner.lock();
        Ok(inner
            .deliveries
            .iter()
            .find(|d| d.event_id == event_id)
            .cloned())
    }

    async fn first_successful_delivery(&self, event_id: i64) -> Result<Option<EventDelivery>> {
        let inner = self.inner.lock();
        Ok(inner
            .deliveries
            .iter()
            .find(|d| d.event_id == event_id && d.status == DeliveryStatus::Success)
            .cloned())
    }

    async fn deliveries(&self, event_id: i64) -> Result<Vec<EventDelivery>> {
        let inner = self.inner.lock();
        Ok(inner
            .deliveries
            .iter()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect())
    }
}
