use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    events::Handler,
    order_events::{EventFilter, OrderEvent},
    order_types::EventId,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventLogError {
    #[error("The event log is unavailable: {0}")]
    Unavailable(String),
    #[error("Event storage error: {0}")]
    StorageError(String),
    #[error("Event {0} was rejected by the log: {1}")]
    Rejected(EventId, String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for EventLogError {
    fn from(e: sqlx::Error) -> Self {
        EventLogError::StorageError(e.to_string())
    }
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Returns every event matching `filter`, oldest first. Duplicates are never returned.
    async fn fetch_events(&self, filter: &EventFilter) -> Result<Vec<OrderEvent>, EventLogError>;

    /// Appends an event to the log. Publishing an event that is already on the log is not an error.
    ///
    /// Returns `true` if the event was new.
    async fn publish(&self, event: OrderEvent) -> Result<bool, EventLogError>;

    /// Calls `handler` for every event matching `filter` that is published after this call, until the returned
    /// [`Subscription`] is released.
    async fn subscribe(&self, filter: EventFilter, handler: Handler<OrderEvent>) -> Result<Subscription, EventLogError>;
}

#[async_trait]
impl<T: EventLog + ?Sized> EventLog for Arc<T> {
    async fn fetch_events(&self, filter: &EventFilter) -> Result<Vec<OrderEvent>, EventLogError> {
        (**self).fetch_events(filter).await
    }

    async fn publish(&self, event: OrderEvent) -> Result<bool, EventLogError> {
        (**self).publish(event).await
    }

    async fn subscribe(
        &self,
        filter: EventFilter,
        handler: Handler<OrderEvent>,
    ) -> Result<Subscription, EventLogError> {
        (**self).subscribe(filter, handler).await
    }
}

/// A handle to a push subscription on an [`EventLog`].
///
/// Releasing the subscription is idempotent and may happen from any task. Once [`Subscription::unsubscribe`] has
/// returned, no further events are handed to the subscriber's handler. Dropping the handle does *not* unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    token: CancellationToken,
}

impl Subscription {
    pub fn new(id: u64, token: CancellationToken) -> Self {
        Self { id, token }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// A token that is cancelled when the subscription is released.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
