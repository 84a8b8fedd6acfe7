//! `SqliteEventStore` is a durable local cache of every order event the application has seen or published.
use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use log::*;
use sqlx::SqlitePool;

use super::db::{events, new_pool};
use crate::{
    config::EngineConfig,
    event_log::SubscriberRegistry,
    events::Handler,
    order_events::{EventFilter, OrderEvent},
    traits::{EventLog, EventLogError, Subscription},
};

const MAX_CONNECTIONS: u32 = 5;

#[derive(Clone)]
pub struct SqliteEventStore {
    url: String,
    pool: SqlitePool,
    subscribers: Arc<SubscriberRegistry>,
}

impl Debug for SqliteEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SqliteEventStore ({:?})", self.pool)
    }
}

impl SqliteEventStore {
    /// Creates a new event store connected to the database at `url`.
    pub async fn new_with_url(url: &str, max_connections: u32) -> Result<Self, EventLogError> {
        let pool = new_pool(url, max_connections).await?;
        info!("🗃️ Connected to event store at {url}");
        Ok(Self { url: url.to_string(), pool, subscribers: Arc::new(SubscriberRegistry::new(32)) })
    }

    /// Connects to `config.database_url`, with one push subscription buffer of `config.event_buffer_size` events.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, EventLogError> {
        let store = Self::new_with_url(&config.database_url, MAX_CONNECTIONS).await?;
        Ok(store.with_subscription_buffer(config.event_buffer_size))
    }

    /// Sets the channel buffer used for each push subscription.
    pub fn with_subscription_buffer(mut self, buffer_size: usize) -> Self {
        self.subscribers = Arc::new(SubscriberRegistry::new(buffer_size));
        self
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), EventLogError> {
        sqlx::migrate!("./src/sqlite/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventLogError::StorageError(format!("Migrations failed. {e}")))?;
        debug!("🗃️ Event store migrations complete");
        Ok(())
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.active_subscriptions()
    }
}

#[async_trait]
impl EventLog for SqliteEventStore {
    async fn fetch_events(&self, filter: &EventFilter) -> Result<Vec<OrderEvent>, EventLogError> {
        let mut conn = self.pool.acquire().await?;
        events::fetch_events(filter, &mut conn).await
    }

    async fn publish(&self, event: OrderEvent) -> Result<bool, EventLogError> {
        if !event.has_valid_id() {
            return Err(EventLogError::Rejected(event.id, "the id does not match the event contents".into()));
        }
        let inserted = {
            let mut conn = self.pool.acquire().await?;
            events::idempotent_insert(&event, &mut conn).await?
        };
        if inserted {
            self.subscribers.dispatch(&event).await;
        }
        Ok(inserted)
    }

    async fn subscribe(
        &self,
        filter: EventFilter,
        handler: Handler<OrderEvent>,
    ) -> Result<Subscription, EventLogError> {
        Ok(self.subscribers.register(filter, handler))
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use market_common::Sats;

    use super::*;
    use crate::{
        order_events::{OrderCreation, OrderEventType, OrderMessage, StatusUpdate},
        order_types::{OrderItem, OrderStatusType},
        test_utils::prepare_env::{prepare_test_env, random_db_path},
    };

    async fn store() -> SqliteEventStore {
        let url = random_db_path();
        prepare_test_env(&url).await;
        SqliteEventStore::new_with_url(&url, 5).await.expect("Error creating event store")
    }

    fn creation(order: &str, ts: i64) -> OrderEvent {
        OrderMessage::Creation(OrderCreation {
            order_id: order.into(),
            seller: "seller".into(),
            amount: Sats::from(5_000),
            items: vec![OrderItem::new("mug", 3)],
            content: String::new(),
        })
        .into_event("buyer".into(), Utc.timestamp_opt(ts, 0).unwrap())
    }

    fn confirm(order: &str, ts: i64) -> OrderEvent {
        OrderMessage::StatusUpdate(StatusUpdate {
            order_id: order.into(),
            recipient: "buyer".into(),
            status: OrderStatusType::Confirmed,
        })
        .into_event("seller".into(), Utc.timestamp_opt(ts, 0).unwrap())
    }

    #[tokio::test]
    async fn connects_to_the_configured_store() {
        let url = random_db_path();
        prepare_test_env(&url).await;
        let config = EngineConfig { database_url: url.clone(), event_buffer_size: 2, ..EngineConfig::default() };
        let db = SqliteEventStore::from_config(&config).await.expect("Error creating event store");
        assert_eq!(db.url(), url);
        db.publish(creation("o1", 1_700_000_000)).await.unwrap();
        assert_eq!(db.fetch_events(&EventFilter::for_order("o1".into())).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let db = store().await;
        let ev = creation("o1", 1_700_000_000);
        assert!(db.publish(ev.clone()).await.unwrap());
        assert!(!db.publish(ev.clone()).await.unwrap());
        let events = db.fetch_events(&EventFilter::default()).await.unwrap();
        assert_eq!(events, vec![ev]);
    }

    #[tokio::test]
    async fn filters_are_applied_in_sql() {
        let db = store().await;
        db.publish(confirm("o1", 1_700_000_100)).await.unwrap();
        db.publish(creation("o1", 1_700_000_000)).await.unwrap();
        db.publish(creation("o2", 1_700_000_050)).await.unwrap();

        let o1 = db.fetch_events(&EventFilter::for_order("o1".into())).await.unwrap();
        assert_eq!(o1.len(), 2);
        assert_eq!(o1[0].event_type().unwrap(), OrderEventType::Creation);
        assert!(o1.iter().all(|e| e.has_valid_id()));

        let updates = EventFilter::default().with_event_type(OrderEventType::StatusUpdate);
        assert_eq!(db.fetch_events(&updates).await.unwrap().len(), 1);

        let by_buyer = EventFilter::default().with_author("buyer".into()).with_author("nobody".into());
        assert_eq!(db.fetch_events(&by_buyer).await.unwrap().len(), 2);

        let recent = EventFilter::default().since(Utc.timestamp_opt(1_700_000_050, 0).unwrap()).with_kind(16);
        assert_eq!(db.fetch_events(&recent).await.unwrap().len(), 2);
    }
}
