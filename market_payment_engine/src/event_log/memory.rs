use std::collections::HashMap;

use async_trait::async_trait;
use log::*;
use tokio::sync::RwLock;

use super::SubscriberRegistry;
use crate::{
    events::Handler,
    order_events::{EventFilter, OrderEvent},
    order_types::EventId,
    traits::{EventLog, EventLogError, Subscription},
};

/// An in-process event log. Useful for tests and for running the engine without a relay.
pub struct MemoryEventLog {
    events: RwLock<HashMap<EventId, OrderEvent>>,
    subscribers: SubscriberRegistry,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(32)
    }
}

impl MemoryEventLog {
    pub fn new(buffer_size: usize) -> Self {
        Self { events: RwLock::new(HashMap::new()), subscribers: SubscriberRegistry::new(buffer_size) }
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.active_subscriptions()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn fetch_events(&self, filter: &EventFilter) -> Result<Vec<OrderEvent>, EventLogError> {
        let events = self.events.read().await;
        let mut result = events.values().filter(|e| filter.matches(e)).cloned().collect::<Vec<_>>();
        result.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        trace!("📬️ {} events match: {filter}", result.len());
        Ok(result)
    }

    async fn publish(&self, event: OrderEvent) -> Result<bool, EventLogError> {
        if !event.has_valid_id() {
            return Err(EventLogError::Rejected(event.id, "the id does not match the event contents".into()));
        }
        {
            let mut events = self.events.write().await;
            if events.contains_key(&event.id) {
                trace!("📬️ Event {} is already on the log", event.id);
                return Ok(false);
            }
            events.insert(event.id.clone(), event.clone());
        }
        debug!("📬️ Published {event}");
        self.subscribers.dispatch(&event).await;
        Ok(true)
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
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        events::handler,
        order_events::{ChatMessage, OrderMessage, MESSAGE_KIND},
    };

    fn chat(order: &str, text: &str, ts: i64) -> OrderEvent {
        OrderMessage::Message(ChatMessage { order_id: order.into(), recipient: "seller".into(), text: text.into() })
            .into_event("buyer".into(), Utc.timestamp_opt(ts, 0).unwrap())
    }

    #[tokio::test]
    async fn duplicates_are_stored_once() {
        let log = MemoryEventLog::default();
        let ev = chat("o1", "hi", 10);
        assert!(log.publish(ev.clone()).await.unwrap());
        assert!(!log.publish(ev).await.unwrap());
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn tampered_events_are_rejected() {
        let log = MemoryEventLog::default();
        let mut ev = chat("o1", "hi", 10);
        ev.content = "bye".into();
        assert!(matches!(log.publish(ev).await, Err(EventLogError::Rejected(..))));
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn fetch_is_filtered_and_sorted() {
        let log = MemoryEventLog::default();
        log.publish(chat("o1", "second", 20)).await.unwrap();
        log.publish(chat("o2", "other", 15)).await.unwrap();
        log.publish(chat("o1", "first", 10)).await.unwrap();
        let events = log.fetch_events(&EventFilter::for_order("o1".into()).with_kind(MESSAGE_KIND)).await.unwrap();
        let texts = events.iter().map(|e| e.content.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn subscribers_stop_receiving_after_unsubscribe() {
        let log = MemoryEventLog::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let s2 = seen.clone();
        let sub = log
            .subscribe(
                EventFilter::for_order("o1".into()),
                handler(move |_ev: OrderEvent| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();
        assert_eq!(log.active_subscriptions(), 1);
        log.publish(chat("o1", "one", 1)).await.unwrap();
        log.publish(chat("o2", "not mine", 2)).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(s2.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        log.publish(chat("o1", "two", 3)).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(s2.load(Ordering::SeqCst), 1);
        assert_eq!(log.active_subscriptions(), 0);
    }
}
