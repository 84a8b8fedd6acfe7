use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
};

use log::*;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{EventHandler, EventProducer, Handler},
    order_events::{EventFilter, OrderEvent},
    traits::Subscription,
};

struct Subscriber {
    id: u64,
    filter: EventFilter,
    token: CancellationToken,
    producer: EventProducer<OrderEvent>,
}

/// Push-delivery bookkeeping shared by the event log adapters.
///
/// Every subscription gets its own [`EventHandler`] task. Releasing the subscription stops that task, and the handler
/// itself checks the subscription before it runs, so nothing is delivered once `unsubscribe` has returned.
pub struct SubscriberRegistry {
    buffer_size: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size, next_id: AtomicU64::new(1), subscribers: Mutex::new(Vec::new()) }
    }

    /// Must be called from within a tokio runtime.
    pub fn register(&self, filter: EventFilter, handler: Handler<OrderEvent>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let guard = token.clone();
        let gated: Handler<OrderEvent> = Arc::new(move |ev: OrderEvent| {
            let handler = Arc::clone(&handler);
            let guard = guard.clone();
            Box::pin(async move {
                if !guard.is_cancelled() {
                    (handler)(ev).await;
                }
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        let event_handler = EventHandler::new(self.buffer_size, gated);
        let producer = event_handler.subscribe();
        tokio::spawn(event_handler.start_handler_until(token.clone()));
        debug!("📬️ Subscription #{id} registered. {filter}");
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(Subscriber { id, filter, token: token.clone(), producer });
        Subscription::new(id, token)
    }

    /// Hands `event` to every live subscription whose filter matches it.
    pub async fn dispatch(&self, event: &OrderEvent) {
        let targets = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|s| {
                let live = !s.token.is_cancelled();
                if !live {
                    trace!("📬️ Dropping released subscription #{}", s.id);
                }
                live
            });
            subscribers.iter().filter(|s| s.filter.matches(event)).map(|s| s.producer.clone()).collect::<Vec<_>>()
        };
        trace!("📬️ Dispatching event {} to {} subscribers", event.id, targets.len());
        for producer in targets.into_iter().filter(|p| !p.is_closed()) {
            producer.publish_event(event.clone()).await;
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.iter().filter(|s| !s.token.is_cancelled()).count()
    }
}
