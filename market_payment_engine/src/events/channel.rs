//! Simple stateless pub-sub event handler
//!
//! Components publish events through cheap, cloneable [`EventProducer`]s. A single [`EventHandler`] drains them and
//! runs its async [`Handler`] for every event, each on its own task. Handlers have no access to the engine's internal
//! state; all they receive is the event itself.
//!
//! The same machinery carries hook notifications and push subscriptions on the event log.
use std::{future::Future, pin::Pin, sync::Arc};

use log::*;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

pub type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Boxes an async closure into a [`Handler`].
pub fn handler<E, F, Fut>(f: F) -> Handler<E>
where
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |e| Box::pin(f(e)) as Pin<Box<dyn Future<Output = ()> + Send>>)
}

pub struct EventHandler<E: Send + Sync + 'static> {
    listener: mpsc::Receiver<E>,
    sender: mpsc::Sender<E>,
    handler: Handler<E>,
}

impl<E: Send + Sync + 'static> EventHandler<E> {
    pub fn new(buffer_size: usize, handler: Handler<E>) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        Self { listener: receiver, sender, handler }
    }

    pub fn subscribe(&self) -> EventProducer<E> {
        EventProducer::new(self.sender.clone())
    }

    /// Handles events until every producer has been dropped, then waits for in-flight handlers to finish.
    pub async fn start_handler(self) {
        self.run(CancellationToken::new()).await
    }

    /// As [`Self::start_handler`], but also stops taking new events as soon as `cancel` fires.
    pub async fn start_handler_until(self, cancel: CancellationToken) {
        self.run(cancel).await
    }

    async fn run(mut self, cancel: CancellationToken) {
        debug!("📬️ Starting event handler");
        // Only producers keep the channel open from here on
        drop(self.sender);
        let mut jobs = JoinSet::new();
        loop {
            let ev = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    trace!("📬️ Event handler cancelled");
                    break;
                },
                ev = self.listener.recv() => ev,
            };
            let Some(ev) = ev else { break };
            trace!("📬️ Handling event");
            let handler = Arc::clone(&self.handler);
            jobs.spawn(async move { (handler)(ev).await });
            // Reap finished jobs so the set does not grow without bound
            while let Some(res) = jobs.try_join_next() {
                log_job_result(res);
            }
        }
        while let Some(res) = jobs.join_next().await {
            log_job_result(res);
        }
        debug!("📬️ Event handler has shut down");
    }
}

fn log_job_result(res: Result<(), tokio::task::JoinError>) {
    match res {
        Ok(()) => trace!("📬️ Event handled"),
        Err(e) => warn!("📬️ An event handler failed: {e}"),
    }
}

#[derive(Clone)]
pub struct EventProducer<E: Send + Sync> {
    sender: mpsc::Sender<E>,
}

impl<E: Send + Sync> EventProducer<E> {
    pub fn new(sender: mpsc::Sender<E>) -> Self {
        Self { sender }
    }

    pub async fn publish_event(&self, event: E) {
        if let Err(e) = self.sender.send(event).await {
            error!("📬️ Failed to send event: {e}");
        }
    }

    /// True once the handler on the other end has shut down.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[tokio::test]
    async fn handler_drains_every_producer() {
        let _ = env_logger::try_init();
        let count = Arc::new(AtomicU64::new(0));
        let c2 = count.clone();
        let event_handler = EventHandler::new(
            1,
            handler(move |v: u64| {
                let count = count.clone();
                async move {
                    count.fetch_add(v, Ordering::SeqCst);
                    tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
                }
            }),
        );
        let producer_1 = event_handler.subscribe();
        let producer_2 = event_handler.subscribe();
        tokio::spawn(async move {
            for i in 0..5 {
                producer_1.publish_event(i * 2 + 1).await;
            }
        });
        tokio::spawn(async move {
            for i in 0..5 {
                producer_2.publish_event(i * 2).await;
            }
        });

        event_handler.start_handler().await;
        assert_eq!(c2.load(Ordering::SeqCst), 45);
    }

    #[tokio::test]
    async fn cancelled_handler_ignores_later_events() {
        let count = Arc::new(AtomicU64::new(0));
        let c2 = count.clone();
        let event_handler = EventHandler::new(
            4,
            handler(move |_: u64| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        let producer = event_handler.subscribe();
        let token = CancellationToken::new();
        let task = tokio::spawn(event_handler.start_handler_until(token.clone()));
        producer.publish_event(1).await;
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        token.cancel();
        task.await.unwrap();
        assert!(producer.is_closed());
        producer.publish_event(2).await;
        assert_eq!(c2.load(Ordering::SeqCst), 1);
    }
}
