use std::{future::Future, pin::Pin, sync::Arc};

use log::*;

use crate::events::{
    CheckoutCompletedEvent,
    EventHandler,
    EventProducer,
    Handler,
    InvoiceExpiredEvent,
    InvoicePaidEvent,
    OrderStatusChangedEvent,
};

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cloneable fan-out to every registered hook handler.
#[derive(Default, Clone)]
pub struct EventProducers {
    pub invoice_paid_producer: Vec<EventProducer<InvoicePaidEvent>>,
    pub checkout_completed_producer: Vec<EventProducer<CheckoutCompletedEvent>>,
    pub invoice_expired_producer: Vec<EventProducer<InvoiceExpiredEvent>>,
    pub order_status_changed_producer: Vec<EventProducer<OrderStatusChangedEvent>>,
}

impl EventProducers {
    pub async fn publish_invoice_paid(&self, event: InvoicePaidEvent) {
        for producer in &self.invoice_paid_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn publish_checkout_completed(&self, event: CheckoutCompletedEvent) {
        for producer in &self.checkout_completed_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn publish_invoice_expired(&self, event: InvoiceExpiredEvent) {
        for producer in &self.invoice_expired_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn publish_order_status_changed(&self, event: OrderStatusChangedEvent) {
        for producer in &self.order_status_changed_producer {
            producer.publish_event(event.clone()).await;
        }
    }
}

pub struct EventHandlers {
    pub on_invoice_paid: Option<EventHandler<InvoicePaidEvent>>,
    pub on_checkout_completed: Option<EventHandler<CheckoutCompletedEvent>>,
    pub on_invoice_expired: Option<EventHandler<InvoiceExpiredEvent>>,
    pub on_order_status_changed: Option<EventHandler<OrderStatusChangedEvent>>,
}

impl EventHandlers {
    pub fn new(buffer_size: usize, hooks: EventHooks) -> Self {
        let on_invoice_paid = hooks.on_invoice_paid.map(|f| EventHandler::new(buffer_size, f));
        let on_checkout_completed = hooks.on_checkout_completed.map(|f| EventHandler::new(buffer_size, f));
        let on_invoice_expired = hooks.on_invoice_expired.map(|f| EventHandler::new(buffer_size, f));
        let on_order_status_changed = hooks.on_order_status_changed.map(|f| EventHandler::new(buffer_size, f));
        Self { on_invoice_paid, on_checkout_completed, on_invoice_expired, on_order_status_changed }
    }

    pub fn producers(&self) -> EventProducers {
        let mut result = EventProducers::default();
        if let Some(handler) = &self.on_invoice_paid {
            result.invoice_paid_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_checkout_completed {
            result.checkout_completed_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_invoice_expired {
            result.invoice_expired_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_order_status_changed {
            result.order_status_changed_producer.push(handler.subscribe());
        }
        result
    }

    /// Spawns a task per registered hook. Each task ends once every producer for it has been dropped.
    pub fn start_handlers(self) {
        let mut count = 0;
        if let Some(handler) = self.on_invoice_paid {
            tokio::spawn(handler.start_handler());
            count += 1;
        }
        if let Some(handler) = self.on_checkout_completed {
            tokio::spawn(handler.start_handler());
            count += 1;
        }
        if let Some(handler) = self.on_invoice_expired {
            tokio::spawn(handler.start_handler());
            count += 1;
        }
        if let Some(handler) = self.on_order_status_changed {
            tokio::spawn(handler.start_handler());
            count += 1;
        }
        debug!("📬️ Started {count} hook handlers");
    }
}

#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_invoice_paid: Option<Handler<InvoicePaidEvent>>,
    pub on_checkout_completed: Option<Handler<CheckoutCompletedEvent>>,
    pub on_invoice_expired: Option<Handler<InvoiceExpiredEvent>>,
    pub on_order_status_changed: Option<Handler<OrderStatusChangedEvent>>,
}

impl EventHooks {
    pub fn on_invoice_paid<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(InvoicePaidEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_invoice_paid = Some(Arc::new(f));
        self
    }

    pub fn on_checkout_completed<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(CheckoutCompletedEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_checkout_completed = Some(Arc::new(f));
        self
    }

    pub fn on_invoice_expired<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(InvoiceExpiredEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_invoice_expired = Some(Arc::new(f));
        self
    }

    pub fn on_order_status_changed<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderStatusChangedEvent) -> HookFuture) + Send + Sync + 'static {
        self.on_order_status_changed = Some(Arc::new(f));
        self
    }
}
