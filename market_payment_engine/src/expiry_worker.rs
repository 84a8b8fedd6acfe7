//! Proactively expires stale invoices, so that a UI sees an invoice lapse when it happens rather than the next time
//! someone reads it.
use std::time::Duration;

use chrono::Utc;
use log::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{EventProducers, InvoiceExpiredEvent},
    mpe_api::InvoiceLedger,
};

/// Spawns the expiry loop. It runs every `interval` until `cancel` fires.
pub fn start_invoice_expiry_worker(
    ledger: InvoiceLedger,
    producers: EventProducers,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("🕰️ Invoice expiry worker started. Scanning every {}ms", interval.as_millis());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            let expired = ledger.expire_stale(Utc::now()).await;
            if expired.is_empty() {
                continue;
            }
            info!("🕰️ {} invoices have expired", expired.len());
            for invoice in expired {
                producers.publish_invoice_expired(InvoiceExpiredEvent::new(invoice)).await;
            }
        }
        info!("🕰️ Invoice expiry worker stopped");
    })
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use market_common::Sats;

    use super::*;
    use crate::{
        events::{EventHandlers, EventHooks},
        mpe_api::checkout_objects::{Invoice, InvoiceDraft},
        order_types::{InvoiceStatus, RecipientKind},
    };

    #[tokio::test]
    async fn stale_invoices_are_expired_and_announced() {
        let expired = Arc::new(AtomicUsize::new(0));
        let e2 = expired.clone();
        let mut hooks = EventHooks::default();
        hooks.on_invoice_expired(move |ev| {
            let expired = expired.clone();
            Box::pin(async move {
                assert_eq!(ev.invoice.status, InvoiceStatus::Expired);
                expired.fetch_add(1, Ordering::SeqCst);
            })
        });
        let handlers = EventHandlers::new(4, hooks);
        let producers = handlers.producers();
        handlers.start_handlers();

        let ledger = InvoiceLedger::new(chrono::Duration::milliseconds(20), false);
        let draft = InvoiceDraft {
            checkout_id: "c1".into(),
            order_id: "o1".into(),
            seller: "s1".into(),
            recipient: "s1".into(),
            recipient_kind: RecipientKind::Merchant,
            amount: Sats::from(100),
            description: "o1".into(),
        };
        let invoice = Invoice::pending("i1".into(), &draft, Utc::now(), ledger.invoice_lifetime());
        ledger.insert_invoice(invoice).await;

        let cancel = CancellationToken::new();
        let worker = start_invoice_expiry_worker(ledger.clone(), producers, Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        worker.await.unwrap();
        assert_eq!(e2.load(Ordering::SeqCst), 1);
        let invoice = ledger.invoice(&"i1".into()).await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Expired);
    }
}
