//! # Payment reconciler
//!
//! Three independent sources can report that an invoice has been paid: a payment made directly from the buyer's own
//! wallet, a payment pushed through an interactively connected wallet, and a manually entered proof backed by a
//! receipt on the event log. Exactly one of them settles any given invoice, and the reconciler never assumes which.
//!
//! [`PaymentReconciler::on_completion_signal`] is the single entry point for all of them. It is idempotent: the first
//! accepted signal marks the invoice `paid`, publishes a receipt and fires the hooks; every later signal for the same
//! invoice returns `false` and does nothing.
//!
//! [`PaymentReconciler::bulk_pay`] drains a checkout's pending invoices through one connected wallet, strictly one
//! at a time, waiting for the completion signal of each invoice before moving on to the next.
//!
//! [`PaymentReconciler::cancel_checkout`] releases every subscription held for a checkout and discards its invoices.
//! It may be called at any point, from any task, any number of times.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use chrono::Utc;
use log::*;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use super::{
    checkout_objects::Invoice,
    errors::ReconcileError,
    ledger::{InvoiceLedger, SettleOutcome},
};
use crate::{
    events::{handler, EventProducers, InvoicePaidEvent},
    helpers::{extract_preimage, verify_preimage},
    order_events::{EventFilter, OrderEvent, OrderMessage, PaymentReceipt, PaymentTag, PAYMENT_RECEIPT_KIND},
    order_types::{CheckoutId, InvoiceId, PublicKey},
    traits::{CompletionSignal, EventLog, PayOutcome, PaymentProof, PaymentRail, Subscription},
};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long a connected wallet has to become ready before bulk payment gives up
    pub wallet_ready_timeout: Duration,
    /// How long to wait for a completion signal after a wallet accepted a payment without returning a proof
    pub receipt_wait_timeout: Duration,
    /// Pause between successive bulk payments
    pub bulk_pay_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            wallet_ready_timeout: Duration::from_secs(30),
            receipt_wait_timeout: Duration::from_secs(90),
            bulk_pay_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPayReport {
    pub checkout_id: CheckoutId,
    /// Invoices paid during this run, in payment order
    pub paid: Vec<InvoiceId>,
    pub checkout_complete: bool,
}

#[derive(Default)]
struct CheckoutWatch {
    token: CancellationToken,
    subscriptions: Vec<Subscription>,
}

struct ReconcilerInner {
    ledger: InvoiceLedger,
    log: Arc<dyn EventLog>,
    payer: PublicKey,
    producers: EventProducers,
    config: ReconcilerConfig,
    settled_tx: broadcast::Sender<InvoiceId>,
    watches: Mutex<HashMap<CheckoutId, CheckoutWatch>>,
}

//--------------------------------------  PaymentReconciler   ---------------------------------------------------------
#[derive(Clone)]
pub struct PaymentReconciler {
    inner: Arc<ReconcilerInner>,
}

impl PaymentReconciler {
    /// `payer` is the key that authors receipts for invoices settled through this reconciler.
    pub fn new(
        ledger: InvoiceLedger,
        log: Arc<dyn EventLog>,
        payer: PublicKey,
        producers: EventProducers,
        config: ReconcilerConfig,
    ) -> Self {
        let (settled_tx, _) = broadcast::channel(64);
        let watches = Mutex::new(HashMap::new());
        let inner = ReconcilerInner { ledger, log, payer, producers, config, settled_tx, watches };
        Self { inner: Arc::new(inner) }
    }

    pub fn ledger(&self) -> &InvoiceLedger {
        &self.inner.ledger
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.inner.config
    }

    async fn invoice(&self, invoice_id: &InvoiceId) -> Result<Invoice, ReconcileError> {
        self.inner.ledger.invoice(invoice_id).await.ok_or_else(|| ReconcileError::InvoiceNotFound(invoice_id.clone()))
    }

    pub async fn handle_signal(&self, signal: CompletionSignal) -> Result<bool, ReconcileError> {
        self.on_completion_signal(&signal.invoice_id, signal.proof).await
    }

    /// Applies a completion signal from any rail. Returns `true` only for the signal that marked the invoice paid.
    pub async fn on_completion_signal(
        &self,
        invoice_id: &InvoiceId,
        proof: PaymentProof,
    ) -> Result<bool, ReconcileError> {
        let ledger = &self.inner.ledger;
        let invoice = self.invoice(invoice_id).await?;
        if invoice.status.is_settled() {
            debug!("💸️ Ignoring {proof} for invoice {invoice_id}. It is already {}", invoice.status);
            return Ok(false);
        }
        verify_proof(&invoice, &proof)?;
        let outcome = ledger.mark_paid(invoice_id, proof.clone()).await?;
        if !outcome.applied {
            debug!("💸️ Invoice {invoice_id} was settled by another signal in the meantime");
            return Ok(false);
        }
        info!("💸️ Invoice {invoice_id} settled by {proof}");
        if !matches!(proof, PaymentProof::Receipt { .. }) {
            self.publish_receipt(&outcome.invoice, &proof).await;
        }
        self.notify_settled(outcome, Some(proof)).await;
        Ok(true)
    }

    /// Defers settlement of an invoice, when the ledger allows it.
    pub async fn skip_invoice(&self, invoice_id: &InvoiceId) -> Result<bool, ReconcileError> {
        let outcome = self.inner.ledger.skip(invoice_id).await?;
        let applied = outcome.applied;
        if applied {
            self.notify_settled(outcome, None).await;
        }
        Ok(applied)
    }

    async fn publish_receipt(&self, invoice: &Invoice, proof: &PaymentProof) {
        let receipt = OrderMessage::PaymentReceipt(PaymentReceipt {
            order_id: invoice.order_id.clone(),
            payee: invoice.recipient.clone(),
            invoice_id: invoice.id.clone(),
            payment: PaymentTag::new(proof.method(), proof.reference()),
            amount: invoice.amount,
        });
        let event = receipt.into_event(self.inner.payer.clone(), Utc::now());
        match self.inner.log.publish(event).await {
            Ok(_) => debug!("💸️ Published receipt for invoice {}", invoice.id),
            // The invoice stays paid. The receipt can be re-sent from the invoice's proof.
            Err(e) => warn!("💸️ Could not publish the receipt for invoice {}. {e}", invoice.id),
        }
    }

    async fn notify_settled(&self, outcome: SettleOutcome, proof: Option<PaymentProof>) {
        let _ = self.inner.settled_tx.send(outcome.invoice.id.clone());
        if let Some(proof) = proof {
            self.inner.producers.publish_invoice_paid(InvoicePaidEvent::new(outcome.invoice, proof)).await;
        }
        if let Some(completed) = outcome.checkout_completed {
            self.release_watch(&completed.checkout_id);
            self.inner.producers.publish_checkout_completed(completed).await;
        }
    }

    //--------------------------------------  Manual proof entry  -----------------------------------------------------
    /// Settles an invoice from proof text pasted by the user.
    ///
    /// A preimage in the text is checked against the invoice's payment hash when the rail supplied one. Otherwise the
    /// text must match the proof carried by a receipt for the invoice on the event log.
    pub async fn submit_manual_proof(&self, invoice_id: &InvoiceId, text: &str) -> Result<bool, ReconcileError> {
        let invoice = self.invoice(invoice_id).await?;
        let preimage = extract_preimage(text);
        if let (Some(preimage), Some(_)) = (&preimage, &invoice.payment_hash) {
            return self.on_completion_signal(invoice_id, PaymentProof::Preimage(preimage.clone())).await;
        }
        let needle = preimage.unwrap_or_else(|| text.trim().to_string());
        if needle.is_empty() {
            return Err(proof_rejected(invoice_id, "No proof was given"));
        }
        let filter = EventFilter::for_order(invoice.order_id.clone()).with_kind(PAYMENT_RECEIPT_KIND);
        for event in self.inner.log.fetch_events(&filter).await? {
            let Ok(OrderMessage::PaymentReceipt(receipt)) = event.parse() else {
                continue;
            };
            if receipt_matches(&receipt, &invoice) && receipt.payment.reference.eq_ignore_ascii_case(&needle) {
                let proof = PaymentProof::Receipt { event_id: event.id.clone(), proof: receipt.payment.reference };
                return self.on_completion_signal(invoice_id, proof).await;
            }
        }
        Err(proof_rejected(invoice_id, "No receipt on the event log carries this proof"))
    }

    //--------------------------------------  Receipt observation -----------------------------------------------------
    /// Subscribes to receipts for every order in the checkout, and applies the receipts already on the log.
    ///
    /// Returns the number of subscriptions held. Calling this again for a watched checkout does nothing.
    pub async fn watch_checkout(&self, checkout_id: &CheckoutId) -> Result<usize, ReconcileError> {
        let sets = self.inner.ledger.checkout_sets(checkout_id).await?;
        let token = {
            let mut watches = self.lock_watches();
            let watch = watches.entry(checkout_id.clone()).or_default();
            if !watch.subscriptions.is_empty() {
                return Ok(watch.subscriptions.len());
            }
            watch.token.clone()
        };
        let mut count = 0;
        for set in &sets {
            let filter = EventFilter::for_order(set.order_id.clone())
                .with_kind(PAYMENT_RECEIPT_KIND)
                .with_author(self.inner.payer.clone());
            let weak = Arc::downgrade(&self.inner);
            let on_receipt = handler(move |event: OrderEvent| {
                let weak: Weak<ReconcilerInner> = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        PaymentReconciler { inner }.on_receipt_event(event).await;
                    }
                }
            });
            let subscription = self.inner.log.subscribe(filter.clone(), on_receipt).await?;
            if !self.hold_subscription(checkout_id, &token, subscription) {
                return Err(ReconcileError::Cancelled(checkout_id.clone()));
            }
            count += 1;
            for event in self.inner.log.fetch_events(&filter).await? {
                self.on_receipt_event(event).await;
            }
        }
        debug!("📬️ Watching {count} orders for receipts in checkout {checkout_id}");
        Ok(count)
    }

    // Keeps the subscription unless the checkout was cancelled while it was being set up.
    fn hold_subscription(
        &self,
        checkout_id: &CheckoutId,
        token: &CancellationToken,
        subscription: Subscription,
    ) -> bool {
        let mut watches = self.lock_watches();
        match watches.get_mut(checkout_id) {
            Some(watch) if !token.is_cancelled() => {
                watch.subscriptions.push(subscription);
                true
            },
            _ => {
                subscription.unsubscribe();
                false
            },
        }
    }

    async fn on_receipt_event(&self, event: OrderEvent) {
        let receipt = match event.parse() {
            Ok(OrderMessage::PaymentReceipt(receipt)) => receipt,
            Ok(other) => {
                trace!("💸️ Ignoring {} event {} on the receipt subscription", other.event_type(), event.id);
                return;
            },
            Err(e) => {
                debug!("💸️ Ignoring malformed receipt {}. {e}", event.id);
                return;
            },
        };
        let Some(invoice) = self.match_receipt(&receipt).await else {
            trace!("💸️ Receipt {} does not match any open invoice", event.id);
            return;
        };
        let proof = PaymentProof::Receipt { event_id: event.id.clone(), proof: receipt.payment.reference };
        if let Err(e) = self.on_completion_signal(&invoice.id, proof).await {
            warn!("💸️ Could not apply receipt {} to invoice {}. {e}", event.id, invoice.id);
        }
    }

    /// The invoice a receipt settles: by invoice id when it is known, otherwise by recipient and amount.
    async fn match_receipt(&self, receipt: &PaymentReceipt) -> Option<Invoice> {
        let ledger = &self.inner.ledger;
        if let Some(invoice) = ledger.invoice(&receipt.invoice_id).await.filter(|i| receipt_matches(receipt, i)) {
            return Some(invoice);
        }
        ledger
            .invoices_for_order(&receipt.order_id)
            .await
            .into_iter()
            .find(|i| !i.status.is_settled() && i.recipient == receipt.payee && i.amount == receipt.amount)
    }

    //--------------------------------------      Bulk pay       ------------------------------------------------------
    /// Pays every pending invoice of the checkout through `rail`, one at a time.
    ///
    /// Each payment must be confirmed before the next one starts. The first rail error halts the run, leaving the
    /// remaining invoices untouched. A wallet that accepts a payment but never produces a completion signal leaves
    /// the invoice `processing` and flagged unconfirmed; it is never marked paid without proof.
    pub async fn bulk_pay(
        &self,
        checkout_id: &CheckoutId,
        rail: Arc<dyn PaymentRail>,
    ) -> Result<BulkPayReport, ReconcileError> {
        let token = self.checkout_token(checkout_id);
        let ready = tokio::select! {
            _ = token.cancelled() => return Err(ReconcileError::Cancelled(checkout_id.clone())),
            r = tokio::time::timeout(self.inner.config.wallet_ready_timeout, rail.wait_until_ready()) => r,
        };
        match ready {
            Ok(result) => result?,
            Err(_) => return Err(ReconcileError::WalletNotReady),
        }
        let queue = self.inner.ledger.payable_invoices(checkout_id).await?;
        info!("💸️ Bulk paying {} invoices for checkout {checkout_id} via {}", queue.len(), rail.name());
        self.inner.ledger.set_live_run(checkout_id, true).await?;
        let result = self.drain_queue(checkout_id, queue, rail.as_ref(), &token).await;
        if let Err(e) = self.inner.ledger.set_live_run(checkout_id, false).await {
            debug!("💸️ Checkout {checkout_id} went away during bulk payment. {e}");
        }
        let paid = result?;
        let checkout_complete = self.inner.ledger.is_checkout_settled(checkout_id).await?;
        if checkout_complete {
            self.release_watch(checkout_id);
        }
        let count = paid.len();
        info!("💸️ Bulk payment for checkout {checkout_id} paid {count} invoices. Complete: {checkout_complete}");
        Ok(BulkPayReport { checkout_id: checkout_id.clone(), paid, checkout_complete })
    }

    async fn drain_queue(
        &self,
        checkout_id: &CheckoutId,
        queue: Vec<Invoice>,
        rail: &dyn PaymentRail,
        token: &CancellationToken,
    ) -> Result<Vec<InvoiceId>, ReconcileError> {
        let ledger = &self.inner.ledger;
        let cancelled = || ReconcileError::Cancelled(checkout_id.clone());
        let mut paid = Vec::with_capacity(queue.len());
        for (i, queued) in queue.into_iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = token.cancelled() => return Err(cancelled()),
                    _ = tokio::time::sleep(self.inner.config.bulk_pay_delay) => {},
                }
            }
            if token.is_cancelled() {
                return Err(cancelled());
            }
            match ledger.invoice(&queued.id).await {
                None => return Err(cancelled()),
                Some(current) if current.status.is_settled() => {
                    debug!("💸️ Invoice {} was settled elsewhere. Moving on", current.id);
                    continue;
                },
                Some(_) => {},
            }
            // Subscribe before paying so that a fast completion signal cannot be missed
            let mut settled_rx = self.inner.settled_tx.subscribe();
            let invoice = ledger.mark_processing(&queued.id).await?;
            debug!("💸️ Paying {invoice}");
            let outcome = tokio::select! {
                _ = token.cancelled() => return Err(cancelled()),
                r = rail.pay(&invoice) => r,
            };
            match outcome {
                Ok(PayOutcome::Settled(proof)) => {
                    self.on_completion_signal(&invoice.id, proof).await?;
                },
                Ok(PayOutcome::Submitted) => {
                    self.await_settlement(checkout_id, &invoice.id, &mut settled_rx, token).await?;
                },
                Err(error) => {
                    ledger.mark_failed(&invoice.id, error.to_string()).await?;
                    error!("💸️ Bulk payment halted at invoice {}. {error}", invoice.id);
                    return Err(ReconcileError::Halted { invoice_id: invoice.id, error });
                },
            }
            paid.push(invoice.id);
        }
        Ok(paid)
    }

    async fn await_settlement(
        &self,
        checkout_id: &CheckoutId,
        invoice_id: &InvoiceId,
        settled_rx: &mut broadcast::Receiver<InvoiceId>,
        token: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let deadline = tokio::time::sleep(self.inner.config.receipt_wait_timeout);
        tokio::pin!(deadline);
        loop {
            match self.inner.ledger.invoice(invoice_id).await {
                None => return Err(ReconcileError::Cancelled(checkout_id.clone())),
                Some(invoice) if invoice.status.is_settled() => return Ok(()),
                Some(_) => {},
            }
            tokio::select! {
                _ = token.cancelled() => return Err(ReconcileError::Cancelled(checkout_id.clone())),
                _ = &mut deadline => {
                    self.inner.ledger.mark_unconfirmed(invoice_id).await?;
                    return Err(ReconcileError::Unconfirmed(invoice_id.clone()));
                },
                r = settled_rx.recv() => match r {
                    Ok(id) if &id == invoice_id => return Ok(()),
                    Ok(_) | Err(RecvError::Lagged(_)) => {},
                    Err(RecvError::Closed) => return Err(ReconcileError::Cancelled(checkout_id.clone())),
                },
            }
        }
    }

    /// Resolves once every invoice of the checkout is settled.
    pub async fn wait_for_checkout(&self, checkout_id: &CheckoutId) -> Result<(), ReconcileError> {
        let token = self.checkout_token(checkout_id);
        let mut settled_rx = self.inner.settled_tx.subscribe();
        loop {
            if self.inner.ledger.is_checkout_settled(checkout_id).await? {
                self.release_watch(checkout_id);
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(ReconcileError::Cancelled(checkout_id.clone())),
                r = settled_rx.recv() => if let Err(RecvError::Closed) = r {
                    return Err(ReconcileError::Cancelled(checkout_id.clone()));
                },
            }
        }
    }

    /// Invoices of the checkout that were pushed to a wallet but never confirmed. They need manual verification.
    pub async fn unconfirmed_invoices(&self, checkout_id: &CheckoutId) -> Result<Vec<Invoice>, ReconcileError> {
        let snapshot = self.inner.ledger.snapshot(checkout_id).await?;
        Ok(snapshot.iter().flat_map(|s| s.invoices()).filter(|i| i.is_unconfirmed()).cloned().collect())
    }

    //--------------------------------------    Cancellation     ------------------------------------------------------
    fn lock_watches(&self) -> std::sync::MutexGuard<'_, HashMap<CheckoutId, CheckoutWatch>> {
        self.inner.watches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checkout_token(&self, checkout_id: &CheckoutId) -> CancellationToken {
        self.lock_watches().entry(checkout_id.clone()).or_default().token.clone()
    }

    // A settled checkout needs neither receipt subscriptions nor a cancellation token. A bulk run still holding the
    // token finishes on its own.
    fn release_watch(&self, checkout_id: &CheckoutId) {
        let Some(watch) = self.lock_watches().remove(checkout_id) else {
            return;
        };
        watch.subscriptions.iter().for_each(Subscription::unsubscribe);
        let released = watch.subscriptions.len();
        debug!("📬️ Checkout {checkout_id} is settled. Released {released} receipt subscriptions");
    }

    /// Releases every receipt subscription held for the checkout, without touching its invoices.
    pub fn stop_watching(&self, checkout_id: &CheckoutId) -> usize {
        let mut watches = self.lock_watches();
        let Some(watch) = watches.get_mut(checkout_id) else {
            return 0;
        };
        let released = watch.subscriptions.len();
        watch.subscriptions.drain(..).for_each(|s| s.unsubscribe());
        if released > 0 {
            debug!("📬️ Released {released} receipt subscriptions for checkout {checkout_id}");
        }
        released
    }

    /// Stops all work on a checkout and discards its invoice sets. Later completion signals for its invoices are
    /// rejected with [`ReconcileError::InvoiceNotFound`]. Repeated calls are no-ops.
    pub async fn cancel_checkout(&self, checkout_id: &CheckoutId) {
        let watch = self.lock_watches().remove(checkout_id);
        if let Some(watch) = watch {
            watch.token.cancel();
            watch.subscriptions.iter().for_each(Subscription::unsubscribe);
            info!("💸️ Checkout {checkout_id} cancelled. Released {} subscriptions", watch.subscriptions.len());
        }
        self.inner.ledger.discard_checkout(checkout_id).await;
    }

    /// Checkouts with a live watch entry. Settled and cancelled checkouts are dropped.
    pub fn watched_checkouts(&self) -> usize {
        self.lock_watches().len()
    }

    pub fn active_watches(&self) -> usize {
        self.lock_watches().values().map(|w| w.subscriptions.iter().filter(|s| s.is_active()).count()).sum()
    }
}

fn verify_proof(invoice: &Invoice, proof: &PaymentProof) -> Result<(), ReconcileError> {
    match (proof, &invoice.payment_hash) {
        (PaymentProof::Preimage(preimage), Some(hash)) if !verify_preimage(hash, preimage) => {
            Err(proof_rejected(&invoice.id, "The preimage does not match the invoice's payment hash"))
        },
        (PaymentProof::RailAck(ack), _) if ack.trim().is_empty() => {
            Err(proof_rejected(&invoice.id, "The acknowledgement is empty"))
        },
        _ => Ok(()),
    }
}

fn receipt_matches(receipt: &PaymentReceipt, invoice: &Invoice) -> bool {
    receipt.order_id == invoice.order_id && receipt.payee == invoice.recipient && receipt.amount == invoice.amount
}

fn proof_rejected(invoice_id: &InvoiceId, reason: &str) -> ReconcileError {
    ReconcileError::ProofRejected { invoice_id: invoice_id.clone(), reason: reason.to_string() }
}
