//! The invoice ledger holds every checkout's invoice sets and the current invoice for each `(order, recipient)` pair.
//!
//! It is explicit, injected state: the orchestrator, the reconciler and the expiry worker share one ledger by cloning
//! it. All status changes happen under a single lock, which is what makes `paid` a once-only transition and checkout
//! completion a once-only notification.
//!
//! Expiry is lazy. Every read first moves pending invoices that are past their `expires_at` to `expired`, so a stale
//! instrument is never handed out. [`InvoiceLedger::expire_stale`] does the same on demand for the monitoring loop.
use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use log::*;
use tokio::sync::Mutex;

use super::{
    checkout_objects::{Invoice, InvoiceDraft, InvoiceSet, InvoiceSetSnapshot},
    errors::LedgerError,
};
use crate::{
    events::CheckoutCompletedEvent,
    order_types::{CheckoutId, InvoiceId, InvoiceStatus, OrderId, PublicKey, RecipientKind},
    traits::{PaymentProof, RailInvoice},
};

type SlotKey = (OrderId, PublicKey);

/// The result of settling an invoice, either by payment or by deferral.
#[derive(Debug, Clone)]
pub struct SettleOutcome {
    pub invoice: Invoice,
    /// False if the invoice was already settled and nothing changed
    pub applied: bool,
    /// Set exactly once per checkout, by the settlement that completes it
    pub checkout_completed: Option<CheckoutCompletedEvent>,
}

struct CheckoutRecord {
    sets: Vec<InvoiceSet>,
    live_run: bool,
    completed: bool,
}

#[derive(Default)]
struct LedgerState {
    checkouts: HashMap<CheckoutId, CheckoutRecord>,
    invoices: HashMap<InvoiceId, Invoice>,
    current: HashMap<SlotKey, InvoiceId>,
}

impl LedgerState {
    fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<Invoice> {
        let mut expired = Vec::new();
        for invoice in self.invoices.values_mut().filter(|i| i.is_past_expiry(now)) {
            invoice.status = InvoiceStatus::Expired;
            invoice.last_error = Some("The invoice expired before it was paid".into());
            debug!("🧾️ Invoice {} has expired", invoice.id);
            expired.push(invoice.clone());
        }
        expired
    }

    fn invoice_mut(&mut self, id: &InvoiceId) -> Result<&mut Invoice, LedgerError> {
        self.invoices.get_mut(id).ok_or_else(|| LedgerError::InvoiceNotFound(id.clone()))
    }

    fn current_for(&self, key: &SlotKey) -> Option<&Invoice> {
        self.current.get(key).and_then(|id| self.invoices.get(id))
    }

    fn snapshot(&self, set: &InvoiceSet) -> InvoiceSetSnapshot {
        let mut outstanding = Vec::new();
        let mut current = |draft: &InvoiceDraft| match self.current_for(&draft.key()) {
            Some(inv) if matches!(inv.status, InvoiceStatus::Failed | InvoiceStatus::Expired) => {
                outstanding.push(draft.clone());
                Some(inv.clone())
            },
            Some(inv) => Some(inv.clone()),
            None => {
                outstanding.push(draft.clone());
                None
            },
        };
        let merchant_invoice = set.merchant.as_ref().and_then(&mut current);
        let share_invoices = set.shares.iter().filter_map(&mut current).collect();
        InvoiceSetSnapshot {
            order_id: set.order_id.clone(),
            seller: set.seller.clone(),
            merchant_invoice,
            share_invoices,
            outstanding,
        }
    }

    fn is_settled(&self, checkout_id: &CheckoutId) -> bool {
        self.checkouts.get(checkout_id).is_some_and(|record| {
            record.sets.iter().flat_map(InvoiceSet::drafts).all(|draft| {
                self.current_for(&draft.key()).is_some_and(|inv| inv.status.is_settled() && draft.matches(inv))
            })
        })
    }

    /// Marks the checkout complete if it has just become fully settled.
    fn try_complete(&mut self, checkout_id: &CheckoutId) -> Option<CheckoutCompletedEvent> {
        if !self.is_settled(checkout_id) {
            return None;
        }
        let record = self.checkouts.get_mut(checkout_id)?;
        if record.completed {
            return None;
        }
        record.completed = true;
        let order_ids = record.sets.iter().map(|s| s.order_id.clone()).collect();
        let keys = record.sets.iter().flat_map(InvoiceSet::drafts).map(|d| d.key()).collect::<Vec<_>>();
        let invoices = keys.iter().filter_map(|k| self.current.get(k).cloned()).collect();
        info!("🧾️ Checkout {checkout_id} is fully settled");
        Some(CheckoutCompletedEvent { checkout_id: checkout_id.clone(), order_ids, invoices })
    }

    fn settle(
        &mut self,
        id: &InvoiceId,
        status: InvoiceStatus,
        proof: Option<PaymentProof>,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, LedgerError> {
        let invoice = self.invoice_mut(id)?;
        if invoice.status.is_settled() {
            let invoice = invoice.clone();
            return Ok(SettleOutcome { invoice, applied: false, checkout_completed: None });
        }
        if matches!(invoice.status, InvoiceStatus::Failed | InvoiceStatus::Expired) && status == InvoiceStatus::Paid {
            warn!("🧾️ Invoice {id} was {} but a completion signal arrived. Accepting the payment", invoice.status);
        }
        invoice.status = status;
        invoice.unconfirmed_since = None;
        if status == InvoiceStatus::Paid {
            invoice.proof = proof;
            invoice.paid_at = Some(now);
            invoice.last_error = None;
        }
        let invoice = invoice.clone();
        let checkout_completed = self.try_complete(&invoice.checkout_id);
        Ok(SettleOutcome { invoice, applied: true, checkout_completed })
    }
}

//--------------------------------------    InvoiceLedger     ---------------------------------------------------------
#[derive(Clone)]
pub struct InvoiceLedger {
    state: Arc<Mutex<LedgerState>>,
    invoice_lifetime: Duration,
    allow_deferred_settlement: bool,
}

impl InvoiceLedger {
    /// `invoice_lifetime` applies when a rail does not say when its invoice expires.
    pub fn new(invoice_lifetime: Duration, allow_deferred_settlement: bool) -> Self {
        Self { state: Arc::new(Mutex::new(LedgerState::default())), invoice_lifetime, allow_deferred_settlement }
    }

    pub fn invoice_lifetime(&self) -> Duration {
        self.invoice_lifetime
    }

    pub fn allows_deferred_settlement(&self) -> bool {
        self.allow_deferred_settlement
    }

    /// Records the invoice sets of a checkout attempt, replacing any earlier attempt for the same checkout.
    ///
    /// Unpaid invoices from the earlier attempt that no longer correspond to a draft are discarded. Invoices that
    /// still match a draft are kept, so that they can be reused.
    pub async fn register_checkout(&self, checkout_id: &CheckoutId, sets: Vec<InvoiceSet>) {
        let mut state = self.state.lock().await;
        let keys = sets.iter().flat_map(InvoiceSet::drafts).map(|d| d.key()).collect::<Vec<_>>();
        let stale = state
            .current
            .iter()
            .filter(|(key, id)| {
                !keys.contains(*key) &&
                    state.invoices.get(*id).is_some_and(|i| &i.checkout_id == checkout_id && !i.status.is_settled())
            })
            .map(|(key, id)| (key.clone(), id.clone()))
            .collect::<Vec<_>>();
        for (key, id) in stale {
            state.current.remove(&key);
            state.invoices.remove(&id);
            debug!("🧾️ Discarded invoice {id}. It is no longer part of checkout {checkout_id}");
        }
        let n = sets.len();
        state.checkouts.insert(checkout_id.clone(), CheckoutRecord { sets, live_run: false, completed: false });
        debug!("🧾️ Registered {n} invoice sets for checkout {checkout_id}");
    }

    pub async fn checkout_sets(&self, checkout_id: &CheckoutId) -> Result<Vec<InvoiceSet>, LedgerError> {
        let state = self.state.lock().await;
        let record =
            state.checkouts.get(checkout_id).ok_or_else(|| LedgerError::CheckoutNotFound(checkout_id.clone()))?;
        Ok(record.sets.clone())
    }

    /// Makes `invoice` the current invoice for its recipient. A previous unpaid invoice for the same recipient is
    /// discarded and returned.
    pub async fn insert_invoice(&self, invoice: Invoice) -> Option<Invoice> {
        let mut state = self.state.lock().await;
        let key = (invoice.order_id.clone(), invoice.recipient.clone());
        let previous = state.current.insert(key, invoice.id.clone());
        trace!("🧾️ Invoice {} is now current for {} on order {}", invoice.id, invoice.recipient, invoice.order_id);
        state.invoices.insert(invoice.id.clone(), invoice);
        let previous = previous?;
        if state.invoices.get(&previous).is_some_and(|i| i.status == InvoiceStatus::Paid) {
            return None;
        }
        let discarded = state.invoices.remove(&previous);
        if let Some(old) = &discarded {
            info!("🧾️ Discarded invoice {} in favour of a fresh one", old.id);
        }
        discarded
    }

    /// Removes an invoice, if it is still current and unpaid.
    pub async fn discard_invoice(&self, id: &InvoiceId) -> Option<Invoice> {
        let mut state = self.state.lock().await;
        let invoice = state.invoices.get(id)?;
        if invoice.status == InvoiceStatus::Paid {
            return None;
        }
        let key = (invoice.order_id.clone(), invoice.recipient.clone());
        if state.current.get(&key) == Some(id) {
            state.current.remove(&key);
        }
        state.invoices.remove(id)
    }

    pub async fn invoice(&self, id: &InvoiceId) -> Option<Invoice> {
        let mut state = self.state.lock().await;
        state.expire_due(Utc::now());
        state.invoices.get(id).cloned()
    }

    pub async fn current_invoice(&self, order_id: &OrderId, recipient: &PublicKey) -> Option<Invoice> {
        let mut state = self.state.lock().await;
        state.expire_due(Utc::now());
        state.current_for(&(order_id.clone(), recipient.clone())).cloned()
    }

    /// The current invoices for an order, merchant first.
    pub async fn invoices_for_order(&self, order_id: &OrderId) -> Vec<Invoice> {
        let mut state = self.state.lock().await;
        state.expire_due(Utc::now());
        let mut invoices = state
            .current
            .iter()
            .filter(|((o, _), _)| o == order_id)
            .filter_map(|(_, id)| state.invoices.get(id))
            .cloned()
            .collect::<Vec<_>>();
        invoices.sort_by_key(|i| (i.recipient_kind != RecipientKind::Merchant, i.created_at));
        invoices
    }

    pub async fn attach_instrument(&self, id: &InvoiceId, rail_invoice: RailInvoice) -> Result<Invoice, LedgerError> {
        let mut state = self.state.lock().await;
        let invoice = state.invoice_mut(id)?;
        if invoice.status != InvoiceStatus::Pending {
            let action = "attach an instrument to";
            return Err(LedgerError::InvalidStatus { id: id.clone(), status: invoice.status, action });
        }
        invoice.attach(rail_invoice);
        debug!("🧾️ Invoice {id} is payable until {}", invoice.expires_at);
        Ok(invoice.clone())
    }

    pub async fn mark_processing(&self, id: &InvoiceId) -> Result<Invoice, LedgerError> {
        let mut state = self.state.lock().await;
        state.expire_due(Utc::now());
        let invoice = state.invoice_mut(id)?;
        if !invoice.status.is_payable() {
            return Err(LedgerError::InvalidStatus { id: id.clone(), status: invoice.status, action: "start paying" });
        }
        invoice.status = InvoiceStatus::Processing;
        invoice.last_error = None;
        trace!("🧾️ Invoice {id} is being paid");
        Ok(invoice.clone())
    }

    /// Marks the invoice as paid. Only the first call for an invoice has any effect.
    pub async fn mark_paid(&self, id: &InvoiceId, proof: PaymentProof) -> Result<SettleOutcome, LedgerError> {
        let mut state = self.state.lock().await;
        let outcome = state.settle(id, InvoiceStatus::Paid, Some(proof), Utc::now())?;
        if outcome.applied {
            info!("🧾️ Invoice {id} is paid");
        }
        Ok(outcome)
    }

    pub async fn mark_failed(&self, id: &InvoiceId, reason: String) -> Result<Invoice, LedgerError> {
        self.mark_unpaid(id, InvoiceStatus::Failed, reason).await
    }

    pub async fn mark_expired(&self, id: &InvoiceId, reason: String) -> Result<Invoice, LedgerError> {
        self.mark_unpaid(id, InvoiceStatus::Expired, reason).await
    }

    async fn mark_unpaid(&self, id: &InvoiceId, status: InvoiceStatus, reason: String) -> Result<Invoice, LedgerError> {
        let mut state = self.state.lock().await;
        let invoice = state.invoice_mut(id)?;
        if invoice.status.is_settled() {
            let action = if status == InvoiceStatus::Failed { "fail" } else { "expire" };
            return Err(LedgerError::InvalidStatus { id: id.clone(), status: invoice.status, action });
        }
        warn!("🧾️ Invoice {id} is {status}. {reason}");
        invoice.status = status;
        invoice.last_error = Some(reason);
        Ok(invoice.clone())
    }

    /// Flags a payment in flight as "likely succeeded, verify manually". The status stays `processing`.
    pub async fn mark_unconfirmed(&self, id: &InvoiceId) -> Result<Invoice, LedgerError> {
        let mut state = self.state.lock().await;
        let invoice = state.invoice_mut(id)?;
        if invoice.status != InvoiceStatus::Processing {
            let action = "flag as unconfirmed";
            return Err(LedgerError::InvalidStatus { id: id.clone(), status: invoice.status, action });
        }
        invoice.unconfirmed_since = Some(Utc::now());
        warn!("🧾️ Invoice {id} has no completion signal. It needs manual verification");
        Ok(invoice.clone())
    }

    /// Defers settlement of an invoice. Only allowed when the ledger permits deferral and no bulk payment is running
    /// for the invoice's checkout.
    pub async fn skip(&self, id: &InvoiceId) -> Result<SettleOutcome, LedgerError> {
        if !self.allow_deferred_settlement {
            return Err(LedgerError::DeferralNotAllowed(id.clone()));
        }
        let mut state = self.state.lock().await;
        let checkout_id = state.invoice_mut(id)?.checkout_id.clone();
        if state.checkouts.get(&checkout_id).is_some_and(|r| r.live_run) {
            return Err(LedgerError::DeferralNotAllowed(id.clone()));
        }
        let outcome = state.settle(id, InvoiceStatus::Skipped, None, Utc::now())?;
        if outcome.applied {
            info!("🧾️ Settlement of invoice {id} was deferred");
        }
        Ok(outcome)
    }

    pub async fn set_live_run(&self, checkout_id: &CheckoutId, live: bool) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let record =
            state.checkouts.get_mut(checkout_id).ok_or_else(|| LedgerError::CheckoutNotFound(checkout_id.clone()))?;
        record.live_run = live;
        Ok(())
    }

    /// Current invoices in the checkout that are waiting for a payment attempt, in invoice set order.
    pub async fn payable_invoices(&self, checkout_id: &CheckoutId) -> Result<Vec<Invoice>, LedgerError> {
        let mut state = self.state.lock().await;
        state.expire_due(Utc::now());
        let record =
            state.checkouts.get(checkout_id).ok_or_else(|| LedgerError::CheckoutNotFound(checkout_id.clone()))?;
        let invoices = record
            .sets
            .iter()
            .flat_map(InvoiceSet::drafts)
            .filter_map(|d| state.current_for(&d.key()))
            .filter(|i| i.status == InvoiceStatus::Pending)
            .cloned()
            .collect();
        Ok(invoices)
    }

    pub async fn snapshot(&self, checkout_id: &CheckoutId) -> Result<Vec<InvoiceSetSnapshot>, LedgerError> {
        let mut state = self.state.lock().await;
        state.expire_due(Utc::now());
        let record =
            state.checkouts.get(checkout_id).ok_or_else(|| LedgerError::CheckoutNotFound(checkout_id.clone()))?;
        Ok(record.sets.iter().map(|s| state.snapshot(s)).collect())
    }

    pub async fn is_checkout_settled(&self, checkout_id: &CheckoutId) -> Result<bool, LedgerError> {
        let state = self.state.lock().await;
        if !state.checkouts.contains_key(checkout_id) {
            return Err(LedgerError::CheckoutNotFound(checkout_id.clone()));
        }
        Ok(state.is_settled(checkout_id))
    }

    /// Expires every pending invoice that is past its expiry time, returning the ones that changed.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Vec<Invoice> {
        let mut state = self.state.lock().await;
        state.expire_due(now)
    }

    /// Forgets a checkout and all of its invoices. Repeated calls are no-ops.
    pub async fn discard_checkout(&self, checkout_id: &CheckoutId) -> Vec<InvoiceId> {
        let mut state = self.state.lock().await;
        if state.checkouts.remove(checkout_id).is_none() {
            return Vec::new();
        }
        let ids =
            state.invoices.values().filter(|i| &i.checkout_id == checkout_id).map(|i| i.id.clone()).collect::<Vec<_>>();
        for id in &ids {
            state.invoices.remove(id);
        }
        state.current.retain(|_, id| !ids.contains(id));
        info!("🧾️ Discarded checkout {checkout_id} and its {} invoices", ids.len());
        ids
    }
}
