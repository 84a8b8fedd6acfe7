//! Builds the invoice sets of a checkout and requests a payable invoice for each draft.
//!
//! Invoice requests are single-flight per `(order, recipient)`: concurrent requests for the same draft share the
//! one call to the payment rail. An invoice that is still valid for its draft is reused; a stale one (the cart
//! changed, or the invoice failed or expired) is replaced, and the ledger discards the old one in the same step.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use futures_util::future::join_all;
use log::*;
use market_common::Sats;
use tokio::sync::OnceCell;

use super::{
    checkout_objects::{Cart, Invoice, InvoiceDraft, InvoiceSet, SellerCart},
    errors::OrchestratorError,
    ledger::InvoiceLedger,
};
use crate::{
    helpers::new_invoice_id,
    order_types::{CheckoutId, OrderId, PublicKey, RecipientKind},
    split::{compute_shares, Share},
    traits::PaymentRail,
};

type SlotKey = (OrderId, PublicKey);
type InFlight = Arc<OnceCell<Result<Invoice, OrchestratorError>>>;

// A request can race a cart edit. Give up rather than loop forever if the draft keeps changing under us.
const MAX_REQUEST_ATTEMPTS: usize = 3;

/// Builds one invoice set per seller in the cart.
///
/// The merchant draft carries the merchant's part of the product subtotal plus all of the shipping. Share recipients
/// get one draft each, in the order their shares are listed, unless their computed amount is zero. A share that
/// names the seller itself is folded into the merchant draft.
pub fn build_invoice_sets(
    cart: &Cart,
    splits_by_seller: &HashMap<PublicKey, Vec<Share>>,
) -> Result<Vec<InvoiceSet>, OrchestratorError> {
    if cart.sellers.is_empty() || !cart.total().is_positive() {
        return Err(OrchestratorError::EmptyCart);
    }
    let mut seen = HashSet::new();
    for seller_cart in &cart.sellers {
        if !seen.insert(&seller_cart.order_id) {
            return Err(OrchestratorError::DuplicateOrder(seller_cart.order_id.clone()));
        }
    }
    if let Some(unknown) = splits_by_seller.keys().find(|s| !cart.sellers.iter().any(|c| &c.seller == *s)) {
        return Err(OrchestratorError::SplitForUnknownSeller(unknown.clone()));
    }
    let sets = cart
        .sellers
        .iter()
        .map(|seller_cart| {
            let shares = splits_by_seller.get(&seller_cart.seller).map(Vec::as_slice).unwrap_or_default();
            build_invoice_set(&cart.checkout_id, seller_cart, shares)
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!(
        "🧾️ Checkout {} needs {} invoices across {} sellers",
        cart.checkout_id,
        sets.iter().map(InvoiceSet::len).sum::<usize>(),
        sets.len()
    );
    Ok(sets)
}

fn build_invoice_set(
    checkout_id: &CheckoutId,
    seller_cart: &SellerCart,
    shares: &[Share],
) -> Result<InvoiceSet, OrchestratorError> {
    let split = compute_shares(seller_cart.subtotal(), shares)?;
    let draft = |recipient: &PublicKey, kind, amount, description| InvoiceDraft {
        checkout_id: checkout_id.clone(),
        order_id: seller_cart.order_id.clone(),
        seller: seller_cart.seller.clone(),
        recipient: recipient.clone(),
        recipient_kind: kind,
        amount,
        description,
    };
    let mut merchant_amount = split.merchant_amount + seller_cart.shipping;
    let mut share_drafts = Vec::with_capacity(shares.len());
    for share in shares {
        let amount = split.amount_for(&share.recipient).unwrap_or_default();
        if !amount.is_positive() {
            continue;
        }
        if share.recipient == seller_cart.seller {
            merchant_amount += amount;
            continue;
        }
        let description = format!("Value-for-value share of order {}", seller_cart.order_id);
        share_drafts.push(draft(&share.recipient, RecipientKind::ShareRecipient, amount, description));
    }
    let merchant = merchant_amount.is_positive().then(|| {
        let description = format!("Payment for order {}", seller_cart.order_id);
        draft(&seller_cart.seller, RecipientKind::Merchant, merchant_amount, description)
    });
    Ok(InvoiceSet {
        checkout_id: checkout_id.clone(),
        order_id: seller_cart.order_id.clone(),
        seller: seller_cart.seller.clone(),
        merchant,
        shares: share_drafts,
    })
}

/// The result of requesting every invoice in one set. A failure for one recipient does not stop the others.
#[derive(Debug, Clone)]
pub struct InvoiceSetOutcome {
    pub order_id: OrderId,
    pub seller: PublicKey,
    pub invoices: Vec<Invoice>,
    pub failures: Vec<(PublicKey, OrchestratorError)>,
}

impl InvoiceSetOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> Sats {
        self.invoices.iter().map(|i| i.amount).sum()
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
    pub checkout_id: CheckoutId,
    pub sets: Vec<InvoiceSetOutcome>,
}

impl CheckoutOutcome {
    pub fn is_complete(&self) -> bool {
        self.sets.iter().all(InvoiceSetOutcome::is_complete)
    }

    pub fn invoices(&self) -> impl Iterator<Item = &Invoice> {
        self.sets.iter().flat_map(|s| s.invoices.iter())
    }

    pub fn failures(&self) -> impl Iterator<Item = &(PublicKey, OrchestratorError)> {
        self.sets.iter().flat_map(|s| s.failures.iter())
    }
}

//--------------------------------------  InvoiceOrchestrator ---------------------------------------------------------
#[derive(Clone)]
pub struct InvoiceOrchestrator {
    ledger: InvoiceLedger,
    default_rail: Arc<dyn PaymentRail>,
    rails: HashMap<PublicKey, Arc<dyn PaymentRail>>,
    request_timeout: Duration,
    in_flight: Arc<Mutex<HashMap<SlotKey, InFlight>>>,
}

impl InvoiceOrchestrator {
    pub fn new(ledger: InvoiceLedger, default_rail: Arc<dyn PaymentRail>, request_timeout: Duration) -> Self {
        let in_flight = Arc::new(Mutex::new(HashMap::new()));
        Self { ledger, default_rail, rails: HashMap::new(), request_timeout, in_flight }
    }

    /// Routes invoice requests for `recipient` to `rail` instead of the default rail.
    pub fn with_rail_for(mut self, recipient: PublicKey, rail: Arc<dyn PaymentRail>) -> Self {
        self.rails.insert(recipient, rail);
        self
    }

    pub fn ledger(&self) -> &InvoiceLedger {
        &self.ledger
    }

    pub fn rail_for(&self, recipient: &PublicKey) -> Arc<dyn PaymentRail> {
        self.rails.get(recipient).cloned().unwrap_or_else(|| Arc::clone(&self.default_rail))
    }

    /// Builds the invoice sets for `cart`, records them in the ledger and requests every invoice.
    ///
    /// Seller groups are requested concurrently; invoices within a group one after the other. Validation errors are
    /// returned before any rail is contacted. Rail errors are reported per recipient in the outcome.
    pub async fn checkout(
        &self,
        cart: &Cart,
        splits_by_seller: &HashMap<PublicKey, Vec<Share>>,
    ) -> Result<CheckoutOutcome, OrchestratorError> {
        let sets = build_invoice_sets(cart, splits_by_seller)?;
        self.ledger.register_checkout(&cart.checkout_id, sets.clone()).await;
        info!("🧾️ Requesting invoices for checkout {} ({} total)", cart.checkout_id, cart.total());
        let outcomes = join_all(sets.iter().map(|set| self.request_invoice_set(set))).await;
        Ok(CheckoutOutcome { checkout_id: cart.checkout_id.clone(), sets: outcomes })
    }

    /// Re-requests every draft of a checkout that has no usable invoice, e.g. after a rail error.
    pub async fn retry_outstanding(&self, checkout_id: &CheckoutId) -> Result<CheckoutOutcome, OrchestratorError> {
        let sets = self.ledger.checkout_sets(checkout_id).await?;
        let outcomes = join_all(sets.iter().map(|set| self.request_invoice_set(set))).await;
        Ok(CheckoutOutcome { checkout_id: checkout_id.clone(), sets: outcomes })
    }

    pub async fn request_invoice_set(&self, set: &InvoiceSet) -> InvoiceSetOutcome {
        let mut invoices = Vec::with_capacity(set.len());
        let mut failures = Vec::new();
        for draft in set.drafts() {
            match self.request_invoice(draft).await {
                Ok(invoice) => invoices.push(invoice),
                Err(e) => {
                    warn!("🧾️ Could not get an invoice for {} on order {}. {e}", draft.recipient, draft.order_id);
                    failures.push((draft.recipient.clone(), e));
                },
            }
        }
        InvoiceSetOutcome { order_id: set.order_id.clone(), seller: set.seller.clone(), invoices, failures }
    }

    /// Returns a payable invoice for `draft`, reusing the current one when it is still valid.
    pub async fn request_invoice(&self, draft: &InvoiceDraft) -> Result<Invoice, OrchestratorError> {
        let key = draft.key();
        for _ in 0..MAX_REQUEST_ATTEMPTS {
            if let Some(invoice) = self.ledger.current_invoice(&draft.order_id, &draft.recipient).await {
                if is_reusable(draft, &invoice) {
                    let (id, recipient, order_id) = (&invoice.id, &draft.recipient, &draft.order_id);
                    trace!("🧾️ Reusing invoice {id} for {recipient} on order {order_id}");
                    return Ok(invoice);
                }
            }
            let cell = self.in_flight_cell(&key);
            let result = cell.get_or_init(|| self.do_request(draft.clone())).await.clone();
            self.release_cell(&key, &cell);
            match result {
                Ok(invoice) if draft.matches(&invoice) => return Ok(invoice),
                Ok(invoice) => {
                    let id = &invoice.id;
                    debug!("🧾️ Invoice {id} was requested for an older version of the draft. Trying again");
                },
                Err(e) => return Err(e),
            }
        }
        Err(OrchestratorError::Superseded(draft.recipient.clone()))
    }

    fn in_flight_cell(&self, key: &SlotKey) -> InFlight {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.clone()).or_default().clone()
    }

    fn release_cell(&self, key: &SlotKey, cell: &InFlight) {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(key).is_some_and(|c| Arc::ptr_eq(c, cell)) {
            map.remove(key);
        }
    }

    async fn do_request(&self, draft: InvoiceDraft) -> Result<Invoice, OrchestratorError> {
        let id = new_invoice_id(&draft.order_id, &draft.recipient);
        let pending = Invoice::pending(id.clone(), &draft, Utc::now(), self.ledger.invoice_lifetime());
        self.ledger.insert_invoice(pending).await;
        let rail = self.rail_for(&draft.recipient);
        debug!("🧾️ Requesting invoice {id} for {} from {} via {}", draft.amount, draft.recipient, rail.name());
        match tokio::time::timeout(self.request_timeout, rail.request_invoice(draft.to_request(id.clone()))).await {
            Ok(Ok(rail_invoice)) => Ok(self.ledger.attach_instrument(&id, rail_invoice).await?),
            Ok(Err(error)) => {
                self.ledger.mark_failed(&id, error.to_string()).await?;
                Err(OrchestratorError::Rail { recipient: draft.recipient, error })
            },
            Err(_) => {
                let reason = format!("The invoice request timed out after {}s", self.request_timeout.as_secs());
                self.ledger.mark_expired(&id, reason).await?;
                Err(OrchestratorError::RequestTimedOut(draft.recipient))
            },
        }
    }
}

fn is_reusable(draft: &InvoiceDraft, invoice: &Invoice) -> bool {
    use crate::order_types::InvoiceStatus::*;
    draft.matches(invoice) &&
        match invoice.status {
            Pending => invoice.pay_instrument.is_some(),
            Processing | Paid | Skipped => true,
            Failed | Expired => false,
        }
}
