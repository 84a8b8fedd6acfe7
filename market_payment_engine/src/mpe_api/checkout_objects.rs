use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use market_common::Sats;
use serde::{Deserialize, Serialize};

use crate::{
    order_types::{CheckoutId, InvoiceId, InvoiceStatus, OrderId, PublicKey, RecipientKind},
    traits::{InvoiceRequest, PaymentProof, RailInvoice},
};

//--------------------------------------         Cart         ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_ref: String,
    pub quantity: u32,
    pub unit_price: Sats,
}

impl CartLine {
    pub fn new<S: Into<String>>(product_ref: S, quantity: u32, unit_price: Sats) -> Self {
        Self { product_ref: product_ref.into(), quantity, unit_price }
    }

    pub fn line_total(&self) -> Sats {
        self.unit_price * i64::from(self.quantity)
    }
}

/// The part of a cart that one seller fulfils. Becomes exactly one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerCart {
    pub order_id: OrderId,
    pub seller: PublicKey,
    pub lines: Vec<CartLine>,
    /// Shipping is paid to the merchant in full. Share recipients never get a cut of it.
    pub shipping: Sats,
}

impl SellerCart {
    pub fn new(order_id: OrderId, seller: PublicKey) -> Self {
        Self { order_id, seller, lines: Vec::new(), shipping: Sats::default() }
    }

    pub fn with_line(mut self, line: CartLine) -> Self {
        self.lines.push(line);
        self
    }

    pub fn with_shipping(mut self, shipping: Sats) -> Self {
        self.shipping = shipping;
        self
    }

    /// The product subtotal, shipping excluded.
    pub fn subtotal(&self) -> Sats {
        self.lines.iter().map(CartLine::line_total).sum()
    }

    pub fn total(&self) -> Sats {
        self.subtotal() + self.shipping
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub checkout_id: CheckoutId,
    pub buyer: PublicKey,
    pub sellers: Vec<SellerCart>,
}

impl Cart {
    pub fn new(checkout_id: CheckoutId, buyer: PublicKey) -> Self {
        Self { checkout_id, buyer, sellers: Vec::new() }
    }

    pub fn with_seller(mut self, seller_cart: SellerCart) -> Self {
        self.sellers.push(seller_cart);
        self
    }

    pub fn total(&self) -> Sats {
        self.sellers.iter().map(SellerCart::total).sum()
    }
}

//--------------------------------------     InvoiceDraft     ---------------------------------------------------------
/// What will be requested from a recipient's payment rail. Never has a zero amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub checkout_id: CheckoutId,
    pub order_id: OrderId,
    pub seller: PublicKey,
    pub recipient: PublicKey,
    pub recipient_kind: RecipientKind,
    pub amount: Sats,
    pub description: String,
}

impl InvoiceDraft {
    pub fn key(&self) -> (OrderId, PublicKey) {
        (self.order_id.clone(), self.recipient.clone())
    }

    /// Whether `invoice` was requested for exactly this draft.
    pub fn matches(&self, invoice: &Invoice) -> bool {
        invoice.order_id == self.order_id &&
            invoice.recipient == self.recipient &&
            invoice.amount == self.amount &&
            invoice.description == self.description
    }

    pub fn to_request(&self, invoice_id: InvoiceId) -> InvoiceRequest {
        InvoiceRequest {
            invoice_id,
            order_id: self.order_id.clone(),
            recipient: self.recipient.clone(),
            amount: self.amount,
            description: self.description.clone(),
        }
    }
}

/// One seller's invoices for one checkout attempt: the merchant invoice plus one per share recipient with a non-zero
/// amount. Membership is fixed once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSet {
    pub checkout_id: CheckoutId,
    pub order_id: OrderId,
    pub seller: PublicKey,
    /// `None` only when the merchant's portion is zero
    pub merchant: Option<InvoiceDraft>,
    pub shares: Vec<InvoiceDraft>,
}

impl InvoiceSet {
    /// The merchant draft first, then share recipients in split order.
    pub fn drafts(&self) -> impl Iterator<Item = &InvoiceDraft> {
        self.merchant.iter().chain(self.shares.iter())
    }

    pub fn total(&self) -> Sats {
        self.drafts().map(|d| d.amount).sum()
    }

    pub fn len(&self) -> usize {
        self.drafts().count()
    }

    pub fn is_empty(&self) -> bool {
        self.merchant.is_none() && self.shares.is_empty()
    }
}

//--------------------------------------       Invoice        ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub checkout_id: CheckoutId,
    pub order_id: OrderId,
    pub seller: PublicKey,
    pub recipient: PublicKey,
    pub recipient_kind: RecipientKind,
    pub amount: Sats,
    pub description: String,
    /// Opaque and rail-specific. `None` until the rail has answered.
    pub pay_instrument: Option<String>,
    pub payment_hash: Option<String>,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Set when a push payment claimed success but no completion signal followed. Payment likely succeeded and
    /// should be verified manually.
    pub unconfirmed_since: Option<DateTime<Utc>>,
    pub proof: Option<PaymentProof>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// A pending invoice for `draft`, before the rail has been asked for an instrument.
    pub fn pending(id: InvoiceId, draft: &InvoiceDraft, now: DateTime<Utc>, lifetime: Duration) -> Self {
        Self {
            id,
            checkout_id: draft.checkout_id.clone(),
            order_id: draft.order_id.clone(),
            seller: draft.seller.clone(),
            recipient: draft.recipient.clone(),
            recipient_kind: draft.recipient_kind,
            amount: draft.amount,
            description: draft.description.clone(),
            pay_instrument: None,
            payment_hash: None,
            status: InvoiceStatus::Pending,
            created_at: now,
            expires_at: now + lifetime,
            last_error: None,
            unconfirmed_since: None,
            proof: None,
            paid_at: None,
        }
    }

    pub fn attach(&mut self, rail_invoice: RailInvoice) {
        self.pay_instrument = Some(rail_invoice.pay_instrument);
        self.payment_hash = rail_invoice.payment_hash;
        if let Some(expires_at) = rail_invoice.expires_at {
            self.expires_at = expires_at;
        }
    }

    /// Only invoices still waiting for a payment attempt lapse. A payment in flight is resolved by its own timeout.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.status == InvoiceStatus::Pending && now >= self.expires_at
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.unconfirmed_since.is_some() && self.status == InvoiceStatus::Processing
    }
}

impl Display for Invoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} to {} {} for order {} ({})",
            self.id, self.amount, self.recipient_kind, self.recipient, self.order_id, self.status
        )
    }
}

/// A point-in-time view of one invoice set, with the current invoice for each recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSetSnapshot {
    pub order_id: OrderId,
    pub seller: PublicKey,
    pub merchant_invoice: Option<Invoice>,
    pub share_invoices: Vec<Invoice>,
    /// Drafts with no invoice yet, or whose last request failed or expired
    pub outstanding: Vec<InvoiceDraft>,
}

impl InvoiceSetSnapshot {
    pub fn invoices(&self) -> impl Iterator<Item = &Invoice> {
        self.merchant_invoice.iter().chain(self.share_invoices.iter())
    }

    pub fn is_settled(&self) -> bool {
        self.outstanding.is_empty() && self.invoices().all(|i| i.status.is_settled())
    }
}
