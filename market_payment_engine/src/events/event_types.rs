use serde::{Deserialize, Serialize};

use crate::{
    mpe_api::checkout_objects::Invoice,
    order_types::{CheckoutId, EventId, InvoiceId, OrderId, OrderStatusType, PublicKey},
    traits::PaymentProof,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePaidEvent {
    pub invoice: Invoice,
    pub proof: PaymentProof,
}

impl InvoicePaidEvent {
    pub fn new(invoice: Invoice, proof: PaymentProof) -> Self {
        Self { invoice, proof }
    }
}

/// Every invoice in every invoice set of a checkout has been settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutCompletedEvent {
    pub checkout_id: CheckoutId,
    pub order_ids: Vec<OrderId>,
    pub invoices: Vec<InvoiceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceExpiredEvent {
    pub invoice: Invoice,
}

impl InvoiceExpiredEvent {
    pub fn new(invoice: Invoice) -> Self {
        Self { invoice }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChangedEvent {
    pub order_id: OrderId,
    pub old_status: OrderStatusType,
    pub new_status: OrderStatusType,
    pub author: PublicKey,
    pub event_id: EventId,
}
