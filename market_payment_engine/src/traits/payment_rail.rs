use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_common::Sats;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    mpe_api::checkout_objects::Invoice,
    order_types::{EventId, InvoiceId, OrderId, PublicKey},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RailError {
    #[error("The payment rail rejected the invoice request: {0}")]
    RequestRejected(String),
    #[error("The payment could not be made: {0}")]
    PaymentFailed(String),
    #[error("No wallet is connected")]
    NotConnected,
    #[error("This payment rail cannot push payments")]
    PushNotSupported,
    #[error("The payment rail did not respond: {0}")]
    Unreachable(String),
}

//--------------------------------------    InvoiceRequest    ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub invoice_id: InvoiceId,
    pub order_id: OrderId,
    pub recipient: PublicKey,
    pub amount: Sats,
    pub description: String,
}

/// A rail's answer to an [`InvoiceRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RailInvoice {
    /// The opaque, rail-specific thing the payer needs, e.g. a bolt11 string
    pub pay_instrument: String,
    /// Hex-encoded SHA-256 hash that a valid preimage must hash to, when the rail exposes one
    pub payment_hash: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

//--------------------------------------     PaymentProof     ---------------------------------------------------------
/// Evidence that an invoice has been paid. Exactly one rail supplies it for any given invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum PaymentProof {
    /// A payment preimage. Verifiable against the invoice's payment hash.
    Preimage(String),
    /// A rail-specific success acknowledgement, e.g. a connected wallet's payment response
    RailAck(String),
    /// A receipt for the invoice observed on the event log
    Receipt { event_id: EventId, proof: String },
}

impl PaymentProof {
    /// The value of the `payment` tag method when this proof is published in a receipt.
    pub fn method(&self) -> &'static str {
        match self {
            PaymentProof::Preimage(_) => "preimage",
            PaymentProof::RailAck(_) => "ack",
            PaymentProof::Receipt { .. } => "receipt",
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            PaymentProof::Preimage(p) => p,
            PaymentProof::RailAck(a) => a,
            PaymentProof::Receipt { proof, .. } => proof,
        }
    }
}

impl Display for PaymentProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentProof::Receipt { event_id, .. } => write!(f, "receipt {event_id}"),
            p => write!(f, "{}:{}", p.method(), p.reference()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub invoice_id: InvoiceId,
    pub proof: PaymentProof,
}

impl CompletionSignal {
    pub fn new(invoice_id: InvoiceId, proof: PaymentProof) -> Self {
        Self { invoice_id, proof }
    }
}

/// The result of asking a connected wallet to pay an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayOutcome {
    /// The wallet returned a proof of payment synchronously.
    Settled(PaymentProof),
    /// The wallet accepted the payment but gave no proof. Completion must be observed from another source.
    Submitted,
}

//--------------------------------------      PaymentRail     ---------------------------------------------------------
#[async_trait]
pub trait PaymentRail: Send + Sync {
    fn name(&self) -> &str;

    async fn request_invoice(&self, request: InvoiceRequest) -> Result<RailInvoice, RailError>;

    /// Resolves once the rail is able to push payments. Rails that never need a connection are always ready.
    async fn wait_until_ready(&self) -> Result<(), RailError> {
        Ok(())
    }

    /// Pays `invoice` from the connected wallet.
    async fn pay(&self, _invoice: &Invoice) -> Result<PayOutcome, RailError> {
        Err(RailError::PushNotSupported)
    }
}
