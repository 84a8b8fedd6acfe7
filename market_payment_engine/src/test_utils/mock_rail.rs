//! A scriptable [`PaymentRail`] for tests.
//!
//! Every invoice it issues comes with a random preimage and the matching payment hash, so tests can settle invoices
//! with a verifiable proof, exactly as a real lightning rail would.
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::*;
use sha2::{Digest, Sha256};

use crate::{
    mpe_api::checkout_objects::Invoice,
    order_types::{InvoiceId, PublicKey},
    traits::{InvoiceRequest, PayOutcome, PaymentProof, PaymentRail, RailError, RailInvoice},
};

/// What [`MockRail::pay`] does with a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayBehaviour {
    /// Return the invoice's preimage straight away
    SettleWithPreimage,
    /// Accept the payment without a proof
    Submit,
    /// Fail every payment with this message
    Fail(String),
}

struct MockRailState {
    rejected_recipients: HashSet<PublicKey>,
    failing_invoices: HashSet<InvoiceId>,
    preimages: HashMap<InvoiceId, String>,
    paid: Vec<InvoiceId>,
    pay_behaviour: PayBehaviour,
    ready: bool,
}

pub struct MockRail {
    name: String,
    latency: Duration,
    pub invoice_requests: AtomicUsize,
    pub payments: AtomicUsize,
    state: Mutex<MockRailState>,
}

impl MockRail {
    pub fn new(name: &str) -> Self {
        let state = MockRailState {
            rejected_recipients: HashSet::new(),
            failing_invoices: HashSet::new(),
            preimages: HashMap::new(),
            paid: Vec::new(),
            pay_behaviour: PayBehaviour::SettleWithPreimage,
            ready: true,
        };
        Self {
            name: name.to_string(),
            latency: Duration::ZERO,
            invoice_requests: AtomicUsize::new(0),
            payments: AtomicUsize::new(0),
            state: Mutex::new(state),
        }
    }

    /// Every invoice request takes at least this long.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_pay_behaviour(self, behaviour: PayBehaviour) -> Self {
        self.set_pay_behaviour(behaviour);
        self
    }

    /// A rail that never becomes ready to push payments.
    pub fn never_ready(self) -> Self {
        self.lock().ready = false;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockRailState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_pay_behaviour(&self, behaviour: PayBehaviour) {
        self.lock().pay_behaviour = behaviour;
    }

    pub fn reject_requests_for(&self, recipient: PublicKey) {
        self.lock().rejected_recipients.insert(recipient);
    }

    pub fn accept_all_requests(&self) {
        self.lock().rejected_recipients.clear();
    }

    pub fn fail_payment_of(&self, invoice_id: InvoiceId) {
        self.lock().failing_invoices.insert(invoice_id);
    }

    /// The preimage a payer would learn by paying the invoice.
    pub fn preimage_for(&self, invoice_id: &InvoiceId) -> Option<String> {
        self.lock().preimages.get(invoice_id).cloned()
    }

    /// Invoices paid through this rail, in payment order.
    pub fn paid_invoices(&self) -> Vec<InvoiceId> {
        self.lock().paid.clone()
    }
}

#[async_trait]
impl PaymentRail for MockRail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request_invoice(&self, request: InvoiceRequest) -> Result<RailInvoice, RailError> {
        self.invoice_requests.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.lock();
        if state.rejected_recipients.contains(&request.recipient) {
            return Err(RailError::RequestRejected(format!("{} has no payment address", request.recipient)));
        }
        let preimage = hex::encode(rand::random::<[u8; 32]>());
        let payment_hash = hex::encode(Sha256::digest(hex::decode(&preimage).unwrap_or_default()));
        state.preimages.insert(request.invoice_id.clone(), preimage);
        trace!("🧪️ {} issued an invoice for {} to {}", self.name, request.amount, request.recipient);
        Ok(RailInvoice {
            pay_instrument: format!("mock:{}:{}", request.invoice_id, request.amount.value()),
            payment_hash: Some(payment_hash),
            expires_at: None,
        })
    }

    async fn wait_until_ready(&self) -> Result<(), RailError> {
        if self.lock().ready {
            return Ok(());
        }
        std::future::pending().await
    }

    async fn pay(&self, invoice: &Invoice) -> Result<PayOutcome, RailError> {
        self.payments.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.failing_invoices.contains(&invoice.id) {
            return Err(RailError::PaymentFailed(format!("route not found for {}", invoice.id)));
        }
        match state.pay_behaviour.clone() {
            PayBehaviour::Fail(reason) => Err(RailError::PaymentFailed(reason)),
            PayBehaviour::Submit => {
                state.paid.push(invoice.id.clone());
                Ok(PayOutcome::Submitted)
            },
            PayBehaviour::SettleWithPreimage => {
                state.paid.push(invoice.id.clone());
                let proof = match state.preimages.get(&invoice.id) {
                    Some(preimage) => PaymentProof::Preimage(preimage.clone()),
                    None => PaymentProof::RailAck(format!("paid {}", invoice.id)),
                };
                Ok(PayOutcome::Settled(proof))
            },
        }
    }
}
