use thiserror::Error;

use crate::{
    order_events::TransitionError,
    order_types::{CheckoutId, InvoiceId, InvoiceStatus, OrderId, PublicKey},
    split::SplitError,
    traits::{EventLogError, RailError},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Invoice {0} does not exist, or has been discarded")]
    InvoiceNotFound(InvoiceId),
    #[error("Checkout {0} does not exist, or has been discarded")]
    CheckoutNotFound(CheckoutId),
    #[error("Cannot {action} invoice {id} because it is {status}")]
    InvalidStatus { id: InvoiceId, status: InvoiceStatus, action: &'static str },
    #[error("Invoice {0} cannot be skipped. Deferred settlement is not allowed here")]
    DeferralNotAllowed(InvoiceId),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("Invalid value-for-value split. {0}")]
    Validation(#[from] SplitError),
    #[error("The cart has nothing to check out")]
    EmptyCart,
    #[error("A split was given for seller {0}, who has nothing in the cart")]
    SplitForUnknownSeller(PublicKey),
    #[error("Order {0} appears more than once in the cart")]
    DuplicateOrder(OrderId),
    #[error("Invoice request for {recipient} failed. {error}")]
    Rail { recipient: PublicKey, error: RailError },
    #[error("Invoice request for {0} timed out")]
    RequestTimedOut(PublicKey),
    #[error("The invoice for {0} kept changing while it was being requested")]
    Superseded(PublicKey),
    #[error("{0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("Invoice {0} does not exist, or has been discarded")]
    InvoiceNotFound(InvoiceId),
    #[error("The proof for invoice {invoice_id} was rejected. {reason}")]
    ProofRejected { invoice_id: InvoiceId, reason: String },
    #[error("The wallet did not become ready in time")]
    WalletNotReady,
    #[error(
        "No completion signal arrived for invoice {0}. The payment likely succeeded; verify it manually before \
         paying again"
    )]
    Unconfirmed(InvoiceId),
    #[error("Bulk payment stopped at invoice {invoice_id}. {error}")]
    Halted { invoice_id: InvoiceId, error: RailError },
    #[error("Checkout {0} was cancelled")]
    Cancelled(CheckoutId),
    #[error("Payment rail error. {0}")]
    Rail(#[from] RailError),
    #[error("{0}")]
    Ledger(LedgerError),
    #[error("Event log error. {0}")]
    EventLog(#[from] EventLogError),
}

impl From<LedgerError> for ReconcileError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InvoiceNotFound(id) => ReconcileError::InvoiceNotFound(id),
            e => ReconcileError::Ledger(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderFlowError {
    #[error("Order {0} does not exist")]
    OrderNotFound(OrderId),
    #[error("Order {0} already exists")]
    OrderAlreadyExists(OrderId),
    #[error("{0}")]
    Transition(#[from] TransitionError),
    #[error("Only the seller can {1}. {0} is not the seller")]
    NotSeller(PublicKey, &'static str),
    #[error("Amounts must be positive")]
    InvalidAmount,
    #[error("Event log error. {0}")]
    EventLog(#[from] EventLogError),
}
