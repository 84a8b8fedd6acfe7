//! # External collaborators
//!
//! The engine never talks to a relay, a wallet or a lightning node directly. It consumes them through the two traits
//! defined here, so that a presentation layer can plug in whichever transport and payment rails it supports.
//!
//! * [`EventLog`] is the append-only, order-correlated message log. Delivery is at-least-once with no ordering
//!   guarantee. Pull-style [`EventLog::fetch_events`] is always available; push delivery goes through
//!   [`EventLog::subscribe`], which returns a [`Subscription`] handle that must be released when the consumer is
//!   torn down.
//! * [`PaymentRail`] turns an invoice request into a payable instrument and, for rails that can push payments (a
//!   connected wallet), pays an invoice on the user's behalf.
//!
//! Both traits are object safe and are held as `Arc<dyn ...>`, so that different rails can be used per checkout.
mod event_log;
mod payment_rail;

pub use event_log::{EventLog, EventLogError, Subscription};
pub use payment_rail::{CompletionSignal, InvoiceRequest, PayOutcome, PaymentProof, PaymentRail, RailError, RailInvoice};
