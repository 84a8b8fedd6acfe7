//! # Marketplace payment engine public API
//!
//! The `mpe_api` module exposes the programmatic API of the engine. Each part works against injected state and
//! injected collaborators, so that a presentation layer can wire up as much or as little of it as it needs.
//!
//! * [`orchestrator`] turns a cart into one invoice set per seller and requests a payable invoice for every draft.
//! * [`ledger`] holds the invoice sets and invoices of every checkout, shared by everything that changes them.
//! * [`reconciler`] settles invoices from completion signals, drives bulk payment through a connected wallet, and
//!   releases everything held for a checkout when it is cancelled.
//! * [`order_flow_api`] emits order messages on behalf of a buyer or seller, gated by the order state machine.
//!
//! # API usage
//!
//! ```rust,ignore
//! use market_payment_engine::{InvoiceLedger, InvoiceOrchestrator, PaymentReconciler};
//! let ledger = InvoiceLedger::new(config.invoice_lifetime(), config.allow_deferred_settlement);
//! let orchestrator = InvoiceOrchestrator::new(ledger.clone(), rail.clone(), config.invoice_request_timeout);
//! let outcome = orchestrator.checkout(&cart, &splits).await?;
//! let reconciler = PaymentReconciler::new(ledger, log, buyer, producers, config.reconciler_config());
//! reconciler.watch_checkout(&outcome.checkout_id).await?;
//! let report = reconciler.bulk_pay(&outcome.checkout_id, wallet).await?;
//! ```
pub mod checkout_objects;
pub mod errors;
pub mod ledger;
pub mod order_flow_api;
pub mod orchestrator;
pub mod reconciler;

pub use ledger::{InvoiceLedger, SettleOutcome};
pub use orchestrator::{build_invoice_sets, CheckoutOutcome, InvoiceOrchestrator, InvoiceSetOutcome};
pub use reconciler::{BulkPayReport, PaymentReconciler, ReconcilerConfig};
