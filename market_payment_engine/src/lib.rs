//! Marketplace Payment Engine
//!
//! The order and payment orchestration core of a marketplace whose only shared state is an append-only public event
//! log. It splits each sale between a merchant and its value-for-value share recipients, requests one invoice per
//! recipient across every seller in a cart, reconciles payment completion from whichever payment rail reports it, and
//! derives each order's status from an unordered stream of messages.
//!
//! The library is divided into these sections:
//! 1. Value types and the order message codec ([`order_types`], [`mod@order_events`]). The order state machine lives
//!    in [`order_events::state_machine`]; it is the system of record for order status.
//! 2. The value-for-value split calculator ([`split`]).
//! 3. The public API ([`mod@mpe_api`]): the invoice orchestrator, the invoice ledger, the payment reconciler and the
//!    order flow API.
//! 4. The external collaborators ([`traits`]): the event log and the payment rails. An in-memory log
//!    ([`MemoryEventLog`]) and a durable sqlite cache ([`SqliteEventStore`]) are provided.
//!
//! The engine also emits hook events ([`mod@events`]) when invoices are paid or expire, when a checkout completes and
//! when an order changes status. A simple actor-style handler runs your hooks so that you can react to them without
//! touching engine state.
pub mod config;
pub mod event_log;
pub mod events;
pub mod expiry_worker;
pub mod helpers;
pub mod mpe_api;
pub mod order_events;
pub mod order_types;
pub mod split;
pub mod traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use config::EngineConfig;
pub use event_log::MemoryEventLog;
pub use expiry_worker::start_invoice_expiry_worker;
pub use mpe_api::{
    errors::{LedgerError, OrchestratorError, OrderFlowError, ReconcileError},
    order_flow_api::{OrderFlowApi, ShippingDetails},
    BulkPayReport,
    InvoiceLedger,
    InvoiceOrchestrator,
    PaymentReconciler,
    ReconcilerConfig,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventStore;
