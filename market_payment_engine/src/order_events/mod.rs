//! # Order events
//!
//! Orders are never stored as records. Every fact about an order is an [`OrderEvent`] on the append-only log,
//! correlated by its `order` tag, and the current state of an order is derived from whatever set of those events is
//! visible at the time.
//!
//! * [`event`] defines the wire shape of an event and how its id is computed.
//! * [`messages`] is the typed view of the six order message types, with conversion to and from the wire shape.
//! * [`filter`] selects events when querying or subscribing to a log.
//! * [`state_machine`] derives an order's status from an unordered event set and gates which role may request
//!   which status change.
pub mod event;
pub mod filter;
pub mod messages;
pub mod state_machine;

pub use event::{EventParseError, OrderEvent, OrderEventType, MESSAGE_KIND, ORDER_PROCESSING_KIND, PAYMENT_RECEIPT_KIND};
pub use filter::EventFilter;
pub use messages::{
    ChatMessage,
    OrderCreation,
    OrderMessage,
    PaymentReceipt,
    PaymentRequest,
    PaymentTag,
    ShippingUpdate,
    StatusUpdate,
};
pub use state_machine::{allowed_transitions, check_transition, derive_order, DerivedOrderState, Order, TransitionError};
