//! Event log adapters.
//!
//! [`MemoryEventLog`] keeps everything in process. The durable local store lives in [`crate::sqlite`] behind the
//! `sqlite` feature. Both use [`SubscriberRegistry`] for push delivery.
mod memory;
mod subscribers;

pub use memory::MemoryEventLog;
pub use subscribers::SubscriberRegistry;
