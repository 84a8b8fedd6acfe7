mod channel;
mod event_types;
mod hooks;

pub use channel::{handler, EventHandler, EventProducer, Handler};
pub use event_types::*;
pub use hooks::{EventHandlers, EventHooks, EventProducers};
