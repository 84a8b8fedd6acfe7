mod sats;

pub mod helpers;
pub mod op;

pub use sats::{Sats, SatsConversionError, MSATS_PER_SAT};
