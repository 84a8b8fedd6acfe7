mod ids;
mod proof_extractor;

pub use ids::new_invoice_id;
pub use proof_extractor::{extract_preimage, verify_preimage};
