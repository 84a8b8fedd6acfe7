use blake2::{digest::consts::U16, Blake2b, Digest};
use chrono::Utc;

use crate::order_types::{InvoiceId, OrderId, PublicKey};

type Blake2b128 = Blake2b<U16>;

/// A fresh, unguessable invoice id. Two requests for the same recipient never share an id.
pub fn new_invoice_id(order_id: &OrderId, recipient: &PublicKey) -> InvoiceId {
    let mut hasher = Blake2b128::new();
    hasher.update(order_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(recipient.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(rand::random::<u64>().to_le_bytes());
    InvoiceId(format!("inv-{}", hex::encode(hasher.finalize())))
}
