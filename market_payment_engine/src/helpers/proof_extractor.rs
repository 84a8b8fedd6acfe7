use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

// A preimage is 32 bytes, so exactly 64 hex characters not embedded in a longer hex run
static PREIMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^0-9a-fA-F])([0-9a-fA-F]{64})(?:$|[^0-9a-fA-F])").expect("Invalid preimage regex"));

/// Pulls a payment preimage out of text pasted by the user, e.g. a wallet's payment details screen.
pub fn extract_preimage(text: &str) -> Option<String> {
    PREIMAGE.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().to_ascii_lowercase())
}

/// True if `preimage` hashes to `payment_hash` under SHA-256. Both are hex encoded.
pub fn verify_preimage(payment_hash: &str, preimage: &str) -> bool {
    let Ok(preimage_bytes) = hex::decode(preimage) else {
        return false;
    };
    let computed = hex::encode(Sha256::digest(preimage_bytes));
    computed.eq_ignore_ascii_case(payment_hash.trim())
}
