use std::collections::{BTreeMap, HashSet};

use log::*;
use market_common::Sats;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::order_types::PublicKey;

/// Floating point slack allowed when checking that share fractions do not exceed the whole subtotal.
pub const FRACTION_TOLERANCE: f64 = 1e-4;

// Guards against `0.29 * 100.0 == 28.999999999999996` style truncation before flooring.
const FLOOR_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SplitError {
    #[error("The subtotal cannot be negative. Got {0}")]
    NegativeSubtotal(Sats),
    #[error("Share fraction for {recipient} must be a finite, non-negative number. Got {fraction}")]
    InvalidFraction { recipient: PublicKey, fraction: f64 },
    #[error("Share fractions add up to {0:.4}, which is more than the whole subtotal")]
    FractionsExceedTotal(f64),
    #[error("Recipient {0} appears more than once in the share set")]
    DuplicateRecipient(PublicKey),
    #[error("Recipient {0} is not part of the share set")]
    UnknownRecipient(PublicKey),
}

//--------------------------------------        Share         ---------------------------------------------------------
/// A value-for-value recipient's claim on a sale, as a fraction (`0..=1`) of the product subtotal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub recipient: PublicKey,
    pub fraction: f64,
}

impl Share {
    pub fn new<P: Into<PublicKey>>(recipient: P, fraction: f64) -> Self {
        Self { recipient: recipient.into(), fraction }
    }

    /// Converts a `0..=100` percentage into the canonical fraction form.
    pub fn from_percent<P: Into<PublicKey>>(recipient: P, percent: f64) -> Self {
        Self::new(recipient, percent / 100.0)
    }
}

//--------------------------------------      ValueSplit      ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSplit {
    pub total: Sats,
    pub merchant_amount: Sats,
    pub recipient_amounts: BTreeMap<PublicKey, Sats>,
}

impl ValueSplit {
    pub fn recipients_total(&self) -> Sats {
        self.recipient_amounts.values().copied().sum()
    }

    pub fn amount_for(&self, recipient: &PublicKey) -> Option<Sats> {
        self.recipient_amounts.get(recipient).copied()
    }

    /// Recipients that will actually receive an invoice.
    pub fn payable_recipients(&self) -> impl Iterator<Item = (&PublicKey, Sats)> {
        self.recipient_amounts.iter().filter(|(_, a)| a.is_positive()).map(|(r, a)| (r, *a))
    }
}

/// Splits `total_subtotal` between the merchant and the share recipients.
///
/// Each recipient receives `floor(total_subtotal * fraction)`, but never less than 1 sat when its fraction is
/// positive. Recipients are served in the given order and an amount is capped by what is left of the subtotal, so
/// the merchant amount can never go negative. The merchant receives the remainder, so
/// `merchant_amount + sum(recipient_amounts) == total_subtotal` always holds.
pub fn compute_shares(total_subtotal: Sats, shares: &[Share]) -> Result<ValueSplit, SplitError> {
    if total_subtotal.is_negative() {
        return Err(SplitError::NegativeSubtotal(total_subtotal));
    }
    let mut seen = HashSet::with_capacity(shares.len());
    for share in shares {
        if !share.fraction.is_finite() || share.fraction < 0.0 {
            return Err(SplitError::InvalidFraction { recipient: share.recipient.clone(), fraction: share.fraction });
        }
        if !seen.insert(&share.recipient) {
            return Err(SplitError::DuplicateRecipient(share.recipient.clone()));
        }
    }
    let fraction_sum = shares.iter().map(|s| s.fraction).sum::<f64>();
    if fraction_sum > 1.0 + FRACTION_TOLERANCE {
        return Err(SplitError::FractionsExceedTotal(fraction_sum));
    }

    let mut remaining = total_subtotal;
    let mut recipient_amounts = BTreeMap::new();
    for share in shares {
        let amount = if share.fraction > 0.0 {
            #[allow(clippy::cast_possible_truncation)]
            let raw = (total_subtotal.value() as f64 * share.fraction + FLOOR_EPSILON).floor() as i64;
            Sats::from(raw.max(1).min(remaining.value()))
        } else {
            Sats::default()
        };
        if share.fraction > 0.0 && !amount.is_positive() {
            let recipient = &share.recipient;
            warn!("🧮️ Subtotal {total_subtotal} is exhausted. {recipient} receives nothing from this sale");
        }
        remaining -= amount;
        recipient_amounts.insert(share.recipient.clone(), amount);
    }
    trace!("🧮️ Split {total_subtotal} between {} recipients. Merchant keeps {remaining}", shares.len());
    Ok(ValueSplit { total: total_subtotal, merchant_amount: remaining, recipient_amounts })
}
