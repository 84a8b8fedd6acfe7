use log::*;
use serde::{Deserialize, Serialize};

use super::{Share, SplitError, FRACTION_TOLERANCE};
use crate::order_types::PublicKey;

/// No recipient is pushed below this weight when another recipient's weight is edited.
pub const MIN_RECIPIENT_WEIGHT: f64 = 0.01;

/// An editable value-for-value configuration for one seller.
///
/// `total_fraction` is the part of the product subtotal that goes to share recipients as a whole. It is distributed
/// among the recipients according to their weights, which always sum to 1 while the set is non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareSet {
    total_fraction: f64,
    weights: Vec<(PublicKey, f64)>,
}

impl ShareSet {
    pub fn new(total_fraction: f64) -> Result<Self, SplitError> {
        check_total(total_fraction)?;
        Ok(Self { total_fraction, weights: Vec::new() })
    }

    /// Builds a share set from raw weights, normalising them so that they sum to 1.
    pub fn from_weights(total_fraction: f64, weights: Vec<(PublicKey, f64)>) -> Result<Self, SplitError> {
        check_total(total_fraction)?;
        let mut set = Self::new(total_fraction)?;
        for (recipient, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(SplitError::InvalidFraction { recipient, fraction: weight });
            }
            if set.weight_of(&recipient).is_some() {
                return Err(SplitError::DuplicateRecipient(recipient));
            }
            set.weights.push((recipient, weight));
        }
        set.renormalise();
        Ok(set)
    }

    pub fn total_fraction(&self) -> f64 {
        self.total_fraction
    }

    pub fn set_total_fraction(&mut self, total_fraction: f64) -> Result<(), SplitError> {
        check_total(total_fraction)?;
        self.total_fraction = total_fraction;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weight_of(&self, recipient: &PublicKey) -> Option<f64> {
        self.weights.iter().find(|(r, _)| r == recipient).map(|(_, w)| *w)
    }

    pub fn recipients(&self) -> impl Iterator<Item = &PublicKey> {
        self.weights.iter().map(|(r, _)| r)
    }

    /// Adds a recipient with an equal slice of the distribution. Existing recipients are scaled down to make room.
    pub fn add_recipient(&mut self, recipient: PublicKey) -> Result<(), SplitError> {
        if self.weight_of(&recipient).is_some() {
            return Err(SplitError::DuplicateRecipient(recipient));
        }
        let n = self.weights.len() as f64;
        let share = 1.0 / (n + 1.0);
        for (_, w) in self.weights.iter_mut() {
            *w *= 1.0 - share;
        }
        self.weights.push((recipient, share));
        Ok(())
    }

    /// Removes a recipient. The survivors are rescaled by `1 / sum(remaining)` so that they sum to 1 again.
    pub fn remove_recipient(&mut self, recipient: &PublicKey) -> Result<(), SplitError> {
        let idx = self.position(recipient)?;
        self.weights.remove(idx);
        self.renormalise();
        debug!("🧮️ Removed {recipient} from share set. {} recipients remain", self.weights.len());
        Ok(())
    }

    /// Sets a recipient's weight. The other recipients absorb the difference in proportion to their current weights.
    ///
    /// No other recipient may drop below [`MIN_RECIPIENT_WEIGHT`]; when the requested weight would force that, it is
    /// clamped to the largest value that keeps the floor. The edited recipient is held to the same floor.
    ///
    /// Returns the weight that was actually applied.
    pub fn set_weight(&mut self, recipient: &PublicKey, weight: f64) -> Result<f64, SplitError> {
        if !weight.is_finite() {
            return Err(SplitError::InvalidFraction { recipient: recipient.clone(), fraction: weight });
        }
        let idx = self.position(recipient)?;
        if self.weights.len() == 1 {
            self.weights[0].1 = 1.0;
            return Ok(1.0);
        }
        let others = self.weights.iter().enumerate().filter(|(i, _)| *i != idx).map(|(_, (_, w))| *w);
        let others_sum = others.clone().sum::<f64>();
        let smallest = others.fold(f64::INFINITY, f64::min);
        let upper = if smallest > 0.0 { 1.0 - MIN_RECIPIENT_WEIGHT * others_sum / smallest } else { 1.0 };
        let applied = weight.clamp(MIN_RECIPIENT_WEIGHT, upper.max(MIN_RECIPIENT_WEIGHT));
        if (applied - weight).abs() > f64::EPSILON {
            info!("🧮️ Requested weight {weight:.4} for {recipient} was clamped to {applied:.4}");
        }
        let remainder = 1.0 - applied;
        let n_others = (self.weights.len() - 1) as f64;
        for (i, (_, w)) in self.weights.iter_mut().enumerate() {
            if i == idx {
                *w = applied;
            } else if others_sum > 0.0 {
                *w *= remainder / others_sum;
            } else {
                *w = remainder / n_others;
            }
        }
        Ok(applied)
    }

    /// The effective shares, as fractions of the product subtotal.
    pub fn to_shares(&self) -> Vec<Share> {
        self.weights.iter().map(|(r, w)| Share::new(r.clone(), self.total_fraction * w)).collect()
    }

    fn position(&self, recipient: &PublicKey) -> Result<usize, SplitError> {
        self.weights
            .iter()
            .position(|(r, _)| r == recipient)
            .ok_or_else(|| SplitError::UnknownRecipient(recipient.clone()))
    }

    fn renormalise(&mut self) {
        let sum = self.weights.iter().map(|(_, w)| *w).sum::<f64>();
        if sum > 0.0 {
            for (_, w) in self.weights.iter_mut() {
                *w /= sum;
            }
        } else if !self.weights.is_empty() {
            let even = 1.0 / self.weights.len() as f64;
            for (_, w) in self.weights.iter_mut() {
                *w = even;
            }
        }
    }
}

fn check_total(total_fraction: f64) -> Result<(), SplitError> {
    if !total_fraction.is_finite() || total_fraction < 0.0 {
        return Err(SplitError::InvalidFraction { recipient: PublicKey::from("*"), fraction: total_fraction });
    }
    if total_fraction > 1.0 + FRACTION_TOLERANCE {
        return Err(SplitError::FractionsExceedTotal(total_fraction));
    }
    Ok(())
}
