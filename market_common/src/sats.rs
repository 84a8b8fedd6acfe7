use std::{
    fmt::Display,
    iter::Sum,
    ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign},
};

use serde::{Deserialize, Serialize};
use sqlx::Type;
use thiserror::Error;

use crate::op;

pub const MSATS_PER_SAT: i64 = 1_000;

//--------------------------------------        Sats         ---------------------------------------------------------
/// An amount of bitcoin, in whole satoshis.
///
/// Amounts are signed so that intermediate arithmetic (e.g. a merchant remainder) can be checked for underflow
/// instead of wrapping.
#[derive(Debug, Clone, Copy, Default, Type, Ord, PartialOrd, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct Sats(i64);

op!(binary Sats, Add, add);
op!(binary Sats, Sub, sub);
op!(inplace Sats, AddAssign, add_assign);
op!(inplace Sats, SubAssign, sub_assign);
op!(unary Sats, Neg, neg);

impl Mul<i64> for Sats {
    type Output = Self;

    fn mul(self, rhs: i64) -> Self::Output {
        Self::from(self.value() * rhs)
    }
}

impl Sum for Sats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

#[derive(Debug, Clone, Error)]
#[error("Value cannot be represented in sats: {0}")]
pub struct SatsConversionError(String);

impl From<i64> for Sats {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl PartialEq for Sats {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Sats {}

impl TryFrom<u64> for Sats {
    type Error = SatsConversionError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value > i64::MAX as u64 {
            Err(SatsConversionError(format!("Value {value} is too large to convert to Sats")))
        } else {
            #[allow(clippy::cast_possible_wrap)]
            Ok(Self(value as i64))
        }
    }
}

impl std::str::FromStr for Sats {
    type Err = SatsConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self).map_err(|e| SatsConversionError(format!("{s}: {e}")))
    }
}

impl Display for Sats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.abs() < 100_000_000 {
            write!(f, "{} sats", self.0)
        } else {
            let btc = self.0 as f64 / 100_000_000.0;
            write!(f, "{btc:0.8}₿")
        }
    }
}

impl Sats {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn from_msats(msats: i64) -> Self {
        Self(msats / MSATS_PER_SAT)
    }

    pub fn to_msats(&self) -> i64 {
        self.0 * MSATS_PER_SAT
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arithmetic() {
        let a = Sats::from(90_000);
        let b = Sats::from(10_000);
        assert_eq!(a + b, Sats::from(100_000));
        assert_eq!(a - b, Sats::from(80_000));
        assert_eq!(-b, Sats::from(-10_000));
        assert_eq!(b * 3, Sats::from(30_000));
        let total: Sats = vec![a, b, Sats::from(1)].into_iter().sum();
        assert_eq!(total.value(), 100_001);
    }

    #[test]
    fn conversions() {
        assert!(Sats::try_from(u64::MAX).is_err());
        assert_eq!(Sats::try_from(21u64).unwrap(), Sats::from(21));
        assert_eq!("1500".parse::<Sats>().unwrap(), Sats::from(1500));
        assert!("15x".parse::<Sats>().is_err());
        assert_eq!(Sats::from_msats(21_999), Sats::from(21));
        assert_eq!(Sats::from(5).to_msats(), 5_000);
    }

    #[test]
    fn display() {
        assert_eq!(Sats::from(50).to_string(), "50 sats");
        assert_eq!(Sats::from(150_000_000).to_string(), "1.50000000₿");
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&Sats::from(42)).unwrap();
        assert_eq!(json, "42");
    }
}
