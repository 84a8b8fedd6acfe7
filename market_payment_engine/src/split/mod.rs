//! # Value-for-value split calculator
//!
//! A seller may assign part of each sale's product subtotal to one or more share recipients. This module turns a
//! subtotal and a set of [`Share`]s into exact satoshi amounts ([`compute_shares`]), and offers [`ShareSet`] for
//! editing a recipient distribution interactively.
//!
//! Fractions are always stored in the canonical `0..=1` form. Use [`Share::from_percent`] at the boundary when a
//! value arrives as a percentage.
mod calculator;
mod share_set;

pub use calculator::{compute_shares, Share, SplitError, ValueSplit, FRACTION_TOLERANCE};
pub use share_set::{ShareSet, MIN_RECIPIENT_WEIGHT};
