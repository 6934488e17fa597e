//! Hybrid logical clock timestamps.
//!
//! Feeds encode timestamps as decimals: the integer part is the wall time in
//! nanoseconds and the ten fractional digits are the logical component, so
//! `1700000000000000000.0000000002` is wall `1700000000000000000`, logical `2`.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Number of fractional digits that carry the logical component.
const LOGICAL_DIGITS: usize = 10;

/// A point in time on the cluster's hybrid logical clock.
///
/// Ordered by wall time, then logical. The zero value is the bottom element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Wall time in nanoseconds.
    pub wall_time: i64,
    /// Logical tie breaker within one wall time.
    pub logical: i32,
}

impl Timestamp {
    /// The bottom element.
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Timestamp { wall_time, logical }
    }

    /// Timestamp with only a wall component.
    pub const fn from_wall(wall_time: i64) -> Self {
        Timestamp {
            wall_time,
            logical: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Timestamp::ZERO
    }

    /// Moves `self` up to `other` if `other` is later. Returns true if it moved.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if *self < other {
            *self = other;
            true
        } else {
            false
        }
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn next(&self) -> Timestamp {
        if self.logical == i32::MAX {
            Timestamp::from_wall(self.wall_time + 1)
        } else {
            Timestamp::new(self.wall_time, self.logical + 1)
        }
    }

    /// The largest timestamp strictly less than `self`.
    pub fn prev(&self) -> Timestamp {
        if self.logical > 0 {
            Timestamp::new(self.wall_time, self.logical - 1)
        } else {
            Timestamp::new(self.wall_time - 1, i32::MAX)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.wall_time, self.logical)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::InvalidTimestamp {
            input: s.to_string(),
            reason,
        };

        let (whole, frac) = match s.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (s, ""),
        };
        if whole.is_empty() {
            return Err(invalid("missing wall time"));
        }
        let wall_time: i64 = whole.parse().map_err(|_| invalid("bad wall time"))?;

        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("bad logical component"));
        }
        let (significant, excess) = frac.split_at(frac.len().min(LOGICAL_DIGITS));
        if excess.bytes().any(|b| b != b'0') {
            return Err(invalid("logical component has too many digits"));
        }
        let mut digits = significant.to_string();
        while digits.len() < LOGICAL_DIGITS {
            digits.push('0');
        }
        let logical: i64 = digits.parse().map_err(|_| invalid("bad logical component"))?;
        let logical = i32::try_from(logical).map_err(|_| invalid("logical component overflows"))?;

        Ok(Timestamp { wall_time, logical })
    }
}
