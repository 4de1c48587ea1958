//! LSN: a byte offset into the WAL stream.
//!
//! Mirrors the handful of operations the proposer and acceptor sides of the
//! protocol both need: little-endian wire round-tripping, `%X/%X`-style
//! display, and checked subtraction.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// A Log Sequence Number: a byte offset into the WAL.
///
/// `Lsn(0)` is the sentinel "invalid / not yet known" value; see [`Lsn::INVALID`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// Subtract `other` from `self`, returning `None` on underflow.
    pub fn checked_sub<T: Into<u64>>(self, other: T) -> Option<Lsn> {
        let other: u64 = other.into();
        self.0.checked_sub(other).map(Lsn)
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;
    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<Lsn> for Lsn {
    type Output = u64;
    fn sub(self, rhs: Lsn) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffffffff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_zero() {
        assert_eq!(Lsn::INVALID, Lsn(0));
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn(1).is_valid());
    }

    #[test]
    fn display_matches_pg_format() {
        assert_eq!(format!("{}", Lsn(0x16000000)), "16/0");
        assert_eq!(format!("{}", Lsn(0x1_0000_0001)), "1/1");
    }

    #[test]
    fn checked_sub_underflows_to_none() {
        assert_eq!(Lsn(5).checked_sub(10u64), None);
        assert_eq!(Lsn(10).checked_sub(5u64), Some(Lsn(5)));
    }
}
