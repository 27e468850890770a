// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of nfslock.
//
// nfslock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// nfslock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with nfslock. If not, see <https://www.gnu.org/licenses/>.

//! Byte-range algebra.
//!
//! A range is `(start, length)` with `length == 0` meaning "to end of file".
//! Every comparison is done on the inclusive end offset returned by
//! [`LockRange::end`], so a to-EOF range ends at `u64::MAX`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LockError, LockResult};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Shared lock
    Read,
    /// Exclusive lock
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "READ"),
            LockType::Write => write!(f, "WRITE"),
        }
    }
}

/// A typed byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRange {
    /// Lock mode
    pub lock_type: LockType,
    /// First byte covered
    pub start: u64,
    /// Number of bytes, 0 meaning to end of file
    pub length: u64,
}

/// Result of subtracting one range from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difference {
    /// The ranges do not overlap; the source survives unchanged
    Untouched(LockRange),
    /// The source is fully covered and disappears
    Removed,
    /// One residual survives
    Trimmed(LockRange),
    /// The subtracted range sits strictly inside the source
    Split(LockRange, LockRange),
}

impl Difference {
    /// True when the source range lost any bytes.
    pub fn removed(&self) -> bool {
        !matches!(self, Difference::Untouched(_))
    }

    /// Ranges left after the subtraction, left to right. An untouched
    /// source is its own single residual.
    pub fn residuals(&self) -> impl Iterator<Item = LockRange> {
        let (a, b) = match *self {
            Difference::Removed => (None, None),
            Difference::Untouched(r) | Difference::Trimmed(r) => (Some(r), None),
            Difference::Split(l, r) => (Some(l), Some(r)),
        };
        a.into_iter().chain(b)
    }
}

impl LockRange {
    /// Create a range.
    pub fn new(lock_type: LockType, start: u64, length: u64) -> Self {
        Self {
            lock_type,
            start,
            length,
        }
    }

    /// Read lock over `[start, start + length)`.
    pub fn read(start: u64, length: u64) -> Self {
        Self::new(LockType::Read, start, length)
    }

    /// Write lock over `[start, start + length)`.
    pub fn write(start: u64, length: u64) -> Self {
        Self::new(LockType::Write, start, length)
    }

    /// The whole file. The type is irrelevant for unlocks.
    pub fn whole_file(lock_type: LockType) -> Self {
        Self::new(lock_type, 0, 0)
    }

    /// Build a range from inclusive bounds. An end of `u64::MAX` is
    /// encoded as a to-EOF range.
    pub fn from_bounds(lock_type: LockType, start: u64, end: u64) -> Self {
        let length = if end == u64::MAX { 0 } else { end - start + 1 };
        Self::new(lock_type, start, length)
    }

    /// Same footprint, different mode.
    pub fn with_type(self, lock_type: LockType) -> Self {
        Self { lock_type, ..self }
    }

    /// Reject ranges whose last byte does not fit in a u64.
    pub fn validate(&self) -> LockResult<()> {
        if self.length != 0 && self.start.checked_add(self.length - 1).is_none() {
            return Err(LockError::InvalidArgument(format!(
                "range start={} length={} overflows",
                self.start, self.length
            )));
        }
        Ok(())
    }

    /// True when the range runs to end of file.
    pub fn is_to_eof(&self) -> bool {
        self.length == 0
    }

    /// Inclusive last byte.
    pub fn end(&self) -> u64 {
        if self.length == 0 {
            u64::MAX
        } else {
            self.start.saturating_add(self.length - 1)
        }
    }

    /// True when the two ranges share at least one byte.
    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.start <= other.end() && other.start <= self.end()
    }

    /// True when every byte of `inner` is inside `self`.
    pub fn contains(&self, inner: &LockRange) -> bool {
        self.start <= inner.start && inner.end() <= self.end()
    }

    /// True when the ranges overlap or are adjacent.
    pub fn touches(&self, other: &LockRange) -> bool {
        self.end().saturating_add(1) >= other.start && other.end().saturating_add(1) >= self.start
    }

    /// Conflict rule for two held ranges. Ranges of one owner never conflict.
    pub fn conflicts_with(&self, other: &LockRange, same_owner: bool) -> bool {
        !same_owner
            && self.overlaps(other)
            && (self.lock_type == LockType::Write || other.lock_type == LockType::Write)
    }

    /// Subtract `other` from `self`. Residuals keep `self`'s type, and a
    /// right residual of a to-EOF range stays to-EOF.
    pub fn difference(&self, other: &LockRange) -> Difference {
        if !self.overlaps(other) {
            return Difference::Untouched(*self);
        }
        if other.contains(self) {
            return Difference::Removed;
        }

        let (end, other_end) = (self.end(), other.end());
        let left = (self.start < other.start)
            .then(|| LockRange::from_bounds(self.lock_type, self.start, other.start - 1));
        let right = (end > other_end)
            .then(|| LockRange::from_bounds(self.lock_type, other_end + 1, end));

        match (left, right) {
            (Some(l), Some(r)) => Difference::Split(l, r),
            (Some(r), None) | (None, Some(r)) => Difference::Trimmed(r),
            (None, None) => Difference::Removed,
        }
    }
}

impl fmt::Display for LockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_to_eof() {
            write!(f, "{} [{}, EOF)", self.lock_type, self.start)
        } else {
            write!(f, "{} [{}, {}]", self.lock_type, self.start, self.end())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_range() {
        assert_eq!(LockRange::write(10, 40).end(), 49);
        assert_eq!(LockRange::write(1000, 0).end(), u64::MAX);
        assert_eq!(LockRange::read(0, 1).end(), 0);
    }

    #[test]
    fn test_validate_rejects_overflow() {
        assert!(LockRange::write(u64::MAX, 1).validate().is_ok());
        assert!(matches!(
            LockRange::write(u64::MAX, 2).validate(),
            Err(LockError::InvalidArgument(_))
        ));
        assert!(LockRange::write(u64::MAX, 0).validate().is_ok());
    }

    #[test]
    fn test_overlap_and_containment() {
        let a = LockRange::write(0, 100);
        assert!(a.overlaps(&LockRange::read(99, 5)));
        assert!(!a.overlaps(&LockRange::read(100, 5)));
        assert!(a.contains(&LockRange::read(10, 90)));
        assert!(!a.contains(&LockRange::read(10, 91)));
        assert!(LockRange::read(5, 0).contains(&LockRange::read(u64::MAX, 1)));
    }

    #[test]
    fn test_touches_includes_adjacent() {
        let a = LockRange::read(0, 10);
        assert!(a.touches(&LockRange::read(10, 5)));
        assert!(!a.touches(&LockRange::read(11, 5)));
        assert!(LockRange::read(0, 0).touches(&LockRange::read(u64::MAX, 1)));
    }

    #[test]
    fn test_conflict_rule() {
        let w = LockRange::write(0, 100);
        let r = LockRange::read(50, 10);
        assert!(w.conflicts_with(&r, false));
        assert!(!w.conflicts_with(&r, true));
        assert!(!r.conflicts_with(&LockRange::read(0, 100), false));
    }

    #[test]
    fn test_difference_split_in_middle() {
        let diff = LockRange::write(10, 40).difference(&LockRange::write(20, 10));
        let residuals: Vec<_> = diff.residuals().collect();
        assert_eq!(
            residuals,
            vec![LockRange::write(10, 10), LockRange::write(30, 20)]
        );
    }

    #[test]
    fn test_difference_full_containment() {
        let diff = LockRange::write(10, 40).difference(&LockRange::read(0, 50));
        assert_eq!(diff, Difference::Removed);
        assert!(diff.removed());
        assert_eq!(diff.residuals().count(), 0);
    }

    #[test]
    fn test_difference_disjoint_is_untouched() {
        let diff = LockRange::write(10, 10).difference(&LockRange::write(20, 10));
        assert_eq!(diff, Difference::Untouched(LockRange::write(10, 10)));
        assert!(!diff.removed());
        assert_eq!(diff.residuals().collect::<Vec<_>>(), vec![LockRange::write(10, 10)]);
    }

    #[test]
    fn test_to_eof_residual_stays_to_eof() {
        let diff = LockRange::read(0, 0).difference(&LockRange::write(0, 1000));
        assert_eq!(diff, Difference::Trimmed(LockRange::read(1000, 0)));

        let diff = LockRange::read(500, 0).difference(&LockRange::write(1000, 10));
        assert_eq!(
            diff,
            Difference::Split(LockRange::read(500, 500), LockRange::read(1010, 0))
        );
    }

    #[test]
    fn test_difference_to_eof_subtrahend_trims_left() {
        let diff = LockRange::read(0, 100).difference(&LockRange::write(50, 0));
        assert_eq!(diff, Difference::Trimmed(LockRange::read(0, 50)));
    }

    #[test]
    fn test_display() {
        assert_eq!(LockRange::write(0, 10).to_string(), "WRITE [0, 9]");
        assert_eq!(LockRange::read(7, 0).to_string(), "READ [7, EOF)");
    }
}
