//! Transaction id space.
//!
//! A transaction id is 32 bits split into a range and a local offset:
//! ```text
//!  31 30 29                                  0
//! +-----+------------------------------------+
//! |range|            local offset            |
//! +-----+------------------------------------+
//! ```

use crate::constants::{LOCAL_MASK, RANGE_SHIFT, RANGES_COUNT};
use std::fmt;

/// Index of one of the transaction id ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeId(u8);

impl RangeId {
    /// Creates a range id.
    ///
    /// # Panics
    ///
    /// Panics if `range >= RANGES_COUNT`.
    pub fn new(range: u8) -> Self {
        assert!(
            (range as usize) < RANGES_COUNT,
            "transaction range {} out of domain",
            range
        );
        Self(range)
    }

    /// Returns the range index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Returns the raw range number.
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the range that follows this one, wrapping around.
    pub fn next(&self) -> Self {
        Self(((self.0 as usize + 1) % RANGES_COUNT) as u8)
    }

    /// Iterates over all ranges in order.
    pub fn all() -> impl Iterator<Item = RangeId> {
        (0..RANGES_COUNT as u8).map(RangeId)
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u32);

impl TransactionId {
    /// Sentinel for a transaction that never committed.
    pub const NEVER_COMMITTED: TransactionId = TransactionId(0);

    /// Sentinel for a transaction that always counts as committed.
    pub const ALWAYS_COMMITTED: TransactionId = TransactionId(1 << RANGE_SHIFT);

    /// Builds an id from a range and a local offset.
    pub fn from_parts(range: RangeId, local: u32) -> Self {
        debug_assert!(local <= LOCAL_MASK, "local offset {} out of domain", local);
        TransactionId(((range.0 as u32) << RANGE_SHIFT) | (local & LOCAL_MASK))
    }

    /// Returns the first id of a range (local offset 0, never allocated).
    pub fn first_in_range(range: RangeId) -> Self {
        Self::from_parts(range, 0)
    }

    /// Returns the range this id belongs to.
    pub fn range(&self) -> RangeId {
        RangeId((self.0 >> RANGE_SHIFT) as u8)
    }

    /// Returns the offset of this id within its range.
    pub fn local_offset(&self) -> u32 {
        self.0 & LOCAL_MASK
    }

    /// Returns true for the two reserved sentinel ids.
    pub fn is_sentinel(&self) -> bool {
        *self == Self::NEVER_COMMITTED || *self == Self::ALWAYS_COMMITTED
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.range(), self.local_offset())
    }
}

/// Range of a transaction id.
pub fn range_of(id: TransactionId) -> RangeId {
    id.range()
}

/// Offset of a transaction id within its range.
pub fn local_offset(id: TransactionId) -> u32 {
    id.local_offset()
}

/// First id of a range.
pub fn first_id_in_range(range: RangeId) -> TransactionId {
    TransactionId::first_in_range(range)
}
