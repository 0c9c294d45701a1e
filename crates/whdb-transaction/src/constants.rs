//! Transaction id and commit bitmap format constants.

use whdb_common::page::BITMAP_PAGE_SIZE;

// Id space

/// Number of transaction id ranges.
pub const RANGES_COUNT: usize = 4;

/// Bits of a transaction id holding the local offset.
pub const RANGE_SHIFT: u32 = 30;

/// Mask selecting the local offset of a transaction id.
pub const LOCAL_MASK: u32 = (1 << RANGE_SHIFT) - 1;

/// Largest local offset that can be allocated in a range.
pub const MAX_LOCAL_ID: u32 = LOCAL_MASK;

// Bitmap file layout

/// Current bitmap file format version.
pub const BITMAP_VERSION: u32 = 3;

/// Offset of the format version in the header page.
pub const OFF_VERSION: usize = 0;

/// Offset of the per-range last allocated local ids (u32 each).
pub const OFF_COUNTERS: usize = 4;

/// Offset of the current range index.
pub const OFF_CURRENT_RANGE: usize = OFF_COUNTERS + 4 * RANGES_COUNT;

/// Local ids covered by one bitmap page.
pub const BITS_PER_PAGE: u32 = (BITMAP_PAGE_SIZE * 8) as u32;

const _: () = assert!(OFF_CURRENT_RANGE == 20);
const _: () = assert!(BITS_PER_PAGE == 32768);
