//! Index block storage for the B-tree.
//!
//! This module provides:
//! - Entry: ordered key/child-pointer/record entries and the end-of-block sentinel
//! - IndexBlock: slotted-page layout packing entries into one `BLOCK_SIZE` page
//!
//! Entry order is byte-wise on the key, a strict prefix sorts first and the
//! end-of-block entry sorts after everything:
//! ```text
//! ""  <  "a"  <  "ab"  <  "b"  <  ...  <  [0xFF; 256]  <  EOB
//! ```
//!
//! Blocks do not sort. The tree above finds a position with
//! [`IndexBlock::lower_bound`], checks [`IndexBlock::insert_possible`] and
//! splits with [`IndexBlock::split_point`] / [`IndexBlock::insert_range`]
//! when the entry does not fit.

mod block;
pub mod constants;
mod entry;

pub use block::{BlockPos, Entries, IndexBlock};
pub use constants::{BLOCK_HEADER_SIZE, ENTRY_HEADER_SIZE, EOB_SIZE, MAX_DATA_SIZE, MAX_FILL_SIZE};
pub use entry::{Entry, EntryKey, EntryRef};
