//! Index storage for whdb.
//!
//! This crate provides:
//! - Entry codec with the key order used by the B-tree
//! - Slotted index blocks over caller-provided page memory
//! - Block file for reading and writing whole index blocks

mod file;
pub mod index;

pub use file::{BlockFile, BlockFileOptions};
pub use index::{
    BLOCK_HEADER_SIZE, BlockPos, ENTRY_HEADER_SIZE, EOB_SIZE, Entries, Entry, EntryKey, EntryRef,
    IndexBlock, MAX_DATA_SIZE, MAX_FILL_SIZE,
};
