//! Index block layout constants.

use whdb_common::page::BLOCK_SIZE;

/// Maximum number of key bytes stored in a single entry.
pub const MAX_DATA_SIZE: usize = 256;

/// Size of the block header (headers_size:2 + data_size:2 + reserved:4).
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Size of a data entry header slot (offset:2 + len:2 + child:4 + record:4).
pub const ENTRY_HEADER_SIZE: usize = 12;

/// Size of the end-of-block slot (marker:2 + zero:2 + child:4).
pub const EOB_SIZE: usize = 8;

/// Bytes available to entries once the block header is accounted for.
pub const MAX_FILL_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Offset value that marks a header slot as the end-of-block entry.
pub(crate) const EOB_MARKER: u16 = 0xFFFF;

// Field offsets inside the block header

pub(crate) const OFF_HEADERS_SIZE: usize = 0;
pub(crate) const OFF_DATA_SIZE: usize = 2;

// Field offsets inside a header slot

pub(crate) const SLOT_DATA_OFFSET: usize = 0;
pub(crate) const SLOT_DATA_LEN: usize = 2;
pub(crate) const SLOT_CHILD: usize = 4;
pub(crate) const SLOT_RECORD: usize = 8;

const _: () = assert!(EOB_SIZE < ENTRY_HEADER_SIZE);
const _: () = assert!(BLOCK_SIZE <= EOB_MARKER as usize);
