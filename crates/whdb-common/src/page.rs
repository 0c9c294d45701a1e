//! Block and page constants shared by the index and the commit bitmap.

use serde::{Deserialize, Serialize};

/// Size of an index block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Size of a commit bitmap page in bytes.
pub const BITMAP_PAGE_SIZE: usize = 4096;

/// Number of a block within an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Byte offset of this block within its file.
    pub fn file_offset(&self) -> u64 {
        self.0 as u64 * BLOCK_SIZE as u64
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block:{}", self.0)
    }
}
