//! Error types for whdb.

use thiserror::Error;

/// Result type alias using WhdbError.
pub type Result<T> = std::result::Result<T, WhdbError>;

/// Errors that can occur in whdb storage operations.
///
/// Contract violations (overfilling an index block, deleting the end-of-block
/// entry, clearing a range that is still in use) are not represented here:
/// they panic at the call site.
#[derive(Debug, Error)]
pub enum WhdbError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Block errors
    #[error("Block size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("Block not found: {block_id}")]
    BlockNotFound { block_id: u32 },

    // Index errors
    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Index block corrupted: {0}")]
    IndexBlockCorrupted(String),

    // Transaction bitmap errors
    #[error("Commit bitmap format error: {reason}")]
    BitmapFormat { reason: String },

    #[error("Transaction range {range} exhausted")]
    RangeExhausted { range: u8 },

    #[error("Transaction range {range} is still in use")]
    RangeInUse { range: u8 },

    #[error("Transaction {id} already finished")]
    TransactionFinished { id: u32 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}
