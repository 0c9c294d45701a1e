//! Transaction state for whdb.
//!
//! Assigns transaction ids from four rotating id ranges, records commit
//! outcomes in a persistent per-range bitmap and answers visibility queries
//! between transactions.

pub mod bitmap;
pub mod constants;
pub mod id;
pub mod manager;
pub mod store;
pub mod transaction;

pub use bitmap::{BitmapHeader, BitmapStoreOptions, CommitBitmap};
pub use id::{RangeId, TransactionId, first_id_in_range, local_offset, range_of};
pub use manager::{TransactionStateManager, TransactionStatus, VisibilityMode};
pub use store::{FileStore, MemoryStore, RandomAccessStore};
pub use transaction::{IdentifiedTransaction, TransactionState};
