//! whdb common types, errors, and configuration.
//!
//! This crate provides shared definitions used by the index and transaction crates.

pub mod config;
pub mod error;
pub mod page;

pub use config::StorageConfig;
pub use error::{Result, WhdbError};
pub use page::{BITMAP_PAGE_SIZE, BLOCK_SIZE, BlockId};
