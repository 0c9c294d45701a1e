//! Index entry codec.
//!
//! An entry is either a data entry (key bytes, child pointer, record id) or the
//! end-of-block sentinel that carries only the block's rightmost child pointer.
//!
//! Ordering is defined once on [`EntryKey`]: data keys compare byte-wise (a
//! strict prefix sorts first) and the end-of-block key sorts after every data
//! key. Child pointers and record ids never take part in comparisons.

use super::constants::{EOB_SIZE, ENTRY_HEADER_SIZE, MAX_DATA_SIZE};
use bytes::Bytes;
use std::cmp::Ordering;
use whdb_common::{Result, WhdbError};

/// Comparison key of an entry.
///
/// The derived order relies on variant order: every `Data` key is less than `Eob`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKey<'a> {
    /// Key bytes of a data entry.
    Data(&'a [u8]),
    /// The end-of-block sentinel.
    Eob,
}

/// An owned index entry.
#[derive(Debug, Clone)]
pub enum Entry {
    /// A key with its child pointer and record reference.
    Data {
        data: Bytes,
        child_block_id: u32,
        record_id: u32,
    },
    /// The end-of-block sentinel.
    Eob { child_block_id: u32 },
}

impl Entry {
    /// Encodes a data entry with a zero child pointer.
    ///
    /// Keys longer than [`MAX_DATA_SIZE`] must be truncated or handled above
    /// the index layer and are rejected here.
    pub fn encode_data(data: impl Into<Bytes>, record_id: u32) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_DATA_SIZE {
            return Err(WhdbError::KeyTooLarge {
                size: data.len(),
                max: MAX_DATA_SIZE,
            });
        }
        Ok(Entry::Data {
            data,
            child_block_id: 0,
            record_id,
        })
    }

    /// Encodes the end-of-block sentinel.
    pub fn encode_eob(child_block_id: u32) -> Self {
        Entry::Eob { child_block_id }
    }

    /// Returns this entry with its child pointer replaced.
    pub fn with_child_block_id(mut self, child_block_id: u32) -> Self {
        self.set_child_block_id(child_block_id);
        self
    }

    /// Sets the child pointer.
    pub fn set_child_block_id(&mut self, id: u32) {
        match self {
            Entry::Data { child_block_id, .. } | Entry::Eob { child_block_id } => {
                *child_block_id = id
            }
        }
    }

    /// Returns the key bytes (empty for the end-of-block entry).
    pub fn data(&self) -> &[u8] {
        match self {
            Entry::Data { data, .. } => &data[..],
            Entry::Eob { .. } => &[],
        }
    }

    /// Returns the number of key bytes.
    pub fn data_len(&self) -> usize {
        self.data().len()
    }

    /// Returns the record id (0 for the end-of-block entry).
    pub fn record_id(&self) -> u32 {
        match self {
            Entry::Data { record_id, .. } => *record_id,
            Entry::Eob { .. } => 0,
        }
    }

    /// Returns the child pointer.
    pub fn child_block_id(&self) -> u32 {
        match self {
            Entry::Data { child_block_id, .. } | Entry::Eob { child_block_id } => *child_block_id,
        }
    }

    /// Returns true for the end-of-block sentinel.
    pub fn is_eob(&self) -> bool {
        matches!(self, Entry::Eob { .. })
    }

    /// Number of block bytes this entry occupies (header slot plus payload).
    pub fn encoded_len(&self) -> usize {
        match self {
            Entry::Data { data, .. } => ENTRY_HEADER_SIZE + data.len(),
            Entry::Eob { .. } => EOB_SIZE,
        }
    }

    /// Returns the comparison key.
    pub fn key(&self) -> EntryKey<'_> {
        match self {
            Entry::Data { data, .. } => EntryKey::Data(&data[..]),
            Entry::Eob { .. } => EntryKey::Eob,
        }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A zero-copy view of an entry stored in an index block.
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    /// Key bytes, `None` for the end-of-block entry.
    data: Option<&'a [u8]>,
    child_block_id: u32,
    record_id: u32,
}

impl<'a> EntryRef<'a> {
    pub(crate) fn data_entry(data: &'a [u8], child_block_id: u32, record_id: u32) -> Self {
        Self {
            data: Some(data),
            child_block_id,
            record_id,
        }
    }

    pub(crate) fn eob_entry(child_block_id: u32) -> Self {
        Self {
            data: None,
            child_block_id,
            record_id: 0,
        }
    }

    /// Returns the key bytes (empty for the end-of-block entry).
    pub fn data(&self) -> &'a [u8] {
        self.data.unwrap_or(&[])
    }

    pub fn data_len(&self) -> usize {
        self.data().len()
    }

    pub fn record_id(&self) -> u32 {
        self.record_id
    }

    pub fn child_block_id(&self) -> u32 {
        self.child_block_id
    }

    pub fn is_eob(&self) -> bool {
        self.data.is_none()
    }

    /// Number of block bytes this entry occupies.
    pub fn encoded_len(&self) -> usize {
        match self.data {
            Some(data) => ENTRY_HEADER_SIZE + data.len(),
            None => EOB_SIZE,
        }
    }

    pub fn key(&self) -> EntryKey<'a> {
        match self.data {
            Some(data) => EntryKey::Data(data),
            None => EntryKey::Eob,
        }
    }

    /// Copies the entry out of the block.
    pub fn to_entry(&self) -> Entry {
        match self.data {
            Some(data) => Entry::Data {
                data: Bytes::copy_from_slice(data),
                child_block_id: self.child_block_id,
                record_id: self.record_id,
            },
            None => Entry::Eob {
                child_block_id: self.child_block_id,
            },
        }
    }
}

impl From<EntryRef<'_>> for Entry {
    fn from(entry: EntryRef<'_>) -> Self {
        entry.to_entry()
    }
}

impl PartialEq for EntryRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for EntryRef<'_> {}

impl PartialOrd for EntryRef<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryRef<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialEq<Entry> for EntryRef<'_> {
    fn eq(&self, other: &Entry) -> bool {
        self.key() == other.key()
    }
}

impl PartialOrd<Entry> for EntryRef<'_> {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.key().cmp(&other.key()))
    }
}
