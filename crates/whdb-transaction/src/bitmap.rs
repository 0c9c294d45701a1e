//! Persistent commit bitmap.
//!
//! File layout (pages of `BITMAP_PAGE_SIZE` bytes):
//! ```text
//! page 0                header: version | last allocated id per range | current range
//! page 1 + 4*n + r      commit bits of range r for local ids n*32768 .. (n+1)*32768
//! ```
//!
//! Local id `L` of range `r` is bit `L & 7` of byte `(L >> 3) & 4095` in page
//! `1 + (L / 32768) * 4 + r`. A set bit means committed. Pages past the end of
//! the file read as all zero.

use crate::constants::{
    BITMAP_VERSION, BITS_PER_PAGE, MAX_LOCAL_ID, OFF_COUNTERS, OFF_CURRENT_RANGE, OFF_VERSION,
    RANGES_COUNT,
};
use crate::id::{RangeId, TransactionId};
use crate::store::RandomAccessStore;
use std::collections::HashSet;
use tracing::{debug, info, trace};
use whdb_common::page::BITMAP_PAGE_SIZE;
use whdb_common::{Result, WhdbError};

/// Options for the commit bitmap.
#[derive(Debug, Clone)]
pub struct BitmapStoreOptions {
    /// Sync the store when a transaction prepares or commits.
    pub fsync_enabled: bool,
}

impl Default for BitmapStoreOptions {
    fn default() -> Self {
        Self {
            fsync_enabled: true,
        }
    }
}

/// Header page contents.
///
/// Layout (21 bytes, rest of page 0 is zero):
/// - version: 4 bytes
/// - last allocated local id: 4 bytes per range
/// - current range: 1 byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapHeader {
    /// Format version.
    pub version: u32,
    /// Last allocated local id of every range.
    pub counters: [u32; RANGES_COUNT],
    /// Range ids are currently allocated from.
    pub current_range: u8,
}

impl BitmapHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = OFF_CURRENT_RANGE + 1;

    /// Creates the header of a fresh bitmap.
    pub fn new() -> Self {
        Self {
            version: BITMAP_VERSION,
            counters: [0; RANGES_COUNT],
            current_range: 0,
        }
    }

    /// Validates this header.
    pub fn validate(&self) -> Result<()> {
        if self.version != BITMAP_VERSION {
            return Err(WhdbError::BitmapFormat {
                reason: format!("unsupported version: {}", self.version),
            });
        }
        if self.current_range as usize >= RANGES_COUNT {
            return Err(WhdbError::BitmapFormat {
                reason: format!("invalid current range: {}", self.current_range),
            });
        }
        if let Some(counter) = self.counters.iter().find(|c| **c > MAX_LOCAL_ID) {
            return Err(WhdbError::BitmapFormat {
                reason: format!("invalid range counter: {}", counter),
            });
        }
        Ok(())
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_le_bytes());
        for (r, counter) in self.counters.iter().enumerate() {
            let off = OFF_COUNTERS + 4 * r;
            data[off..off + 4].copy_from_slice(&counter.to_le_bytes());
        }
        data[OFF_CURRENT_RANGE] = self.current_range;
        data
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Self {
        let read_u32 = |off: usize| {
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };

        let mut counters = [0u32; RANGES_COUNT];
        for (r, counter) in counters.iter_mut().enumerate() {
            *counter = read_u32(OFF_COUNTERS + 4 * r);
        }
        Self {
            version: read_u32(OFF_VERSION),
            counters,
            current_range: data[OFF_CURRENT_RANGE],
        }
    }
}

impl Default for BitmapHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Location of a commit bit within the store.
fn bit_location(id: TransactionId) -> (u64, u8) {
    let local = id.local_offset();
    let page =
        1 + (local / BITS_PER_PAGE) as u64 * RANGES_COUNT as u64 + id.range().index() as u64;
    let byte = ((local >> 3) as usize & (BITMAP_PAGE_SIZE - 1)) as u64;
    (page * BITMAP_PAGE_SIZE as u64 + byte, 1 << (local & 7))
}

/// Per-range commit bitmap with id allocation counters.
///
/// Ids become committed in two steps: [`CommitBitmap::mark_prepared`] makes
/// sure the bitmap page exists on storage, then
/// [`CommitBitmap::mark_committed`] flips the bit. Commits of ids that were
/// never prepared are ignored.
pub struct CommitBitmap {
    store: Box<dyn RandomAccessStore>,
    options: BitmapStoreOptions,
    header: BitmapHeader,
    prepared: HashSet<TransactionId>,
}

impl CommitBitmap {
    /// Opens a bitmap, initializing the store if it is empty.
    pub fn open<S: RandomAccessStore + 'static>(
        store: S,
        options: BitmapStoreOptions,
    ) -> Result<Self> {
        let mut store: Box<dyn RandomAccessStore> = Box::new(store);
        let len = store.len()?;

        let header = if len == 0 {
            let header = BitmapHeader::new();
            let mut page = [0u8; BITMAP_PAGE_SIZE];
            page[..BitmapHeader::SIZE].copy_from_slice(&header.to_bytes());
            store.write_at(0, &page)?;
            store.sync()?;
            info!(version = BITMAP_VERSION, "initialized commit bitmap");
            header
        } else {
            if len % BITMAP_PAGE_SIZE as u64 != 0 {
                return Err(WhdbError::BitmapFormat {
                    reason: format!(
                        "size {} is not a multiple of {}",
                        len, BITMAP_PAGE_SIZE
                    ),
                });
            }
            let mut data = [0u8; BitmapHeader::SIZE];
            store.read_at(0, &mut data)?;
            let header = BitmapHeader::from_bytes(&data);
            header.validate()?;
            debug!(
                pages = len / BITMAP_PAGE_SIZE as u64,
                current_range = header.current_range,
                "opened commit bitmap"
            );
            header
        };

        Ok(Self {
            store,
            options,
            header,
            prepared: HashSet::new(),
        })
    }

    /// Returns the range ids are allocated from.
    pub fn current_range(&self) -> RangeId {
        RangeId::new(self.header.current_range)
    }

    /// Returns the last allocated local id of `range` (0 if none).
    pub fn last_allocated(&self, range: RangeId) -> u32 {
        self.header.counters[range.index()]
    }

    /// Returns the current header contents.
    pub fn header(&self) -> &BitmapHeader {
        &self.header
    }

    /// Returns true if `id` was prepared and has not committed yet.
    pub fn is_prepared(&self, id: TransactionId) -> bool {
        self.prepared.contains(&id)
    }

    fn write_counter(&mut self, range: RangeId) -> Result<()> {
        let counter = self.header.counters[range.index()];
        self.store
            .write_at((OFF_COUNTERS + 4 * range.index()) as u64, &counter.to_le_bytes())
    }

    fn sync_if_enabled(&mut self) -> Result<()> {
        if self.options.fsync_enabled {
            self.store.sync()?;
        }
        Ok(())
    }

    /// Allocates the next id of the current range.
    ///
    /// The counter is written through but not synced; preparing any id
    /// syncs it.
    pub fn allocate_next_id(&mut self) -> Result<TransactionId> {
        let range = self.current_range();
        let last = self.header.counters[range.index()];
        if last >= MAX_LOCAL_ID {
            return Err(WhdbError::RangeExhausted {
                range: range.as_u8(),
            });
        }

        self.header.counters[range.index()] = last + 1;
        self.write_counter(range)?;

        let id = TransactionId::from_parts(range, last + 1);
        trace!(id = %id, "allocated transaction id");
        Ok(id)
    }

    /// Ensures the bitmap page holding `id` exists so a later commit
    /// cannot fail for lack of space.
    pub fn mark_prepared(&mut self, id: TransactionId) -> Result<()> {
        let (offset, _) = bit_location(id);
        let page_end = (offset / BITMAP_PAGE_SIZE as u64 + 1) * BITMAP_PAGE_SIZE as u64;
        if self.store.len()? < page_end {
            self.store.set_len(page_end)?;
        }
        self.sync_if_enabled()?;

        self.prepared.insert(id);
        debug!(id = %id, "prepared transaction");
        Ok(())
    }

    /// Sets the commit bit of a prepared id.
    ///
    /// Returns false without touching the store if `id` was not prepared.
    pub fn mark_committed(&mut self, id: TransactionId) -> Result<bool> {
        if !self.prepared.contains(&id) {
            return Ok(false);
        }

        let (offset, mask) = bit_location(id);
        let mut byte = [0u8; 1];
        self.store.read_at(offset, &mut byte)?;
        byte[0] |= mask;
        self.store.write_at(offset, &byte)?;
        self.sync_if_enabled()?;

        self.prepared.remove(&id);
        debug!(id = %id, "committed transaction");
        Ok(true)
    }

    /// Forgets a prepared id without committing it.
    pub fn forget_prepared(&mut self, id: TransactionId) {
        self.prepared.remove(&id);
    }

    /// Reads the commit bit of `id`. Bits past the end of the store are 0.
    pub fn read_bit(&mut self, id: TransactionId) -> Result<bool> {
        let (offset, mask) = bit_location(id);
        if offset >= self.store.len()? {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        self.store.read_at(offset, &mut byte)?;
        Ok(byte[0] & mask != 0)
    }

    /// Makes the next range current and persists the choice.
    pub fn switch_to_next_range(&mut self) -> Result<RangeId> {
        let next = self.current_range().next();
        self.header.current_range = next.as_u8();
        self.store
            .write_at(OFF_CURRENT_RANGE as u64, &[self.header.current_range])?;
        self.sync_if_enabled()?;

        info!(range = %next, "switched transaction range");
        Ok(next)
    }

    /// Zeroes all commit bits of `range` and resets its counter.
    ///
    /// # Panics
    ///
    /// Panics if `range` is the current range.
    pub fn clear_range(&mut self, range: RangeId) -> Result<()> {
        assert!(
            range != self.current_range(),
            "cannot clear current transaction range {}",
            range
        );
        let num_pages = self.store.len()? / BITMAP_PAGE_SIZE as u64;
        let zero = [0u8; BITMAP_PAGE_SIZE];
        let mut cleared = 0u64;
        let mut page = 1 + range.index() as u64;
        while page < num_pages {
            self.store.write_at(page * BITMAP_PAGE_SIZE as u64, &zero)?;
            cleared += 1;
            page += RANGES_COUNT as u64;
        }

        self.header.counters[range.index()] = 0;
        self.write_counter(range)?;
        self.sync_if_enabled()?;
        self.prepared.retain(|id| id.range() != range);

        info!(range = %range, pages = cleared, "cleared transaction range");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryStore};
    use tempfile::tempdir;

    fn memory_bitmap() -> CommitBitmap {
        CommitBitmap::open(MemoryStore::new(), BitmapStoreOptions::default()).unwrap()
    }

    fn raw_header(header: BitmapHeader) -> Vec<u8> {
        let mut data = vec![0u8; BITMAP_PAGE_SIZE];
        data[..BitmapHeader::SIZE].copy_from_slice(&header.to_bytes());
        data
    }

    #[test]
    fn test_header_roundtrip() {
        let header = BitmapHeader {
            version: BITMAP_VERSION,
            counters: [1, 22, 333, 4444],
            current_range: 2,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &22u32.to_le_bytes());
        assert_eq!(bytes[20], 2);
        assert_eq!(BitmapHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_bit_location() {
        let r2 = RangeId::new(2);
        assert_eq!(
            bit_location(TransactionId::from_parts(r2, 1)),
            (3 * 4096, 0b10)
        );
        // Second bitmap page of range 2 is page 1 + 4 + 2
        assert_eq!(
            bit_location(TransactionId::from_parts(r2, 32769)),
            (7 * 4096, 0b10)
        );
        assert_eq!(
            bit_location(TransactionId::from_parts(RangeId::new(0), 8 * 4095 + 7)),
            (4096 + 4095, 0x80)
        );
    }

    #[test]
    fn test_open_initializes_empty_store() {
        let bitmap = memory_bitmap();
        assert_eq!(bitmap.current_range(), RangeId::new(0));
        for range in RangeId::all() {
            assert_eq!(bitmap.last_allocated(range), 0);
        }
        assert_eq!(*bitmap.header(), BitmapHeader::new());
    }

    #[test]
    fn test_allocate_sequential_ids() {
        let mut bitmap = memory_bitmap();
        let r0 = RangeId::new(0);
        assert_eq!(bitmap.allocate_next_id().unwrap(), TransactionId::from_parts(r0, 1));
        assert_eq!(bitmap.allocate_next_id().unwrap(), TransactionId::from_parts(r0, 2));
        assert_eq!(bitmap.last_allocated(r0), 2);
    }

    #[test]
    fn test_prepare_then_commit() {
        let mut bitmap = memory_bitmap();
        let id = bitmap.allocate_next_id().unwrap();
        assert!(!bitmap.read_bit(id).unwrap());

        bitmap.mark_prepared(id).unwrap();
        assert!(bitmap.is_prepared(id));
        assert!(!bitmap.read_bit(id).unwrap());

        assert!(bitmap.mark_committed(id).unwrap());
        assert!(bitmap.read_bit(id).unwrap());
        assert!(!bitmap.is_prepared(id));
    }

    #[test]
    fn test_commit_without_prepare_is_ignored() {
        let mut bitmap = memory_bitmap();
        let id = bitmap.allocate_next_id().unwrap();
        // Make sure the page exists so the bit could have been written
        let other = bitmap.allocate_next_id().unwrap();
        bitmap.mark_prepared(other).unwrap();

        assert!(!bitmap.mark_committed(id).unwrap());
        assert!(!bitmap.read_bit(id).unwrap());
    }

    #[test]
    fn test_forget_prepared() {
        let mut bitmap = memory_bitmap();
        let id = bitmap.allocate_next_id().unwrap();
        bitmap.mark_prepared(id).unwrap();
        bitmap.forget_prepared(id);
        assert!(!bitmap.mark_committed(id).unwrap());
    }

    #[test]
    fn test_read_bit_past_end() {
        let mut bitmap = memory_bitmap();
        let far = TransactionId::from_parts(RangeId::new(3), 1_000_000);
        assert!(!bitmap.read_bit(far).unwrap());
    }

    #[test]
    fn test_prepare_extends_store_by_pages() {
        let mut bitmap = memory_bitmap();
        let id = TransactionId::from_parts(RangeId::new(1), 40_000);
        bitmap.mark_prepared(id).unwrap();
        assert!(bitmap.mark_committed(id).unwrap());
        assert!(bitmap.read_bit(id).unwrap());
        // Neighbouring bits stay clear
        assert!(!bitmap.read_bit(TransactionId::from_parts(RangeId::new(1), 40_001)).unwrap());
        assert!(!bitmap.read_bit(TransactionId::from_parts(RangeId::new(2), 40_000)).unwrap());
    }

    #[test]
    fn test_switch_cycles_ranges() {
        let mut bitmap = memory_bitmap();
        let mut seen = Vec::new();
        for _ in 0..RANGES_COUNT {
            seen.push(bitmap.switch_to_next_range().unwrap().index());
        }
        assert_eq!(seen, vec![1, 2, 3, 0]);

        bitmap.switch_to_next_range().unwrap();
        let id = bitmap.allocate_next_id().unwrap();
        assert_eq!(id.range(), RangeId::new(1));
        assert_eq!(id.local_offset(), 1);
    }

    #[test]
    fn test_clear_range() {
        let mut bitmap = memory_bitmap();
        let mut ids = Vec::new();
        for _ in 0..10 {
            let id = bitmap.allocate_next_id().unwrap();
            bitmap.mark_prepared(id).unwrap();
            bitmap.mark_committed(id).unwrap();
            ids.push(id);
        }
        let pending = bitmap.allocate_next_id().unwrap();
        bitmap.mark_prepared(pending).unwrap();
        bitmap.switch_to_next_range().unwrap();

        bitmap.clear_range(RangeId::new(0)).unwrap();
        for id in ids {
            assert!(!bitmap.read_bit(id).unwrap());
        }
        assert_eq!(bitmap.last_allocated(RangeId::new(0)), 0);
        assert!(!bitmap.is_prepared(pending));
        assert!(!bitmap.mark_committed(pending).unwrap());
    }

    #[test]
    #[should_panic(expected = "cannot clear current transaction range")]
    fn test_clear_current_range_panics() {
        let mut bitmap = memory_bitmap();
        let id = bitmap.allocate_next_id().unwrap();
        bitmap.mark_prepared(id).unwrap();
        bitmap.mark_committed(id).unwrap();

        let current = bitmap.current_range();
        let _ = bitmap.clear_range(current);
    }

    #[test]
    fn test_range_exhausted() {
        let mut header = BitmapHeader::new();
        header.counters[0] = MAX_LOCAL_ID;
        let store = MemoryStore::from_bytes(raw_header(header));
        let mut bitmap = CommitBitmap::open(store, BitmapStoreOptions::default()).unwrap();

        assert!(matches!(
            bitmap.allocate_next_id(),
            Err(WhdbError::RangeExhausted { range: 0 })
        ));
    }

    #[test]
    fn test_rejects_partial_page() {
        let store = MemoryStore::from_bytes(vec![0u8; 100]);
        let result = CommitBitmap::open(store, BitmapStoreOptions::default());
        assert!(matches!(result, Err(WhdbError::BitmapFormat { .. })));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let header = BitmapHeader {
            version: 2,
            ..BitmapHeader::new()
        };
        let store = MemoryStore::from_bytes(raw_header(header));
        let result = CommitBitmap::open(store, BitmapStoreOptions::default());
        assert!(matches!(result, Err(WhdbError::BitmapFormat { .. })));
    }

    #[test]
    fn test_rejects_invalid_current_range() {
        let header = BitmapHeader {
            current_range: 4,
            ..BitmapHeader::new()
        };
        let store = MemoryStore::from_bytes(raw_header(header));
        let result = CommitBitmap::open(store, BitmapStoreOptions::default());
        assert!(matches!(result, Err(WhdbError::BitmapFormat { .. })));
    }

    #[test]
    fn test_file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translog.whdb");
        let committed;
        let aborted;

        {
            let store = FileStore::open(&path).unwrap();
            let mut bitmap = CommitBitmap::open(store, BitmapStoreOptions::default()).unwrap();
            committed = bitmap.allocate_next_id().unwrap();
            aborted = bitmap.allocate_next_id().unwrap();
            bitmap.mark_prepared(committed).unwrap();
            bitmap.mark_committed(committed).unwrap();
            bitmap.mark_prepared(aborted).unwrap();
            bitmap.switch_to_next_range().unwrap();
            bitmap.allocate_next_id().unwrap();
        }

        assert_eq!(std::fs::metadata(&path).unwrap().len() % 4096, 0);

        let store = FileStore::open(&path).unwrap();
        let mut bitmap = CommitBitmap::open(store, BitmapStoreOptions::default()).unwrap();
        assert_eq!(bitmap.current_range(), RangeId::new(1));
        assert_eq!(bitmap.last_allocated(RangeId::new(0)), 2);
        assert_eq!(bitmap.last_allocated(RangeId::new(1)), 1);
        assert!(bitmap.read_bit(committed).unwrap());
        assert!(!bitmap.read_bit(aborted).unwrap());
        // Prepared state does not survive a reopen
        assert!(!bitmap.mark_committed(aborted).unwrap());
    }
}
