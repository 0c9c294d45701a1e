//! Slotted index block over caller-provided memory.
//!
//! Page layout:
//! ```text
//! +---------------------------+ 0
//! | Block Header (8 bytes)    |  headers_size:2 | data_size:2 | reserved:4
//! +---------------------------+ 8
//! | Slot 0 (12 bytes)         |  data_offset:2 | data_len:2 | child:4 | record:4
//! | Slot 1                    |
//! | ...                       |  <- grows forward, one slot per entry, entry order
//! | EOB Slot (8 bytes)        |  0xFFFF:2 | 0:2 | child:4
//! +---------------------------+ headers_size
//! |        Free Space         |
//! +---------------------------+ data_end = BLOCK_SIZE - data_size
//! | Key Payload               |  <- grows backward from BLOCK_SIZE
//! +---------------------------+ BLOCK_SIZE
//! ```
//!
//! The block keeps entries in the order callers insert them; it arbitrates
//! layout only. Positions ([`BlockPos`]) are plain entry indexes and must be
//! re-resolved after every mutation.

use super::constants::{
    BLOCK_HEADER_SIZE, ENTRY_HEADER_SIZE, EOB_MARKER, EOB_SIZE, MAX_DATA_SIZE, MAX_FILL_SIZE,
    OFF_DATA_SIZE, OFF_HEADERS_SIZE, SLOT_CHILD, SLOT_DATA_LEN, SLOT_DATA_OFFSET, SLOT_RECORD,
};
use super::entry::{Entry, EntryKey, EntryRef};
use std::ops::{Add, Sub};
use whdb_common::page::BLOCK_SIZE;
use whdb_common::{Result, WhdbError};

/// Position of an entry within an index block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPos(pub usize);

impl BlockPos {
    /// Returns the entry index.
    pub fn index(&self) -> usize {
        self.0
    }

    /// Returns the following position.
    pub fn next(&self) -> Self {
        BlockPos(self.0 + 1)
    }

    /// Returns the preceding position.
    pub fn prev(&self) -> Self {
        BlockPos(self.0 - 1)
    }
}

impl Add<usize> for BlockPos {
    type Output = BlockPos;

    fn add(self, rhs: usize) -> BlockPos {
        BlockPos(self.0 + rhs)
    }
}

impl Sub<usize> for BlockPos {
    type Output = BlockPos;

    fn sub(self, rhs: usize) -> BlockPos {
        BlockPos(self.0 - rhs)
    }
}

impl Sub<BlockPos> for BlockPos {
    type Output = usize;

    fn sub(self, rhs: BlockPos) -> usize {
        self.0 - rhs.0
    }
}

impl std::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pos:{}", self.0)
    }
}

/// An index block view over a `BLOCK_SIZE` byte buffer.
///
/// The block never allocates or frees the buffer. Read operations need
/// `B: AsRef<[u8]>`, mutations additionally `B: AsMut<[u8]>`.
pub struct IndexBlock<B> {
    buf: B,
}

impl IndexBlock<Vec<u8>> {
    /// Creates an empty block backed by a fresh heap buffer.
    pub fn new_empty(default_child_id: u32) -> Self {
        let mut block = Self {
            buf: vec![0u8; BLOCK_SIZE],
        };
        block.construct_empty_block(default_child_id);
        block
    }
}

impl<B: AsRef<[u8]>> IndexBlock<B> {
    /// Wraps a buffer of exactly `BLOCK_SIZE` bytes.
    ///
    /// The contents are not checked; call [`IndexBlock::validate`] for blocks
    /// read from disk or [`IndexBlock::construct_empty_block`] for new ones.
    pub fn new(buf: B) -> Result<Self> {
        let actual = buf.as_ref().len();
        if actual != BLOCK_SIZE {
            return Err(WhdbError::PageSizeMismatch {
                expected: BLOCK_SIZE,
                actual,
            });
        }
        Ok(Self { buf })
    }

    /// Returns the raw block bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Releases the backing buffer.
    pub fn into_inner(self) -> B {
        self.buf
    }

    #[inline]
    fn read_u16(&self, offset: usize) -> u16 {
        let data = self.buf.as_ref();
        u16::from_le_bytes([data[offset], data[offset + 1]])
    }

    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        let data = self.buf.as_ref();
        u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ])
    }

    #[inline]
    fn slot_offset(pos: BlockPos) -> usize {
        BLOCK_HEADER_SIZE + pos.0 * ENTRY_HEADER_SIZE
    }

    /// Bytes used by the block header and all entry header slots.
    pub fn headers_size(&self) -> usize {
        self.read_u16(OFF_HEADERS_SIZE) as usize
    }

    /// Bytes used by key payload.
    pub fn data_size(&self) -> usize {
        self.read_u16(OFF_DATA_SIZE) as usize
    }

    /// Offset of the lowest payload byte.
    pub fn data_end(&self) -> usize {
        BLOCK_SIZE.saturating_sub(self.data_size())
    }

    fn data_entry_count(&self) -> usize {
        self.headers_size()
            .saturating_sub(BLOCK_HEADER_SIZE + EOB_SIZE)
            / ENTRY_HEADER_SIZE
    }

    /// Number of entries including the end-of-block entry.
    pub fn entry_count(&self) -> usize {
        self.data_entry_count() + 1
    }

    /// Returns true if the block holds no data entries.
    pub fn is_empty(&self) -> bool {
        self.data_entry_count() == 0
    }

    /// Position of the first entry (equals `eob()` for an empty block).
    pub fn begin(&self) -> BlockPos {
        BlockPos(0)
    }

    /// Position of the end-of-block entry.
    pub fn eob(&self) -> BlockPos {
        BlockPos(self.data_entry_count())
    }

    /// Position one past the end-of-block entry.
    pub fn end(&self) -> BlockPos {
        BlockPos(self.data_entry_count() + 1)
    }

    /// Decodes the entry at `pos`.
    pub fn entry(&self, pos: BlockPos) -> EntryRef<'_> {
        let eob = self.eob();
        assert!(pos <= eob, "entry position {} out of range (eob at {})", pos, eob);

        let slot = Self::slot_offset(pos);
        if pos == eob {
            return EntryRef::eob_entry(self.read_u32(slot + SLOT_CHILD));
        }

        let offset = self.read_u16(slot + SLOT_DATA_OFFSET) as usize;
        let len = self.read_u16(slot + SLOT_DATA_LEN) as usize;
        EntryRef::data_entry(
            &self.buf.as_ref()[offset..offset + len],
            self.read_u32(slot + SLOT_CHILD),
            self.read_u32(slot + SLOT_RECORD),
        )
    }

    /// Encoded length of the entry at `pos` without decoding its key.
    fn encoded_len_at(&self, pos: BlockPos) -> usize {
        if pos == self.eob() {
            EOB_SIZE
        } else {
            ENTRY_HEADER_SIZE + self.read_u16(Self::slot_offset(pos) + SLOT_DATA_LEN) as usize
        }
    }

    /// Iterates over all entries including the end-of-block entry.
    pub fn iter(&self) -> Entries<'_, B> {
        self.range(self.begin(), self.end())
    }

    /// Iterates over the entries in `[begin, end)`.
    pub fn range(&self, begin: BlockPos, end: BlockPos) -> Entries<'_, B> {
        assert!(begin <= end && end <= self.end(), "invalid range {}..{}", begin, end);
        Entries {
            block: self,
            front: begin.0,
            back: end.0,
        }
    }

    /// Copies the entries in `[begin, end)` out of the block.
    pub fn entries(&self, begin: BlockPos, end: BlockPos) -> Vec<Entry> {
        self.range(begin, end).map(|e| e.to_entry()).collect()
    }

    /// Total bytes consumed by all entries, including the end-of-block entry.
    pub fn fill_size(&self) -> usize {
        (self.headers_size() + self.data_size()).saturating_sub(BLOCK_HEADER_SIZE)
    }

    /// Bytes still available for new entries.
    pub fn free_space(&self) -> usize {
        MAX_FILL_SIZE.saturating_sub(self.fill_size())
    }

    /// Returns true if `entry` would fit into this block.
    pub fn insert_possible(&self, entry: &Entry) -> bool {
        self.fill_size() + entry.encoded_len() <= MAX_FILL_SIZE
    }

    /// Sum of the encoded lengths of the entries in `[begin, end)`.
    pub fn byte_size_of_range(&self, begin: BlockPos, end: BlockPos) -> usize {
        assert!(begin <= end && end <= self.end(), "invalid range {}..{}", begin, end);
        (begin.0..end.0)
            .map(|i| self.encoded_len_at(BlockPos(i)))
            .sum()
    }

    /// Locates the entry whose footprint contains the cumulative byte offset
    /// `byte_offset`, counted from `begin()`.
    ///
    /// Offsets at or beyond `fill_size()` resolve to `end()`.
    pub fn iterator_at_pos(&self, byte_offset: usize) -> BlockPos {
        let mut consumed = 0;
        for i in 0..self.end().0 {
            let pos = BlockPos(i);
            consumed += self.encoded_len_at(pos);
            if byte_offset < consumed {
                return pos;
            }
        }
        self.end()
    }

    /// First position whose entry is not less than `key`.
    ///
    /// Assumes the caller kept the block sorted; never returns past `eob()`.
    pub fn lower_bound(&self, key: EntryKey<'_>) -> BlockPos {
        let mut low = 0usize;
        let mut high = self.eob().0;

        while low < high {
            let mid = low + (high - low) / 2;
            if self.entry(BlockPos(mid)).key() < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        BlockPos(low)
    }

    /// Position that splits the data entries into two halves by bytes.
    ///
    /// The entries in `[begin(), split_point())` hold at least half of the
    /// data entry bytes. Returns `eob()` for blocks with fewer than two entries.
    pub fn split_point(&self) -> BlockPos {
        let eob = self.eob();
        if eob.0 < 2 {
            return eob;
        }

        let total = self.byte_size_of_range(self.begin(), eob);
        let mut consumed = 0;
        for i in 0..eob.0 - 1 {
            consumed += self.encoded_len_at(BlockPos(i));
            if consumed * 2 >= total {
                return BlockPos(i + 1);
            }
        }
        eob.prev()
    }

    /// Checks the structural invariants of a block read from storage.
    pub fn validate(&self) -> Result<()> {
        let headers_size = self.headers_size();
        let data_size = self.data_size();

        if headers_size < BLOCK_HEADER_SIZE + EOB_SIZE
            || (headers_size - BLOCK_HEADER_SIZE - EOB_SIZE) % ENTRY_HEADER_SIZE != 0
        {
            return Err(corrupted(format!("invalid headers size {}", headers_size)));
        }
        if headers_size + data_size > BLOCK_SIZE {
            return Err(corrupted(format!(
                "headers ({}) and payload ({}) overlap",
                headers_size, data_size
            )));
        }

        let eob = self.eob();
        if self.read_u16(Self::slot_offset(eob) + SLOT_DATA_OFFSET) != EOB_MARKER {
            return Err(corrupted("last slot is not an end-of-block entry".to_string()));
        }

        let data_end = self.data_end();
        let mut extents = Vec::with_capacity(eob.0);
        for i in 0..eob.0 {
            let slot = Self::slot_offset(BlockPos(i));
            let offset = self.read_u16(slot + SLOT_DATA_OFFSET);
            let len = self.read_u16(slot + SLOT_DATA_LEN) as usize;

            if offset == EOB_MARKER {
                return Err(corrupted(format!("end-of-block marker in slot {}", i)));
            }
            if len > MAX_DATA_SIZE {
                return Err(corrupted(format!("slot {} key length {} too large", i, len)));
            }
            let offset = offset as usize;
            if offset < data_end || offset + len > BLOCK_SIZE {
                return Err(corrupted(format!(
                    "slot {} payload {}..{} outside {}..{}",
                    i,
                    offset,
                    offset + len,
                    data_end,
                    BLOCK_SIZE
                )));
            }
            if len > 0 {
                extents.push((offset, len));
            }
        }

        extents.sort_unstable();
        let mut covered = 0;
        let mut last_end = data_end;
        for (offset, len) in extents {
            if offset < last_end {
                return Err(corrupted(format!("payload at {} overlaps", offset)));
            }
            last_end = offset + len;
            covered += len;
        }
        if covered != data_size {
            return Err(corrupted(format!(
                "payload size {} does not match header {}",
                covered, data_size
            )));
        }

        Ok(())
    }
}

fn corrupted(reason: String) -> WhdbError {
    WhdbError::IndexBlockCorrupted(reason)
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> IndexBlock<B> {
    #[inline]
    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf.as_mut()[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, offset: usize, value: u32) {
        self.buf.as_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn set_sizes(&mut self, headers_size: usize, data_size: usize) {
        self.write_u16(OFF_HEADERS_SIZE, headers_size as u16);
        self.write_u16(OFF_DATA_SIZE, data_size as u16);
    }

    /// Resets the block to a single end-of-block entry.
    ///
    /// Overwrites the whole header area; payload bytes are zeroed as well.
    pub fn construct_empty_block(&mut self, default_child_id: u32) {
        self.buf.as_mut().fill(0);
        self.set_sizes(BLOCK_HEADER_SIZE + EOB_SIZE, 0);

        let slot = Self::slot_offset(BlockPos(0));
        self.write_u16(slot + SLOT_DATA_OFFSET, EOB_MARKER);
        self.write_u16(slot + SLOT_DATA_LEN, 0);
        self.write_u32(slot + SLOT_CHILD, default_child_id);
    }

    /// Overwrites the child pointer of the entry at `pos`.
    pub fn set_child_block_id(&mut self, pos: BlockPos, child_block_id: u32) {
        assert!(pos <= self.eob(), "entry position {} out of range", pos);
        self.write_u32(Self::slot_offset(pos) + SLOT_CHILD, child_block_id);
    }

    /// Inserts a copy of `entry` immediately before `pos`.
    ///
    /// # Panics
    ///
    /// Panics if the entry does not fit (check [`IndexBlock::insert_possible`]
    /// first), if `entry` is an end-of-block entry or if `pos` is past `eob()`.
    pub fn insert_at(&mut self, pos: BlockPos, entry: &Entry) {
        match entry {
            Entry::Data {
                data,
                child_block_id,
                record_id,
            } => self.insert_raw(pos, data, *child_block_id, *record_id),
            Entry::Eob { .. } => panic!("cannot insert a second end-of-block entry"),
        }
    }

    /// Inserts a copy of `entry` before `pos` with its child pointer replaced.
    pub fn insert_at_with_id(&mut self, pos: BlockPos, entry: &Entry, child_block_id: u32) {
        match entry {
            Entry::Data {
                data, record_id, ..
            } => self.insert_raw(pos, data, child_block_id, *record_id),
            Entry::Eob { .. } => panic!("cannot insert a second end-of-block entry"),
        }
    }

    fn insert_raw(&mut self, pos: BlockPos, data: &[u8], child_block_id: u32, record_id: u32) {
        let eob = self.eob();
        assert!(pos <= eob, "insert position {} past end-of-block {}", pos, eob);
        assert!(
            data.len() <= MAX_DATA_SIZE,
            "key of {} bytes exceeds {}",
            data.len(),
            MAX_DATA_SIZE
        );

        let needed = ENTRY_HEADER_SIZE + data.len();
        let fill = self.fill_size();
        assert!(
            fill + needed <= MAX_FILL_SIZE,
            "index block overflow: {} bytes used, {} needed",
            fill,
            needed
        );

        let headers_size = self.headers_size();
        let data_size = self.data_size();
        let data_end = BLOCK_SIZE - data_size;
        let new_data_end = data_end - data.len();
        let slot = Self::slot_offset(pos);

        let bytes = self.buf.as_mut();
        bytes[new_data_end..data_end].copy_from_slice(data);
        bytes.copy_within(slot..headers_size, slot + ENTRY_HEADER_SIZE);

        self.write_u16(slot + SLOT_DATA_OFFSET, new_data_end as u16);
        self.write_u16(slot + SLOT_DATA_LEN, data.len() as u16);
        self.write_u32(slot + SLOT_CHILD, child_block_id);
        self.write_u32(slot + SLOT_RECORD, record_id);
        self.set_sizes(headers_size + ENTRY_HEADER_SIZE, data_size + data.len());
    }

    /// Inserts a run of owned entries before `pos`, preserving their order.
    ///
    /// An end-of-block entry may only appear last in the run and only when
    /// `pos == eob()`; its child pointer then replaces this block's
    /// end-of-block child.
    pub fn insert_entries(&mut self, pos: BlockPos, entries: &[Entry]) {
        let mut pos = pos;
        for (i, entry) in entries.iter().enumerate() {
            match entry {
                Entry::Data {
                    data,
                    child_block_id,
                    record_id,
                } => {
                    self.insert_raw(pos, data, *child_block_id, *record_id);
                    pos = pos.next();
                }
                Entry::Eob { child_block_id } => {
                    assert!(i + 1 == entries.len(), "end-of-block entry must end the run");
                    self.take_eob_child(pos, *child_block_id);
                }
            }
        }
    }

    /// Copies the entries `[src_begin, src_end)` of `src` before `pos`.
    ///
    /// Keys, record ids and child pointers are preserved. If the source range
    /// contains the source end-of-block entry, its child pointer replaces this
    /// block's end-of-block child, which requires `pos == eob()`.
    pub fn insert_range<S: AsRef<[u8]>>(
        &mut self,
        pos: BlockPos,
        src: &IndexBlock<S>,
        src_begin: BlockPos,
        src_end: BlockPos,
    ) {
        let mut pos = pos;
        for entry in src.range(src_begin, src_end) {
            if entry.is_eob() {
                self.take_eob_child(pos, entry.child_block_id());
            } else {
                self.insert_raw(pos, entry.data(), entry.child_block_id(), entry.record_id());
                pos = pos.next();
            }
        }
    }

    fn take_eob_child(&mut self, pos: BlockPos, child_block_id: u32) {
        let eob = self.eob();
        assert!(
            pos == eob,
            "end-of-block entry copied to {} instead of {}",
            pos,
            eob
        );
        self.set_child_block_id(eob, child_block_id);
    }

    /// Removes the data entry at `pos`, compacting slots and payload.
    ///
    /// # Panics
    ///
    /// Panics if `pos` is the end-of-block entry or beyond it.
    pub fn delete_at(&mut self, pos: BlockPos) {
        let eob = self.eob();
        assert!(pos < eob, "cannot delete {} (end-of-block at {})", pos, eob);

        let headers_size = self.headers_size();
        let data_size = self.data_size();
        let data_end = BLOCK_SIZE - data_size;
        let slot = Self::slot_offset(pos);
        let offset = self.read_u16(slot + SLOT_DATA_OFFSET) as usize;
        let len = self.read_u16(slot + SLOT_DATA_LEN) as usize;

        if len > 0 {
            // Close the payload gap and move every payload that sat below it.
            // Empty payloads at the deleted offset move too so that every
            // offset stays inside the payload area.
            self.buf
                .as_mut()
                .copy_within(data_end..offset, data_end + len);
            for i in 0..eob.0 {
                if i == pos.0 {
                    continue;
                }
                let other = Self::slot_offset(BlockPos(i));
                let other_offset = self.read_u16(other + SLOT_DATA_OFFSET) as usize;
                let other_len = self.read_u16(other + SLOT_DATA_LEN);
                if other_offset < offset || (other_offset == offset && other_len == 0) {
                    self.write_u16(other + SLOT_DATA_OFFSET, (other_offset + len) as u16);
                }
            }
        }

        let bytes = self.buf.as_mut();
        bytes.copy_within(slot + ENTRY_HEADER_SIZE..headers_size, slot);
        bytes[headers_size - ENTRY_HEADER_SIZE..headers_size].fill(0);
        bytes[data_end..data_end + len].fill(0);

        self.set_sizes(headers_size - ENTRY_HEADER_SIZE, data_size - len);
    }

    /// Removes the data entries in `[begin, end)`.
    pub fn delete_range(&mut self, begin: BlockPos, end: BlockPos) {
        assert!(
            begin <= end && end <= self.eob(),
            "cannot delete range {}..{} (end-of-block at {})",
            begin,
            end,
            self.eob()
        );
        for _ in begin.0..end.0 {
            self.delete_at(begin);
        }
    }
}

/// Iterator over the entries of an index block.
pub struct Entries<'a, B> {
    block: &'a IndexBlock<B>,
    front: usize,
    back: usize,
}

impl<'a, B: AsRef<[u8]>> Iterator for Entries<'a, B> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let entry = self.block.entry(BlockPos(self.front));
        self.front += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<B: AsRef<[u8]>> DoubleEndedIterator for Entries<'_, B> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.block.entry(BlockPos(self.back)))
    }
}

impl<B: AsRef<[u8]>> ExactSizeIterator for Entries<'_, B> {}

impl<'a, B: AsRef<[u8]>> IntoIterator for &'a IndexBlock<B> {
    type Item = EntryRef<'a>;
    type IntoIter = Entries<'a, B>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
