//! Index block integration tests.
//!
//! Covers the properties the B-tree relies on:
//! - Entry order matches byte-wise key comparison, end-of-block is the maximum
//! - Fill accounting and byte-offset lookup stay exact under random edits
//! - Range copies preserve keys and ids
//! - Sorted inserts with block splits keep every key reachable in order
//! - Blocks survive a round trip through the block file

use bytes::Bytes;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use whdb_common::page::BlockId;
use whdb_storage::{
    BlockFile, BlockFileOptions, BlockPos, EOB_SIZE, Entry, EntryKey, IndexBlock, MAX_DATA_SIZE,
    MAX_FILL_SIZE,
};

fn data_entry(key: &[u8], record_id: u32, child: u32) -> Entry {
    Entry::encode_data(Bytes::copy_from_slice(key), record_id)
        .unwrap()
        .with_child_block_id(child)
}

/// Asserts the fill and offset lookup invariants for every byte offset.
fn check_layout<B: AsRef<[u8]>>(block: &IndexBlock<B>) {
    let sum: usize = block.iter().map(|e| e.encoded_len()).sum();
    assert_eq!(block.fill_size(), sum);
    assert!(block.fill_size() <= MAX_FILL_SIZE);
    assert!(block.entry(block.eob()).is_eob());
    block.validate().unwrap();

    for p in 0..=block.fill_size() {
        let it = block.iterator_at_pos(p);
        if it == block.end() {
            assert_eq!(p, block.fill_size());
            continue;
        }
        let before = block.byte_size_of_range(block.begin(), it);
        assert!(before <= p && p < before + block.entry(it).encoded_len());
    }
}

#[derive(Debug, Clone)]
enum Op {
    Insert { key: Vec<u8>, slot: usize },
    Delete { slot: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (proptest::collection::vec(any::<u8>(), 0..64), any::<usize>())
            .prop_map(|(key, slot)| Op::Insert { key, slot }),
        1 => any::<usize>().prop_map(|slot| Op::Delete { slot }),
    ]
}

proptest! {
    #[test]
    fn entry_order_matches_byte_order(
        a in proptest::collection::vec(any::<u8>(), 0..=MAX_DATA_SIZE),
        b in proptest::collection::vec(any::<u8>(), 0..=MAX_DATA_SIZE),
    ) {
        let ea = data_entry(&a, 1, 1);
        let eb = data_entry(&b, 2, 2);
        prop_assert_eq!(ea.cmp(&eb), a.cmp(&b));
        prop_assert_eq!(ea == eb, a == b);
        prop_assert!(ea < Entry::encode_eob(0));
        prop_assert!(eb < Entry::encode_eob(0));
    }

    #[test]
    fn random_edits_keep_layout_exact(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let mut block = IndexBlock::new_empty(5);
        let mut model: Vec<(Vec<u8>, u32)> = Vec::new();

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Insert { key, slot } => {
                    let entry = data_entry(&key, n as u32, 0);
                    if block.insert_possible(&entry) {
                        let pos = slot % (model.len() + 1);
                        block.insert_at(BlockPos(pos), &entry);
                        model.insert(pos, (key, n as u32));
                    }
                }
                Op::Delete { slot } => {
                    if !model.is_empty() {
                        let pos = slot % model.len();
                        block.delete_at(BlockPos(pos));
                        model.remove(pos);
                    }
                }
            }
        }

        check_layout(&block);
        let stored: Vec<(Vec<u8>, u32)> = block
            .range(block.begin(), block.eob())
            .map(|e| (e.data().to_vec(), e.record_id()))
            .collect();
        prop_assert_eq!(stored, model);
        prop_assert_eq!(block.entry(block.eob()).child_block_id(), 5);
    }

    #[test]
    fn insert_range_copies_whole_block(
        keys in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..60),
    ) {
        let mut src = IndexBlock::new_empty(1234);
        for (i, key) in keys.iter().enumerate() {
            let entry = data_entry(key, i as u32, 1000 + i as u32);
            if !src.insert_possible(&entry) {
                break;
            }
            src.insert_at(src.eob(), &entry);
        }

        let mut dst = IndexBlock::new_empty(0);
        dst.insert_range(dst.begin(), &src, src.begin(), src.end());

        prop_assert_eq!(dst.entry_count(), src.entry_count());
        prop_assert_eq!(dst.fill_size(), src.fill_size());
        for (copied, original) in dst.iter().zip(src.iter()) {
            prop_assert!(copied == original);
            prop_assert_eq!(copied.record_id(), original.record_id());
            prop_assert_eq!(copied.child_block_id(), original.child_block_id());
        }
    }
}

/// Inserts random keys in sorted position, splitting full blocks the way a
/// B-tree leaf level would.
#[test]
fn test_sorted_inserts_with_splits() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut blocks: Vec<IndexBlock<Vec<u8>>> = vec![IndexBlock::new_empty(u32::MAX)];
    let mut expected: Vec<Vec<u8>> = Vec::new();

    for record_id in 0..3000u32 {
        let len = rng.random_range(1..48);
        let key: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
        let entry = data_entry(&key, record_id, 0);

        // The target block is the first whose last key is not below the new key
        let target = blocks
            .iter()
            .position(|b| {
                b.is_empty() || b.entry(b.eob().prev()).key() >= EntryKey::Data(&key)
            })
            .unwrap_or(blocks.len() - 1);

        if !blocks[target].insert_possible(&entry) {
            let split = blocks[target].split_point();
            let mut right = IndexBlock::new_empty(0);
            let left = &mut blocks[target];
            right.insert_range(right.begin(), &*left, split, left.end());
            let eob = left.eob();
            left.delete_range(split, eob);
            left.set_child_block_id(left.eob(), target as u32 + 1);
            blocks.insert(target + 1, right);
            // Re-run placement against the split halves
            let block = if blocks[target].is_empty()
                || blocks[target].entry(blocks[target].eob().prev()).key()
                    >= EntryKey::Data(&key)
            {
                &mut blocks[target]
            } else {
                &mut blocks[target + 1]
            };
            let pos = block.lower_bound(EntryKey::Data(&key));
            block.insert_at(pos, &entry);
        } else {
            let block = &mut blocks[target];
            let pos = block.lower_bound(EntryKey::Data(&key));
            block.insert_at(pos, &entry);
        }
        expected.push(key);
    }

    expected.sort();
    let stored: Vec<Vec<u8>> = blocks
        .iter()
        .flat_map(|b| {
            b.range(b.begin(), b.eob())
                .map(|e| e.data().to_vec())
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(stored, expected);
    assert!(blocks.len() > 10);
    for block in &blocks {
        check_layout(block);
    }
    // Only the last block kept the original rightmost child
    assert_eq!(
        blocks.last().unwrap().entry(blocks.last().unwrap().eob()).child_block_id(),
        u32::MAX
    );
}

#[test]
fn test_random_delete_then_refill() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut block = IndexBlock::new_empty(0);

    let entry_for = |rng: &mut StdRng, id: u32| {
        let len = rng.random_range(0..=MAX_DATA_SIZE);
        data_entry(&vec![rng.random::<u8>(); len], id, id)
    };

    for round in 0..20u32 {
        loop {
            let entry = entry_for(&mut rng, round);
            if !block.insert_possible(&entry) {
                break;
            }
            let pos = rng.random_range(0..=block.eob().index());
            block.insert_at(BlockPos(pos), &entry);
        }
        check_layout(&block);

        let deletes = rng.random_range(1..=block.eob().index().max(1));
        for _ in 0..deletes {
            if block.is_empty() {
                break;
            }
            let pos = rng.random_range(0..block.eob().index());
            block.delete_at(BlockPos(pos));
        }
        check_layout(&block);
    }

    let eob = block.eob();
    block.delete_range(block.begin(), eob);
    assert!(block.is_empty());
    assert_eq!(block.fill_size(), EOB_SIZE);
}

#[test]
fn test_block_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.whdb");
    let mut ids = Vec::new();

    {
        let file = BlockFile::open(&path, BlockFileOptions::default()).unwrap();
        for b in 0..4u32 {
            let id = file.allocate_block(b + 100).unwrap();
            let mut block = file.read_index_block(id).unwrap();
            for i in 0..50u32 {
                let key = format!("block{}-key{:04}", b, i);
                block.insert_at(block.eob(), &data_entry(key.as_bytes(), i, b));
            }
            file.write_block(id, block.as_bytes()).unwrap();
            ids.push(id);
        }
        file.flush().unwrap();
    }

    let file = BlockFile::open(&path, BlockFileOptions::default()).unwrap();
    assert_eq!(file.num_blocks(), 4);
    for (b, id) in ids.into_iter().enumerate() {
        assert_eq!(id, BlockId(b as u32));
        let block = file.read_index_block(id).unwrap();
        assert_eq!(block.eob().index(), 50);
        assert_eq!(block.entry(block.eob()).child_block_id(), b as u32 + 100);
        let first = block.entry(block.begin());
        assert_eq!(first.data(), format!("block{}-key0000", b).as_bytes());
        check_layout(&block);
    }
}
