//! Transaction state manager.
//!
//! Owns the commit bitmap and the in-memory bookkeeping needed to answer
//! status and visibility queries:
//!
//! - live transactions (ids with an open [`IdentifiedTransaction`])
//! - per-range reference counts, which decide when a range stops being used
//! - per-range generations, which order ids from different ranges
//!
//! ```text
//!   range:      0 ──switch──> 1 ──switch──> 2 ──switch──> 3 ──switch──> 0 ...
//!   generation: 4             5             6             7             8
//! ```
//!
//! A range is used while it is current or any live transaction allocated in
//! it or queried into it. Outcomes in a used range are reported as `Local*`,
//! outcomes in ranges nobody references any more are final (`Global*`).

use crate::bitmap::{BitmapStoreOptions, CommitBitmap};
use crate::constants::RANGES_COUNT;
use crate::id::{RangeId, TransactionId};
use crate::store::{FileStore, MemoryStore, RandomAccessStore};
use crate::transaction::IdentifiedTransaction;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, info};
use whdb_common::{Result, StorageConfig, WhdbError};

/// Outcome of a transaction as seen by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Still running.
    Busy,
    /// Committed, range still in use.
    LocalCommitted,
    /// Rolled back, or not visible to the observer.
    LocalRolledBack,
    /// Committed, final.
    GlobalCommitted,
    /// Rolled back, final.
    GlobalRolledBack,
}

impl TransactionStatus {
    /// Returns true for both committed states.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::LocalCommitted | Self::GlobalCommitted)
    }

    /// Returns true for both rolled back states.
    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::LocalRolledBack | Self::GlobalRolledBack)
    }

    /// Returns true once the outcome can no longer change.
    pub fn is_global(&self) -> bool {
        matches!(self, Self::GlobalCommitted | Self::GlobalRolledBack)
    }

    fn from_bit(committed: bool, global: bool) -> Self {
        match (committed, global) {
            (true, true) => Self::GlobalCommitted,
            (false, true) => Self::GlobalRolledBack,
            (true, false) => Self::LocalCommitted,
            (false, false) => Self::LocalRolledBack,
        }
    }
}

/// How an observer treats transactions that overlapped with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisibilityMode {
    /// Transactions running when the observer began, and those that began
    /// later, stay invisible even after they commit.
    #[default]
    Snapshot,
    /// Overlapping transactions become visible once they commit.
    ReadCommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveOutcome {
    Running,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct LiveTransaction {
    /// Begin order among all transactions of this manager.
    seq: u64,
    /// Clock value at commit, on the same clock as `seq`.
    commit_seq: Option<u64>,
    outcome: LiveOutcome,
    /// Bit per range this transaction holds a reference on.
    referenced: u8,
}

/// Begin and commit clock values of a released transaction.
#[derive(Debug, Clone, Copy)]
struct CommitSpan {
    seq: u64,
    commit_seq: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RangeState {
    refcount: usize,
    /// Order in which the range became current.
    generation: u64,
    /// Last allocated local id when the range became current.
    generation_base: u32,
}

struct Inner {
    bitmap: CommitBitmap,
    ranges: [RangeState; RANGES_COUNT],
    live: HashMap<TransactionId, LiveTransaction>,
    /// Begin clock values of live transactions.
    live_seqs: BTreeSet<u64>,
    /// Committed and released transactions an older live snapshot may
    /// still have to hide.
    released_commits: HashMap<TransactionId, CommitSpan>,
    /// `released_commits` keys ordered by commit clock value.
    released_order: VecDeque<(u64, TransactionId)>,
    next_generation: u64,
    next_seq: u64,
}

impl Inner {
    fn is_range_used(&self, range: RangeId) -> bool {
        range == self.bitmap.current_range() || self.ranges[range.index()].refcount > 0
    }

    fn status(&mut self, id: TransactionId, horizon: TransactionId) -> Result<TransactionStatus> {
        if id == TransactionId::NEVER_COMMITTED {
            return Ok(TransactionStatus::GlobalRolledBack);
        }
        if id == TransactionId::ALWAYS_COMMITTED {
            return Ok(TransactionStatus::GlobalCommitted);
        }

        if id.range() == horizon.range() && id.local_offset() <= horizon.local_offset() {
            let committed = self.bitmap.read_bit(id)?;
            return Ok(TransactionStatus::from_bit(committed, true));
        }

        if let Some(live) = self.live.get(&id) {
            return Ok(match live.outcome {
                LiveOutcome::Running => TransactionStatus::Busy,
                LiveOutcome::Committed => TransactionStatus::LocalCommitted,
                LiveOutcome::RolledBack => TransactionStatus::LocalRolledBack,
            });
        }

        let committed = self.bitmap.read_bit(id)?;
        Ok(TransactionStatus::from_bit(
            committed,
            !self.is_range_used(id.range()),
        ))
    }

    /// Returns true if `other` began after `observer`.
    fn started_after(&self, other: TransactionId, observer: TransactionId) -> bool {
        if let (Some(o), Some(t)) = (self.live.get(&observer), self.live.get(&other)) {
            return t.seq > o.seq;
        }

        let (observer_range, other_range) = (observer.range(), other.range());
        if observer_range == other_range {
            return other.local_offset() > observer.local_offset();
        }
        let other_state = &self.ranges[other_range.index()];
        other_state.generation > self.ranges[observer_range.index()].generation
            && other.local_offset() > other_state.generation_base
    }

    /// Returns true if `other` was still running when `observer` began.
    fn running_at_begin(&self, other: TransactionId, observer: TransactionId) -> bool {
        let Some(observer_seq) = self.live.get(&observer).map(|live| live.seq) else {
            return false;
        };
        let span = match self.live.get(&other) {
            Some(live) => (live.seq, live.commit_seq),
            None => match self.released_commits.get(&other) {
                Some(span) => (span.seq, Some(span.commit_seq)),
                None => return false,
            },
        };
        match span {
            (seq, _) if seq > observer_seq => false,
            (_, Some(commit_seq)) => commit_seq > observer_seq,
            (_, None) => true,
        }
    }

    /// Drops released commits that no live transaction began before.
    fn prune_released_commits(&mut self) {
        let oldest = self.live_seqs.first().copied().unwrap_or(u64::MAX);
        while let Some(&(commit_seq, id)) = self.released_order.front() {
            if commit_seq > oldest {
                break;
            }
            self.released_order.pop_front();
            if self
                .released_commits
                .get(&id)
                .is_some_and(|span| span.commit_seq == commit_seq)
            {
                self.released_commits.remove(&id);
            }
        }
    }

    fn add_reference(&mut self, observer: TransactionId, range: RangeId) {
        let bit = 1u8 << range.index();
        if let Some(live) = self.live.get_mut(&observer) {
            if live.referenced & bit == 0 {
                live.referenced |= bit;
                self.ranges[range.index()].refcount += 1;
                debug!(observer = %observer, range = %range, "referenced transaction range");
            }
        }
    }
}

/// Assigns transaction ids, records outcomes and answers visibility queries.
///
/// All state lives behind one mutex; the manager can be shared between
/// threads and every [`IdentifiedTransaction`] borrows it.
pub struct TransactionStateManager {
    inner: Mutex<Inner>,
}

impl TransactionStateManager {
    /// Opens a manager over a commit bitmap store.
    pub fn open<S: RandomAccessStore + 'static>(
        store: S,
        options: BitmapStoreOptions,
    ) -> Result<Self> {
        let bitmap = CommitBitmap::open(store, options)?;

        // Walk backwards from the current range so it gets the newest generation
        let current = bitmap.current_range();
        let mut ranges = [RangeState::default(); RANGES_COUNT];
        let mut range = current;
        for age in 0..RANGES_COUNT {
            range = range.next();
            ranges[range.index()] = RangeState {
                refcount: 0,
                generation: age as u64 + 1,
                generation_base: bitmap.last_allocated(range),
            };
        }
        debug_assert_eq!(range, current);

        info!(current_range = %current, "opened transaction state");
        Ok(Self {
            inner: Mutex::new(Inner {
                bitmap,
                ranges,
                live: HashMap::new(),
                live_seqs: BTreeSet::new(),
                released_commits: HashMap::new(),
                released_order: VecDeque::new(),
                next_generation: RANGES_COUNT as u64 + 1,
                next_seq: 0,
            }),
        })
    }

    /// Opens the transaction file named by the storage configuration.
    pub fn open_with_config(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let store = FileStore::open(config.transaction_path())?;
        Self::open(
            store,
            BitmapStoreOptions {
                fsync_enabled: config.fsync_enabled,
            },
        )
    }

    /// Creates a manager that keeps its bitmap in memory.
    pub fn in_memory() -> Result<Self> {
        Self::open(
            MemoryStore::new(),
            BitmapStoreOptions {
                fsync_enabled: false,
            },
        )
    }

    /// Starts a transaction in the current range.
    pub fn begin(&self) -> Result<IdentifiedTransaction<'_>> {
        let mut inner = self.inner.lock();
        let id = inner.bitmap.allocate_next_id()?;
        let range = id.range();
        inner.ranges[range.index()].refcount += 1;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.live_seqs.insert(seq);
        inner.live.insert(
            id,
            LiveTransaction {
                seq,
                commit_seq: None,
                outcome: LiveOutcome::Running,
                referenced: 1 << range.index(),
            },
        );

        Ok(IdentifiedTransaction::new(self, id))
    }

    /// Status of `id`, treating ids at or below `horizon` as final.
    ///
    /// Pass [`TransactionId::NEVER_COMMITTED`] for no horizon.
    pub fn get_status(
        &self,
        id: TransactionId,
        horizon: TransactionId,
    ) -> Result<TransactionStatus> {
        self.inner.lock().status(id, horizon)
    }

    /// Status of `other` as seen by the live transaction `observer`.
    ///
    /// Looking into another range keeps that range in use until `observer`
    /// ends.
    pub fn get_trans_visibility(
        &self,
        observer: TransactionId,
        other: TransactionId,
        mode: VisibilityMode,
    ) -> Result<TransactionStatus> {
        if other == observer {
            return Ok(TransactionStatus::LocalCommitted);
        }

        let mut inner = self.inner.lock();
        if other.is_sentinel() {
            return inner.status(other, TransactionId::NEVER_COMMITTED);
        }
        if other.range() != observer.range() {
            inner.add_reference(observer, other.range());
        }

        let status = inner.status(other, TransactionId::NEVER_COMMITTED)?;
        if inner.started_after(other, observer)
            && (status == TransactionStatus::Busy || mode == VisibilityMode::Snapshot)
        {
            return Ok(TransactionStatus::LocalRolledBack);
        }
        if mode == VisibilityMode::Snapshot && inner.running_at_begin(other, observer) {
            return Ok(TransactionStatus::LocalRolledBack);
        }
        Ok(status)
    }

    /// Makes the next range current.
    ///
    /// Fails with [`WhdbError::RangeInUse`] while live transactions still
    /// reference the next range.
    pub fn switch_to_next_transaction_range(&self) -> Result<RangeId> {
        let mut inner = self.inner.lock();
        let next = inner.bitmap.current_range().next();
        if inner.ranges[next.index()].refcount > 0 {
            return Err(WhdbError::RangeInUse {
                range: next.as_u8(),
            });
        }

        inner.bitmap.switch_to_next_range()?;
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let generation_base = inner.bitmap.last_allocated(next);
        inner.ranges[next.index()].generation = generation;
        inner.ranges[next.index()].generation_base = generation_base;

        info!(range = %next, generation, generation_base, "transaction range is current");
        Ok(next)
    }

    /// Forgets every outcome recorded in `range`.
    ///
    /// # Panics
    ///
    /// Panics if the range is still in use.
    pub fn clear_range(&self, range: RangeId) -> Result<()> {
        let mut inner = self.inner.lock();
        assert!(
            !inner.is_range_used(range),
            "cannot clear transaction range {} while it is in use",
            range
        );
        inner.bitmap.clear_range(range)?;
        inner.released_commits.retain(|id, _| id.range() != range);
        Ok(())
    }

    /// Returns true while `range` is current or referenced.
    pub fn is_range_used(&self, range: RangeId) -> bool {
        self.inner.lock().is_range_used(range)
    }

    /// Returns the range new transactions are allocated from.
    pub fn current_range(&self) -> RangeId {
        self.inner.lock().bitmap.current_range()
    }

    /// Number of open transaction handles.
    pub fn live_transaction_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    // Transitions driven by IdentifiedTransaction

    pub(crate) fn prepare(&self, id: TransactionId) -> Result<()> {
        self.inner.lock().bitmap.mark_prepared(id)
    }

    /// Returns false if the commit was ignored because `id` never prepared.
    pub(crate) fn commit(&self, id: TransactionId) -> Result<bool> {
        let mut inner = self.inner.lock();
        let committed = inner.bitmap.mark_committed(id)?;
        let commit_seq = inner.next_seq;
        if let Some(live) = inner.live.get_mut(&id) {
            if committed {
                live.outcome = LiveOutcome::Committed;
                live.commit_seq = Some(commit_seq);
            } else {
                live.outcome = LiveOutcome::RolledBack;
            }
        }
        if committed {
            inner.next_seq += 1;
        }
        Ok(committed)
    }

    pub(crate) fn rollback(&self, id: TransactionId) {
        let mut inner = self.inner.lock();
        inner.bitmap.forget_prepared(id);
        if let Some(live) = inner.live.get_mut(&id) {
            live.outcome = LiveOutcome::RolledBack;
        }
        debug!(id = %id, "rolled back transaction");
    }

    /// Drops the live entry of `id` and every range reference it held.
    pub(crate) fn release(&self, id: TransactionId) {
        let mut inner = self.inner.lock();
        inner.bitmap.forget_prepared(id);
        let Some(live) = inner.live.remove(&id) else {
            return;
        };
        inner.live_seqs.remove(&live.seq);
        if let Some(commit_seq) = live.commit_seq {
            inner.released_commits.insert(
                id,
                CommitSpan {
                    seq: live.seq,
                    commit_seq,
                },
            );
            inner.released_order.push_back((commit_seq, id));
        }
        inner.prune_released_commits();
        for range in RangeId::all() {
            if live.referenced & (1 << range.index()) != 0 {
                let state = &mut inner.ranges[range.index()];
                debug_assert!(state.refcount > 0);
                state.refcount -= 1;
            }
        }
        debug!(id = %id, outcome = ?live.outcome, "released transaction");
    }
}
