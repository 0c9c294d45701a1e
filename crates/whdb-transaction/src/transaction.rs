//! Scoped transaction handle.

use crate::id::TransactionId;
use crate::manager::{TransactionStateManager, TransactionStatus, VisibilityMode};
use tracing::warn;
use whdb_common::{Result, WhdbError};

/// Lifecycle state of an [`IdentifiedTransaction`].
///
/// ```text
/// Busy ──prepare──> PreparedUnresolved ──commit──> Committed
///   │                       │
///   │                       └──rollback──> RolledBack
///   └──drop──> RolledBackOnClose
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Busy,
    PreparedUnresolved,
    Committed,
    RolledBack,
    RolledBackOnClose,
}

impl TransactionState {
    /// Returns true once the outcome is decided.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::RolledBackOnClose
        )
    }
}

/// A handle owning one allocated transaction id.
///
/// Dropping the handle without committing rolls the transaction back and
/// releases every range reference it took.
pub struct IdentifiedTransaction<'a> {
    manager: &'a TransactionStateManager,
    id: TransactionId,
    state: TransactionState,
}

impl<'a> IdentifiedTransaction<'a> {
    pub(crate) fn new(manager: &'a TransactionStateManager, id: TransactionId) -> Self {
        Self {
            manager,
            id,
            state: TransactionState::Busy,
        }
    }

    /// Returns the transaction id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Reserves durable space for the commit record.
    ///
    /// Must precede [`IdentifiedTransaction::mark_transaction_committed`].
    /// Preparing twice is a no-op.
    pub fn prepare_for_write(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Busy => {
                self.manager.prepare(self.id)?;
                self.state = TransactionState::PreparedUnresolved;
                Ok(())
            }
            TransactionState::PreparedUnresolved => Ok(()),
            _ => Err(WhdbError::TransactionFinished { id: self.id.0 }),
        }
    }

    /// Commits a prepared transaction.
    ///
    /// A transaction that never prepared cannot commit: the call is logged
    /// and the transaction ends rolled back.
    pub fn mark_transaction_committed(&mut self) -> Result<()> {
        match self.state {
            TransactionState::PreparedUnresolved | TransactionState::Busy => {
                if self.manager.commit(self.id)? {
                    self.state = TransactionState::Committed;
                } else {
                    warn!(id = %self.id, "commit without prepare ignored, rolling back");
                    self.state = TransactionState::RolledBack;
                }
                Ok(())
            }
            TransactionState::Committed => Ok(()),
            _ => {
                warn!(id = %self.id, state = ?self.state, "commit of finished transaction ignored");
                Ok(())
            }
        }
    }

    /// Rolls the transaction back. Finished transactions are left as they are.
    pub fn rollback(&mut self) {
        if !self.state.is_finished() {
            self.manager.rollback(self.id);
            self.state = TransactionState::RolledBack;
        }
    }

    /// Status of `other` as seen by this transaction.
    pub fn visibility(
        &self,
        other: TransactionId,
        mode: VisibilityMode,
    ) -> Result<TransactionStatus> {
        self.manager.get_trans_visibility(self.id, other, mode)
    }
}

impl Drop for IdentifiedTransaction<'_> {
    fn drop(&mut self) {
        if !self.state.is_finished() {
            self.state = TransactionState::RolledBackOnClose;
        }
        self.manager.release(self.id);
    }
}

impl std::fmt::Debug for IdentifiedTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifiedTransaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}
