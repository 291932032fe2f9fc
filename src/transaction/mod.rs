use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;
use tracing::debug;

use crate::storage::buffer_manager::{BufferManager, BufferManagerError};

pub mod lock_table;

/// Opaque token identifying one transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(id: u64) -> TransactionId {
        TransactionId(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Lifecycle of a transaction. `Terminated` is terminal and always
/// implies every lock the transaction held has been released.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TxState {
    Active,
    Committing,
    Aborting,
    Terminated,
}

#[derive(Debug)]
pub enum TransactionError {
    /// Completion was requested for a transaction that is not active
    /// (unknown, already completing or already terminated).
    NotActive(TransactionId),
    Buffer(BufferManagerError),
}

impl Display for TransactionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionError::NotActive(tid) => {
                write!(f, "transaction {} is not active", tid)
            }
            TransactionError::Buffer(e) => write!(f, "{}", e),
        }
    }
}

impl Error for TransactionError {}

impl From<BufferManagerError> for TransactionError {
    fn from(e: BufferManagerError) -> Self {
        TransactionError::Buffer(e)
    }
}

/// Hands out transaction ids and drives the completion protocol.
/// Shared across worker threads behind an `Arc`.
pub struct TransactionManager {
    next_tid: AtomicU64,
    states: Mutex<HashMap<TransactionId, Arc<Atomic<TxState>>>>,
}

impl TransactionManager {
    pub fn new() -> TransactionManager {
        TransactionManager {
            next_tid: AtomicU64::new(0),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> TransactionId {
        let tid = TransactionId(self.next_tid.fetch_add(1, Ordering::SeqCst));
        self.states
            .lock()
            .insert(tid, Arc::new(Atomic::new(TxState::Active)));
        debug!(%tid, "transaction started");
        tid
    }

    pub fn state(&self, tid: TransactionId) -> Option<TxState> {
        self.states
            .lock()
            .get(&tid)
            .map(|s| s.load(Ordering::SeqCst))
    }

    pub fn commit(
        &self,
        tid: TransactionId,
        pool: &BufferManager,
    ) -> Result<(), TransactionError> {
        self.complete(tid, true, pool)
    }

    /// Aborts `tid`. This is also the mandatory follow-up whenever any
    /// lock acquisition of `tid` timed out: the whole transaction has
    /// to go, not just the failed call.
    pub fn abort(&self, tid: TransactionId, pool: &BufferManager) -> Result<(), TransactionError> {
        self.complete(tid, false, pool)
    }

    /// Drives `Active -> Committing/Aborting -> Terminated`. The
    /// transaction ends up `Terminated` with all locks released even
    /// when the commit/abort I/O fails partway; the error is still
    /// reported.
    pub fn complete(
        &self,
        tid: TransactionId,
        commit: bool,
        pool: &BufferManager,
    ) -> Result<(), TransactionError> {
        let state = self
            .states
            .lock()
            .get(&tid)
            .cloned()
            .ok_or(TransactionError::NotActive(tid))?;
        let target = if commit {
            TxState::Committing
        } else {
            TxState::Aborting
        };
        state
            .compare_exchange(TxState::Active, target, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TransactionError::NotActive(tid))?;

        let result = pool.transaction_complete(tid, commit);
        state.store(TxState::Terminated, Ordering::SeqCst);
        debug!(%tid, commit, ok = result.is_ok(), "transaction terminated");
        result.map_err(TransactionError::from)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
