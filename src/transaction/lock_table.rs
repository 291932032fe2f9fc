use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::thread;
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::DbConfig;
use crate::storage::page::PageId;
use crate::transaction::TransactionId;

type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub enum LockError {
    /// The wait budget elapsed without a grant. Taken as evidence of a
    /// deadlock; the owning transaction has to be aborted as a whole.
    Timeout { tid: TransactionId, pid: PageId },
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Timeout { tid, pid } => {
                write!(f, "{} timed out waiting for a lock on page {}", tid, pid)
            }
        }
    }
}

impl Error for LockError {}

/// Holder state of one page: a set of shared holders xor a single
/// exclusive holder. The representation makes invariant violations
/// (shared and exclusive at once) unconstructible.
#[derive(Debug)]
enum PageLock {
    Shared(HashSet<TransactionId>),
    Exclusive(TransactionId),
}

#[derive(Default)]
struct LockState {
    page_locks: HashMap<PageId, PageLock>,
    tx_locks: HashMap<TransactionId, HashSet<PageId>>,
}

impl LockState {
    /// True if `tid` already holds `pid` at `mode` or stronger.
    fn holds_at_least(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> bool {
        match self.page_locks.get(&pid) {
            Some(PageLock::Exclusive(holder)) => *holder == tid,
            Some(PageLock::Shared(holders)) => {
                mode == LockMode::Shared && holders.contains(&tid)
            }
            None => false,
        }
    }

    fn can_acquire(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> bool {
        if self.holds_at_least(tid, pid, mode) {
            return true;
        }
        match self.page_locks.get(&pid) {
            None => true,
            Some(PageLock::Shared(holders)) => match mode {
                LockMode::Shared => true,
                // In-place upgrade: the sole shared holder may take the
                // exclusive lock without releasing first.
                LockMode::Exclusive => holders.len() == 1 && holders.contains(&tid),
            },
            // holder == tid was already covered by holds_at_least
            Some(PageLock::Exclusive(_)) => false,
        }
    }

    /// Record the grant. Only called when `can_acquire` held and the
    /// lock is not already held at `mode` or stronger.
    fn grant(&mut self, tid: TransactionId, pid: PageId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                match self
                    .page_locks
                    .entry(pid)
                    .or_insert_with(|| PageLock::Shared(HashSet::new()))
                {
                    PageLock::Shared(holders) => {
                        holders.insert(tid);
                    }
                    PageLock::Exclusive(_) => unreachable!("grant of shared over foreign exclusive"),
                }
            }
            LockMode::Exclusive => {
                // Covers the unlocked page as well as the upgrade from
                // a sole shared holding.
                self.page_locks.insert(pid, PageLock::Exclusive(tid));
            }
        }
        self.tx_locks.entry(tid).or_default().insert(pid);
    }

    fn remove_holder(&mut self, tid: TransactionId, pid: PageId) {
        match self.page_locks.get_mut(&pid) {
            Some(PageLock::Shared(holders)) => {
                holders.remove(&tid);
                if holders.is_empty() {
                    self.page_locks.remove(&pid);
                }
            }
            Some(PageLock::Exclusive(holder)) if *holder == tid => {
                self.page_locks.remove(&pid);
            }
            _ => {}
        }
    }

    fn release(&mut self, tid: TransactionId, pid: PageId) {
        let held = match self.tx_locks.get_mut(&tid) {
            Some(pids) => {
                let removed = pids.remove(&pid);
                if pids.is_empty() {
                    self.tx_locks.remove(&tid);
                }
                removed
            }
            None => false,
        };
        if held {
            self.remove_holder(tid, pid);
        }
    }

    fn release_all(&mut self, tid: TransactionId) {
        if let Some(pids) = self.tx_locks.remove(&tid) {
            for pid in pids {
                self.remove_holder(tid, pid);
            }
        }
    }
}

/// Page-granularity lock table implementing strict two-phase locking.
///
/// Blocked acquisitions poll for grantability instead of queueing:
/// there is no fairness among waiters, and a wait that exceeds the
/// configured budget fails with [`LockError::Timeout`], which the
/// caller must answer by aborting the whole transaction. The table
/// never aborts anyone on its own.
pub struct LockTable {
    state: Mutex<LockState>,
    poll_interval: Duration,
    timeout: Duration,
}

impl LockTable {
    pub fn new(config: &DbConfig) -> LockTable {
        Self::with_timing(config.lock_poll, config.lock_timeout)
    }

    pub fn with_timing(poll_interval: Duration, timeout: Duration) -> LockTable {
        LockTable {
            state: Mutex::new(LockState::default()),
            poll_interval,
            timeout,
        }
    }

    /// Blocks until the lock is granted or the wait budget runs out.
    /// Re-acquiring a lock already held at `mode` or stronger returns
    /// immediately and leaves the table unchanged.
    pub fn acquire(
        &self,
        tid: TransactionId,
        pid: PageId,
        mode: LockMode,
    ) -> Result<(), LockError> {
        let start = Instant::now();
        loop {
            {
                let mut state = self.state.lock();
                if state.holds_at_least(tid, pid, mode) {
                    return Ok(());
                }
                if state.can_acquire(tid, pid, mode) {
                    state.grant(tid, pid, mode);
                    return Ok(());
                }
            }
            if start.elapsed() >= self.timeout {
                warn!(%tid, %pid, ?mode, "lock wait budget exhausted, suspecting deadlock");
                return Err(LockError::Timeout { tid, pid });
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Idempotent; releasing a lock that is not held does nothing.
    pub fn release(&self, tid: TransactionId, pid: PageId) {
        self.state.lock().release(tid, pid);
    }

    pub fn release_all(&self, tid: TransactionId) {
        self.state.lock().release_all(tid);
    }

    /// True if `tid` holds `pid` in any mode.
    pub fn holds(&self, tid: TransactionId, pid: PageId) -> bool {
        self.state
            .lock()
            .tx_locks
            .get(&tid)
            .map(|pids| pids.contains(&pid))
            .unwrap_or(false)
    }

    /// True if `tid` holds `pid` at `mode` or stronger.
    pub fn holds_mode(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> bool {
        self.state.lock().holds_at_least(tid, pid, mode)
    }

    /// Checks that the per-page and per-transaction views agree.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.state.lock();
        for (pid, lock) in state.page_locks.iter() {
            let holders: Vec<TransactionId> = match lock {
                PageLock::Shared(holders) => {
                    assert!(!holders.is_empty(), "empty shared holder set for {}", pid);
                    holders.iter().copied().collect()
                }
                PageLock::Exclusive(holder) => vec![*holder],
            };
            for tid in holders {
                assert!(
                    state.tx_locks.get(&tid).is_some_and(|p| p.contains(pid)),
                    "{} holds {} but the transaction view disagrees",
                    tid,
                    pid
                );
            }
        }
        for (tid, pids) in state.tx_locks.iter() {
            for pid in pids {
                let held = match state.page_locks.get(pid) {
                    Some(PageLock::Shared(holders)) => holders.contains(tid),
                    Some(PageLock::Exclusive(holder)) => holder == tid,
                    None => false,
                };
                assert!(held, "{} listed for {} but the page view disagrees", tid, pid);
            }
        }
    }
}
