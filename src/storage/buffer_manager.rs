use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::storage::heap_file::RecordId;
use crate::storage::log::LogManager;
use crate::storage::page::{empty_page_data, Page, PageId, TableIdType};
use crate::transaction::lock_table::{LockMode, LockTable};
use crate::transaction::TransactionId;

pub type PageType = Arc<RwLock<Page>>;
type PageTableType = std::collections::HashMap<PageId, PageType, RandomState>;

#[derive(Debug)]
pub enum BufferManagerError {
    /// A lock wait timed out. The transaction named here has to be
    /// aborted as a whole; retrying the single call is not enough.
    TransactionAborted(TransactionId),
    /// Every cached page is owned by an uncommitted transaction, so
    /// nothing can be evicted to make room.
    BufferExhausted,
    UnknownTable(TableIdType),
    Io(std::io::Error),
}

impl From<std::io::Error> for BufferManagerError {
    fn from(io_error: std::io::Error) -> Self {
        BufferManagerError::Io(io_error)
    }
}

impl Display for BufferManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferManagerError::TransactionAborted(tid) => {
                write!(f, "{} aborted (lock wait timed out)", tid)
            }
            BufferManagerError::BufferExhausted => {
                write!(f, "buffer exhausted: every cached page is dirty")
            }
            BufferManagerError::UnknownTable(table_id) => {
                write!(f, "no table registered under id {}", table_id)
            }
            BufferManagerError::Io(e) => write!(f, "storage i/o failed: {}", e),
        }
    }
}

impl Error for BufferManagerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BufferManagerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Bounded cache of pages keyed by [`PageId`], fronted by the lock
/// table: every page access acquires the page lock before the page
/// table is even consulted.
///
/// Eviction is no-steal: only pages without an owning transaction may
/// leave the cache, so an abort never has to undo anything on disk.
/// Commit forces redo records and keeps the data pages in memory
/// (log-then-lazy-data-flush).
///
/// Callers get an `Arc` handle for the duration of one operation and
/// must not hold on to it across transaction boundaries.
pub struct BufferManager {
    // Lock order: pagetable before any page latch. The loading path
    // performs storage I/O while holding the pagetable lock; that
    // serializes misses but keeps the capacity bound airtight.
    pagetable: Mutex<PageTableType>,
    catalog: Arc<Catalog>,
    log: Arc<dyn LogManager>,
    lock_table: Arc<LockTable>,
    capacity: usize,
}

impl BufferManager {
    pub fn new(
        catalog: Arc<Catalog>,
        log: Arc<dyn LogManager>,
        lock_table: Arc<LockTable>,
        capacity: usize,
    ) -> BufferManager {
        assert!(capacity > 0, "buffer capacity must be at least one page");
        BufferManager {
            pagetable: Mutex::new(PageTableType::default()),
            catalog,
            log,
            lock_table,
            capacity,
        }
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    /// Acquires the page lock in `mode`, then returns the cached page,
    /// loading (and evicting for room) on a miss. A timed-out lock
    /// wait surfaces as [`BufferManagerError::TransactionAborted`]; the
    /// caller is expected to abort `tid` entirely.
    pub fn get_page(
        &self,
        tid: TransactionId,
        pid: PageId,
        mode: LockMode,
    ) -> Result<PageType, BufferManagerError> {
        self.lock_table
            .acquire(tid, pid, mode)
            .map_err(|_| BufferManagerError::TransactionAborted(tid))?;

        let mut pagetable = self.pagetable.lock();
        if let Some(page) = pagetable.get(&pid) {
            return Ok(page.clone());
        }
        while pagetable.len() >= self.capacity {
            Self::evict_page(&mut pagetable)?;
        }
        let file = self
            .catalog
            .get_file(pid.table_id)
            .ok_or(BufferManagerError::UnknownTable(pid.table_id))?;
        let mut data = empty_page_data();
        // A failed read installs nothing.
        file.read_page(pid, &mut data)?;
        let page = Arc::new(RwLock::new(Page::new(pid, data)));
        pagetable.insert(pid, page.clone());
        Ok(page)
    }

    /// Inserts a record into `table_id` on behalf of `tid`. The table
    /// file performs the structural mutation (locking the pages it
    /// touches exclusively through [`get_page`](Self::get_page)) and
    /// reports every touched page; each one is marked dirty with `tid`
    /// as owner and (re)installed in the cache.
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        table_id: TableIdType,
        record: &[u8],
    ) -> Result<RecordId, BufferManagerError> {
        let file = self
            .catalog
            .get_file(table_id)
            .ok_or(BufferManagerError::UnknownTable(table_id))?;
        let (rid, touched) = file.insert_record(tid, self, record)?;
        self.install_dirty(tid, touched)?;
        Ok(rid)
    }

    /// Deletes the record at `rid` on behalf of `tid`. Same touched-page
    /// protocol as [`insert_tuple`](Self::insert_tuple).
    pub fn delete_tuple(&self, tid: TransactionId, rid: RecordId) -> Result<(), BufferManagerError> {
        let table_id = rid.page_id.table_id;
        let file = self
            .catalog
            .get_file(table_id)
            .ok_or(BufferManagerError::UnknownTable(table_id))?;
        let touched = file.delete_record(tid, self, rid)?;
        self.install_dirty(tid, touched)
    }

    fn install_dirty(
        &self,
        tid: TransactionId,
        touched: Vec<PageType>,
    ) -> Result<(), BufferManagerError> {
        let mut pagetable = self.pagetable.lock();
        for handle in touched {
            let pid = {
                let mut page = handle.write();
                page.mark_dirty(tid);
                page.id()
            };
            if !pagetable.contains_key(&pid) {
                while pagetable.len() >= self.capacity {
                    Self::evict_page(&mut pagetable)?;
                }
            }
            pagetable.insert(pid, handle);
        }
        Ok(())
    }

    /// No-steal eviction: drop any page without an owning transaction,
    /// in whatever order the table iterates. If everything is dirty the
    /// cache is exhausted.
    fn evict_page(pagetable: &mut PageTableType) -> Result<(), BufferManagerError> {
        let victim = pagetable
            .iter()
            .find(|(_, page)| !page.read().is_dirty())
            .map(|(pid, _)| *pid);
        match victim {
            Some(pid) => {
                pagetable.remove(&pid);
                debug!(%pid, "evicted clean page");
                Ok(())
            }
            None => {
                warn!("eviction failed: every cached page is dirty");
                Err(BufferManagerError::BufferExhausted)
            }
        }
    }

    /// Commit or abort `tid` at the cache level.
    ///
    /// Commit forces a redo record per owned page and clears ownership;
    /// the data pages are not written back. Abort throws away the
    /// cached copies and reloads them from durable storage. Locks are
    /// released in both outcomes, even when the I/O path fails partway.
    pub fn transaction_complete(
        &self,
        tid: TransactionId,
        commit: bool,
    ) -> Result<(), BufferManagerError> {
        let result = if commit {
            self.commit_pages(tid)
        } else {
            self.revert_pages(tid)
        };
        self.lock_table.release_all(tid);
        result
    }

    fn commit_pages(&self, tid: TransactionId) -> Result<(), BufferManagerError> {
        for handle in self.pages_owned_by(tid) {
            let mut page = handle.write();
            self.log
                .log_write(tid, page.id(), page.before_image(), page.data())?;
            self.log.force()?;
            page.set_before_image();
            page.mark_clean();
        }
        debug!(%tid, "commit complete");
        Ok(())
    }

    fn revert_pages(&self, tid: TransactionId) -> Result<(), BufferManagerError> {
        let owned: Vec<PageId> = self
            .pages_owned_by(tid)
            .into_iter()
            .map(|handle| handle.read().id())
            .collect();
        let mut result = Ok(());
        for pid in owned {
            // Every dirtied page gets reverted even if one reload
            // fails; the first error is reported.
            if let Err(e) = self.reload_page(pid) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        debug!(%tid, "rollback complete");
        result
    }

    /// Replaces the cached copy of `pid` with its durable content. The
    /// in-memory copy is dropped even when the re-read fails: an
    /// aborted transaction's writes must not stay observable.
    fn reload_page(&self, pid: PageId) -> Result<(), BufferManagerError> {
        let file = self
            .catalog
            .get_file(pid.table_id)
            .ok_or(BufferManagerError::UnknownTable(pid.table_id));
        let reread = file.and_then(|file| {
            let mut data = empty_page_data();
            file.read_page(pid, &mut data)?;
            Ok(data)
        });
        match reread {
            Ok(data) => {
                let page = Arc::new(RwLock::new(Page::new(pid, data)));
                self.pagetable.lock().insert(pid, page);
                Ok(())
            }
            Err(e) => {
                self.pagetable.lock().remove(&pid);
                Err(e)
            }
        }
    }

    fn pages_owned_by(&self, tid: TransactionId) -> Vec<PageType> {
        self.pagetable
            .lock()
            .values()
            .filter(|page| page.read().dirtier() == Some(tid))
            .cloned()
            .collect()
    }

    /// Forces the page's redo record, then writes the page itself.
    /// Clean or uncached pages are left alone. The dirty flag is only
    /// cleared once the data write has succeeded.
    pub fn flush_page(&self, pid: PageId) -> Result<(), BufferManagerError> {
        let handle = self.pagetable.lock().get(&pid).cloned();
        let Some(handle) = handle else {
            return Ok(());
        };
        let mut page = handle.write();
        let Some(dirtier) = page.dirtier() else {
            return Ok(());
        };
        // Log before data, always.
        self.log
            .log_write(dirtier, pid, page.before_image(), page.data())?;
        self.log.force()?;
        let file = self
            .catalog
            .get_file(pid.table_id)
            .ok_or(BufferManagerError::UnknownTable(pid.table_id))?;
        file.write_page(pid, page.data())?;
        page.set_before_image();
        page.mark_clean();
        debug!(%pid, "flushed page");
        Ok(())
    }

    /// Writes out every dirty page. Careless use breaks no-steal:
    /// uncommitted content reaches disk.
    pub fn flush_all_pages(&self) -> Result<(), BufferManagerError> {
        let pids: Vec<PageId> = self.pagetable.lock().keys().copied().collect();
        for pid in pids {
            self.flush_page(pid)?;
        }
        Ok(())
    }

    /// Writes out every page owned by `tid`.
    pub fn flush_pages(&self, tid: TransactionId) -> Result<(), BufferManagerError> {
        let pids: Vec<PageId> = self
            .pages_owned_by(tid)
            .into_iter()
            .map(|handle| handle.read().id())
            .collect();
        for pid in pids {
            self.flush_page(pid)?;
        }
        Ok(())
    }

    /// Unconditional cache removal for out-of-band maintenance paths.
    /// Bypasses the dirty check on purpose.
    pub fn discard_page(&self, pid: PageId) {
        self.pagetable.lock().remove(&pid);
    }

    /// Early lock release. Risky under two-phase locking; callers have
    /// to know why it is safe for their access pattern.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) {
        self.lock_table.release(tid, pid);
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.lock_table.holds(tid, pid)
    }

    // This is mainly a testing and debugging interface
    #[cfg(test)]
    pub(crate) fn cached_page_ids(&self) -> Vec<PageId> {
        self.pagetable.lock().keys().copied().collect()
    }
}
