use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bitvec::order::Lsb0;
use bitvec::slice::BitSlice;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;

use crate::storage::buffer_manager::{BufferManager, BufferManagerError, PageType};
use crate::storage::page::{Page, PageId, TableIdType, PAGE_SIZE};
use crate::transaction::lock_table::LockMode;
use crate::transaction::TransactionId;

/// Address of one record: the page holding it and the slot within.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: u16,
}

/// Storage collaborator for one table. `read_page`/`write_page`/
/// `num_pages` are the durable page store; `insert_record` and
/// `delete_record` perform structural mutations through the buffer
/// manager (taking exclusive page locks on the way) and report every
/// page they touched so the cache can mark and install them.
#[cfg_attr(test, automock)]
pub trait DbFile: Send + Sync {
    fn table_id(&self) -> TableIdType;
    fn read_page(&self, pid: PageId, buf: &mut [u8]) -> io::Result<()>;
    fn write_page(&self, pid: PageId, buf: &[u8]) -> io::Result<()>;
    fn num_pages(&self) -> io::Result<u64>;
    fn insert_record(
        &self,
        tid: TransactionId,
        pool: &BufferManager,
        record: &[u8],
    ) -> Result<(RecordId, Vec<PageType>), BufferManagerError>;
    fn delete_record(
        &self,
        tid: TransactionId,
        pool: &BufferManager,
        rid: RecordId,
    ) -> Result<Vec<PageType>, BufferManagerError>;
}

/// File of fixed-length records. Each page starts with an occupancy
/// bitmap followed by the record slots; a page of `record_len`-byte
/// records fits `floor(PAGE_SIZE * 8 / (record_len * 8 + 1))` of them,
/// one extra bit per record paying for the bitmap.
pub struct HeapFile {
    table_id: TableIdType,
    file: Mutex<File>,
    record_len: usize,
    slots_per_page: usize,
    header_bytes: usize,
}

impl HeapFile {
    pub fn open<P: AsRef<Path>>(
        table_id: TableIdType,
        path: P,
        record_len: usize,
    ) -> io::Result<HeapFile> {
        let slots_per_page = (PAGE_SIZE * 8) / (record_len * 8 + 1);
        if record_len == 0 || slots_per_page == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record length {} does not fit a page", record_len),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(HeapFile {
            table_id,
            file: Mutex::new(file),
            record_len,
            slots_per_page,
            header_bytes: (slots_per_page + 7) / 8,
        })
    }

    pub fn slots_per_page(&self) -> usize {
        self.slots_per_page
    }

    fn record_offset(&self, slot: u16) -> usize {
        self.header_bytes + slot as usize * self.record_len
    }

    fn find_free_slot(&self, page: &Page) -> Option<u16> {
        let bits = BitSlice::<u8, Lsb0>::from_slice(&page.data()[..self.header_bytes]);
        bits[..self.slots_per_page]
            .iter()
            .position(|bit| !*bit)
            .map(|slot| slot as u16)
    }

    fn slot_used(&self, page: &Page, slot: u16) -> bool {
        let bits = BitSlice::<u8, Lsb0>::from_slice(&page.data()[..self.header_bytes]);
        bits[slot as usize]
    }

    fn set_slot_used(&self, page: &mut Page, slot: u16, used: bool) {
        let header = &mut page.data_mut()[..self.header_bytes];
        let bits = BitSlice::<u8, Lsb0>::from_slice_mut(header);
        bits.set(slot as usize, used);
    }

    /// Extends the file by one zeroed page and returns its number.
    /// Serialized on the file handle so concurrent extenders get
    /// distinct pages.
    fn append_empty_page(&self) -> io::Result<u64> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(len))?;
        file.write_all(&vec![0u8; PAGE_SIZE])?;
        Ok(len / PAGE_SIZE as u64)
    }

    /// Reads the record at `rid`, `None` if the slot is empty.
    pub fn read_record(
        &self,
        tid: TransactionId,
        pool: &BufferManager,
        rid: RecordId,
    ) -> Result<Option<Vec<u8>>, BufferManagerError> {
        if rid.slot as usize >= self.slots_per_page {
            return Ok(None);
        }
        let handle = pool.get_page(tid, rid.page_id, LockMode::Shared)?;
        let page = handle.read();
        if !self.slot_used(&page, rid.slot) {
            return Ok(None);
        }
        let offset = self.record_offset(rid.slot);
        Ok(Some(page.data()[offset..offset + self.record_len].to_vec()))
    }
}

impl DbFile for HeapFile {
    fn table_id(&self) -> TableIdType {
        self.table_id
    }

    fn read_page(&self, pid: PageId, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(pid.table_id, self.table_id);
        let mut file = self.file.lock();
        let end = (pid.page_no + 1) * PAGE_SIZE as u64;
        if file.metadata()?.len() < end {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("page {} is beyond the end of the table file", pid),
            ));
        }
        file.seek(SeekFrom::Start(pid.page_no * PAGE_SIZE as u64))?;
        file.read_exact(buf)
    }

    fn write_page(&self, pid: PageId, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(pid.table_id, self.table_id);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pid.page_no * PAGE_SIZE as u64))?;
        file.write_all(buf)
    }

    fn num_pages(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len() / PAGE_SIZE as u64)
    }

    fn insert_record(
        &self,
        tid: TransactionId,
        pool: &BufferManager,
        record: &[u8],
    ) -> Result<(RecordId, Vec<PageType>), BufferManagerError> {
        if record.len() != self.record_len {
            return Err(BufferManagerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "record of {} bytes in a table of {}-byte records",
                    record.len(),
                    self.record_len
                ),
            )));
        }
        loop {
            let num_pages = self.num_pages()?;
            for page_no in 0..num_pages {
                let pid = PageId::new(self.table_id, page_no);
                let handle = pool.get_page(tid, pid, LockMode::Exclusive)?;
                let mut page = handle.write();
                if let Some(slot) = self.find_free_slot(&page) {
                    let offset = self.record_offset(slot);
                    page.data_mut()[offset..offset + self.record_len].copy_from_slice(record);
                    self.set_slot_used(&mut page, slot, true);
                    drop(page);
                    return Ok((RecordId { page_id: pid, slot }, vec![handle]));
                }
                // Page full; under strict 2PL the lock stays anyway.
            }
            // Every page is full: extend and rescan. The fresh page may
            // already be taken by a concurrent inserter, hence the loop.
            self.append_empty_page()?;
        }
    }

    fn delete_record(
        &self,
        tid: TransactionId,
        pool: &BufferManager,
        rid: RecordId,
    ) -> Result<Vec<PageType>, BufferManagerError> {
        if rid.page_id.table_id != self.table_id || rid.slot as usize >= self.slots_per_page {
            return Err(BufferManagerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record id {:?} does not belong to this table", rid),
            )));
        }
        let handle = pool.get_page(tid, rid.page_id, LockMode::Exclusive)?;
        let mut page = handle.write();
        if !self.slot_used(&page, rid.slot) {
            return Err(BufferManagerError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no record at {:?}", rid),
            )));
        }
        self.set_slot_used(&mut page, rid.slot, false);
        drop(page);
        Ok(vec![handle])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::catalog::Catalog;
    use crate::storage::log::MockLogManager;
    use crate::transaction::lock_table::LockTable;

    const TABLE: TableIdType = 1;
    const RECORD_LEN: usize = 64;

    fn test_pool(dir: &std::path::Path, capacity: usize) -> (BufferManager, Arc<HeapFile>) {
        let heap = Arc::new(HeapFile::open(TABLE, dir.join("table"), RECORD_LEN).unwrap());
        let catalog = Catalog::new();
        catalog.register_table(heap.clone());
        let mut log = MockLogManager::new();
        log.expect_log_write().returning(|_, _, _, _| Ok(()));
        log.expect_force().returning(|| Ok(()));
        let lock_table = Arc::new(LockTable::with_timing(
            Duration::from_millis(5),
            Duration::from_millis(500),
        ));
        (
            BufferManager::new(Arc::new(catalog), Arc::new(log), lock_table, capacity),
            heap,
        )
    }

    fn tid(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    #[test]
    fn page_geometry_pays_one_bit_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let heap = HeapFile::open(TABLE, dir.path().join("t"), 64).unwrap();
        // 4096 * 8 bits / (64 * 8 + 1) bits per record
        assert_eq!(heap.slots_per_page(), 63);
        assert!(HeapFile::open(TABLE, dir.path().join("t2"), PAGE_SIZE).is_err());
        assert!(HeapFile::open(TABLE, dir.path().join("t3"), 0).is_err());
    }

    #[test]
    fn insert_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, heap) = test_pool(dir.path(), 8);
        let t = tid(1);
        let record = [7u8; RECORD_LEN];

        let rid = pool.insert_tuple(t, TABLE, &record).unwrap();
        assert_eq!(rid.page_id, PageId::new(TABLE, 0));
        assert_eq!(heap.read_record(t, &pool, rid).unwrap().unwrap(), record);

        // The touched page is owned by the inserting transaction.
        let page = pool.get_page(t, rid.page_id, LockMode::Shared).unwrap();
        assert_eq!(page.read().dirtier(), Some(t));
    }

    #[test]
    fn delete_frees_the_slot_for_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, heap) = test_pool(dir.path(), 8);
        let t = tid(1);
        let first = pool.insert_tuple(t, TABLE, &[1u8; RECORD_LEN]).unwrap();
        let second = pool.insert_tuple(t, TABLE, &[2u8; RECORD_LEN]).unwrap();
        assert_ne!(first.slot, second.slot);

        pool.delete_tuple(t, first).unwrap();
        assert_eq!(heap.read_record(t, &pool, first).unwrap(), None);

        let reused = pool.insert_tuple(t, TABLE, &[3u8; RECORD_LEN]).unwrap();
        assert_eq!(reused, first);
        assert_eq!(
            heap.read_record(t, &pool, reused).unwrap().unwrap(),
            [3u8; RECORD_LEN]
        );
    }

    #[test]
    fn deleting_an_empty_slot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _heap) = test_pool(dir.path(), 8);
        let t = tid(1);
        pool.insert_tuple(t, TABLE, &[1u8; RECORD_LEN]).unwrap();
        let missing = RecordId {
            page_id: PageId::new(TABLE, 0),
            slot: 5,
        };
        assert!(matches!(
            pool.delete_tuple(t, missing),
            Err(BufferManagerError::Io(_))
        ));
    }

    #[test]
    fn full_pages_extend_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, heap) = test_pool(dir.path(), 8);
        let t = tid(1);
        let per_page = heap.slots_per_page();
        for i in 0..per_page + 1 {
            pool.insert_tuple(t, TABLE, &[i as u8; RECORD_LEN]).unwrap();
        }
        assert_eq!(heap.num_pages().unwrap(), 2);
        let overflow = RecordId {
            page_id: PageId::new(TABLE, 1),
            slot: 0,
        };
        assert_eq!(
            heap.read_record(t, &pool, overflow).unwrap().unwrap(),
            [per_page as u8; RECORD_LEN]
        );
    }

    #[test]
    fn abort_undoes_an_insert_on_disk_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, heap) = test_pool(dir.path(), 8);

        // Committed baseline record, flushed while still dirty so the
        // data file carries it (commit itself never writes data pages).
        let t1 = tid(1);
        let keep = pool.insert_tuple(t1, TABLE, &[0x11; RECORD_LEN]).unwrap();
        pool.flush_pages(t1).unwrap();
        pool.transaction_complete(t1, true).unwrap();

        // A second transaction inserts and aborts.
        let t2 = tid(2);
        let gone = pool.insert_tuple(t2, TABLE, &[0x22; RECORD_LEN]).unwrap();
        pool.transaction_complete(t2, false).unwrap();

        let t3 = tid(3);
        assert_eq!(
            heap.read_record(t3, &pool, keep).unwrap().unwrap(),
            [0x11; RECORD_LEN]
        );
        assert_eq!(heap.read_record(t3, &pool, gone).unwrap(), None);
    }
}
