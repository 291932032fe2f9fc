use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{BigEndian, WriteBytesExt};
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;

use crate::storage::page::PageId;
use crate::transaction::TransactionId;

pub type Lsn = u64;

/// The redo-log collaborator. `log_write` appends a (before, after)
/// image pair for one page; `force` makes everything appended so far
/// durable. Every data page write has to be preceded by a forced
/// record for it (write-ahead discipline).
#[cfg_attr(test, automock)]
pub trait LogManager: Send + Sync {
    fn log_write(
        &self,
        tid: TransactionId,
        pid: PageId,
        before: &[u8],
        after: &[u8],
    ) -> io::Result<()>;
    fn force(&self) -> io::Result<()>;
}

/// Append-only file-backed redo log. Records are framed as
/// `[total_len: u32][pid: u64][tid: u64][before][after]`; the LSN of a
/// record is its byte offset in the file.
pub struct FileLog {
    file: Mutex<File>,
    next_lsn: AtomicU64,
}

impl FileLog {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileLog> {
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)?;
        let next_lsn = AtomicU64::new(file.metadata()?.len());
        Ok(FileLog {
            file: Mutex::new(file),
            next_lsn,
        })
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst)
    }
}

impl LogManager for FileLog {
    fn log_write(
        &self,
        tid: TransactionId,
        pid: PageId,
        before: &[u8],
        after: &[u8],
    ) -> io::Result<()> {
        let total_len = 4 + 8 + 8 + before.len() + after.len();
        let mut record = Vec::with_capacity(total_len);
        record.write_u32::<BigEndian>(total_len as u32)?;
        record.write_u64::<BigEndian>(u64::from(pid))?;
        // The tid is only recorded for recovery-time attribution.
        record.write_u64::<BigEndian>(tid.id())?;
        record.extend_from_slice(before);
        record.extend_from_slice(after);

        let mut file = self.file.lock();
        file.write_all(&record)?;
        self.next_lsn.fetch_add(total_len as u64, Ordering::SeqCst);
        Ok(())
    }

    fn force(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }
}
