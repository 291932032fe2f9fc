//! FerroDB storage core: bounded page cache, page-granularity strict
//! two-phase locking and the transaction commit/abort protocol of a
//! single-node relational engine.
//!
//! Everything is built around three shared components that are created
//! once at startup and handed to every consumer by [`Arc`](std::sync::Arc):
//! the [`LockTable`](transaction::lock_table::LockTable), the
//! [`BufferManager`](storage::buffer_manager::BufferManager) and the
//! [`TransactionManager`](transaction::TransactionManager). There are
//! no ambient singletons.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ferrodb::catalog::Catalog;
//! use ferrodb::config::DbConfig;
//! use ferrodb::storage::buffer_manager::BufferManager;
//! use ferrodb::storage::heap_file::HeapFile;
//! use ferrodb::storage::log::FileLog;
//! use ferrodb::transaction::lock_table::LockTable;
//! use ferrodb::transaction::TransactionManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DbConfig::new();
//! let catalog = Arc::new(Catalog::new());
//! catalog.register_table(Arc::new(HeapFile::open(1, "users.tbl", 64)?));
//! let pool = BufferManager::new(
//!     catalog,
//!     Arc::new(FileLog::open("wal")?),
//!     Arc::new(LockTable::new(&config)),
//!     config.buffer_capacity,
//! );
//! let tm = TransactionManager::new();
//!
//! let tid = tm.begin();
//! pool.insert_tuple(tid, 1, &[0u8; 64])?;
//! tm.commit(tid, &pool)?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod storage;
pub mod transaction;
