use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::storage::heap_file::DbFile;
use crate::storage::page::TableIdType;

type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// Maps table ids to their storage handles. Registered once at
/// startup (or on DDL) and read on every cache miss.
pub struct Catalog {
    files: RwLock<HashMap<TableIdType, Arc<dyn DbFile>>>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog {
            files: RwLock::new(HashMap::default()),
        }
    }

    /// Registers `file` under its own table id, replacing any previous
    /// registration.
    pub fn register_table(&self, file: Arc<dyn DbFile>) {
        self.files.write().insert(file.table_id(), file);
    }

    pub fn get_file(&self, table_id: TableIdType) -> Option<Arc<dyn DbFile>> {
        self.files.read().get(&table_id).cloned()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::heap_file::MockDbFile;

    #[test]
    fn lookup_after_registration() {
        let catalog = Catalog::new();
        assert!(catalog.get_file(1).is_none());
        let mut file = MockDbFile::new();
        file.expect_table_id().return_const(1u16);
        catalog.register_table(Arc::new(file));
        let found = catalog.get_file(1).unwrap();
        assert_eq!(found.table_id(), 1);
    }
}
