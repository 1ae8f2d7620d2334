//! RocksDB-backed [`KeyValueStore`].
//!
//! One column family per [`Column`]. Batches map onto RocksDB write
//! batches, so a committed storage transaction is crash-atomic.

use std::path::Path;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};

use keel_core::error::StoreError;
use keel_core::storage::{Column, KeyValueStore, WriteBatch, WriteOp};

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a database at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Column::ALL
            .iter()
            .map(|column| ColumnFamilyDescriptor::new(column.as_str(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(backend)?;
        tracing::debug!(path = %path.as_ref().display(), "rocksdb opened");
        Ok(Self { db })
    }

    /// Flush memtables of every column family to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for column in Column::ALL {
            self.db.flush_cf(self.cf_handle(column)?).map_err(backend)?;
        }
        Ok(())
    }

    fn cf_handle(&self, column: Column) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(column.as_str())
            .ok_or_else(|| StoreError::Backend(format!("missing column family: {}", column.as_str())))
    }
}

impl KeyValueStore for RocksStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db.get_cf(self.cf_handle(column)?, key).map_err(backend)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.put_cf(self.cf_handle(column)?, key, value).map_err(backend)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.db.delete_cf(self.cf_handle(column)?, key).map_err(backend)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf_handle(column)?;
        let mut found = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(backend)?;
            if !key.starts_with(prefix) {
                break;
            }
            found.push((key.into_vec(), value.into_vec()));
        }
        Ok(found)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => rocks_batch.put_cf(self.cf_handle(*column)?, key, value),
                WriteOp::Delete { column, key } => rocks_batch.delete_cf(self.cf_handle(*column)?, key),
            }
        }
        self.db.write(rocks_batch).map_err(backend)
    }
}
