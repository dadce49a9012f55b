//! On disk storage, backed by [`redb`].

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};

use super::{StoreError, WriteTxn};

/// Table: Records
/// Key:   `&[u8]` # table prefix followed by the record key, see `keys::storage_key`
/// Value: `&[u8]` # postcard encoded record
const RECORDS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records-1");

/// Persistent store.
///
/// redb admits a single writer at a time, so write transactions queue instead of deadlocking.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Create or open a store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Database::create(path)?;

        // Setup all tables
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(RECORDS_TABLE)?;
        }
        write_tx.commit()?;

        Ok(Store { db: Arc::new(db) })
    }
}

fn storage_err(err: impl Into<redb::Error>) -> StoreError {
    StoreError::Other(anyhow::Error::new(err.into()))
}

impl super::Store for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let read_tx = self.db.begin_read().map_err(storage_err)?;
        let table = read_tx.open_table(RECORDS_TABLE).map_err(storage_err)?;
        let value = table.get(key).map_err(storage_err)?;
        Ok(value.map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn transact<T>(
        &self,
        f: impl FnOnce(&mut dyn WriteTxn) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let write_tx = self.db.begin_write().map_err(storage_err)?;
        let res = {
            let table = write_tx.open_table(RECORDS_TABLE).map_err(storage_err)?;
            let mut tx = Txn { table };
            f(&mut tx)
        };
        match res {
            Ok(res) => {
                write_tx.commit().map_err(storage_err)?;
                Ok(res)
            }
            Err(err) => {
                write_tx.abort().map_err(storage_err)?;
                Err(err)
            }
        }
    }
}

struct Txn<'a> {
    table: redb::Table<'a, &'static [u8], &'static [u8]>,
}

impl WriteTxn for Txn<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let value = self.table.get(key).map_err(storage_err)?;
        Ok(value.map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.table.insert(key, value).map_err(storage_err)?;
        Ok(())
    }
}
