//! In memory storage.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{StoreError, WriteTxn};

/// In memory store, cheap to clone.
///
/// Transactions are serialized by a single mutex, so they never deadlock on their own.
/// Tests can still exercise deadlock recovery with [`Store::inject_deadlocks`].
#[derive(Debug, Clone, Default)]
pub struct Store {
    records: Arc<Mutex<BTreeMap<Vec<u8>, Bytes>>>,
    injected_deadlocks: Arc<AtomicUsize>,
}

impl Store {
    /// Abort the next `count` transactions with [`StoreError::Deadlock`].
    pub fn inject_deadlocks(&self, count: usize) {
        self.injected_deadlocks.store(count, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn take_injected_deadlock(&self) -> bool {
        self.injected_deadlocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl super::Store for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn transact<T>(
        &self,
        f: impl FnOnce(&mut dyn WriteTxn) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.take_injected_deadlock() {
            return Err(StoreError::Deadlock);
        }
        let mut records = self.records.lock();
        let mut tx = Txn {
            committed: &*records,
            staged: BTreeMap::new(),
        };
        let res = f(&mut tx)?;
        let staged = tx.staged;
        records.extend(staged);
        Ok(res)
    }
}

struct Txn<'a> {
    committed: &'a BTreeMap<Vec<u8>, Bytes>,
    staged: BTreeMap<Vec<u8>, Bytes>,
}

impl WriteTxn for Txn<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .staged
            .get(key)
            .or_else(|| self.committed.get(key))
            .cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.staged
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }
}
