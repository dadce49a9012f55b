//! Durable key-value storage used by the sequencer, ledger and transaction services.
//!
//! The contract is narrow: point reads, create-if-absent writes and
//! multi-key atomic transactions. Backends that detect deadlocks report them as
//! [`StoreError::Deadlock`], which [`with_deadlock_retry`] retries with a fresh transaction.

use bytes::Bytes;
use tracing::debug;

use crate::keys::KeyError;

pub mod fs;
pub mod memory;

/// How often a storage transaction is retried after a deadlock before the caller is told
/// the operation failed.
pub const NUM_DEADLOCK_RETRIES: usize = 5;

/// Error returned from [`Store`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend aborted the transaction to break a deadlock. Retrying may succeed.
    #[error("storage deadlock")]
    Deadlock,
    /// A stored value could not be decoded.
    #[error("failed to decode stored value: {0}")]
    Decode(#[from] postcard::Error),
    /// A key could not be built from its parts.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Any other backend failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of [`WriteTxn::put_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was absent and now holds the value.
    Created,
    /// The key already existed; contains the stored value, which was left untouched.
    AlreadyExists(Bytes),
}

/// Operations available inside one atomic write transaction.
pub trait WriteTxn {
    /// Read a key, observing writes made earlier in this transaction.
    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Write a key unconditionally.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Write a key only if it does not exist yet.
    fn put_if_absent(&mut self, key: &[u8], value: &[u8]) -> Result<PutOutcome, StoreError> {
        match self.get(key)? {
            Some(existing) => Ok(PutOutcome::AlreadyExists(existing)),
            None => {
                self.put(key, value)?;
                Ok(PutOutcome::Created)
            }
        }
    }
}

/// A durable store.
pub trait Store: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Read the committed value of a key.
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Run `f` inside a single write transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and is rolled back otherwise.
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut dyn WriteTxn) -> Result<T, StoreError>,
    ) -> Result<T, StoreError>;

    /// Atomically create a key if absent.
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<PutOutcome, StoreError> {
        self.transact(|tx| tx.put_if_absent(key, value))
    }
}

/// Runs `f` in a fresh transaction, retrying up to [`NUM_DEADLOCK_RETRIES`] times when the
/// backend reports a deadlock.
pub fn with_deadlock_retry<S, T>(
    store: &S,
    mut f: impl FnMut(&mut dyn WriteTxn) -> Result<T, StoreError>,
) -> Result<T, StoreError>
where
    S: Store,
{
    let mut retries = 0;
    loop {
        match store.transact(&mut f) {
            Err(StoreError::Deadlock) if retries < NUM_DEADLOCK_RETRIES => {
                retries += 1;
                debug!(retries, "storage deadlock, retrying transaction");
            }
            res => return res,
        }
    }
}

/// Decode a postcard encoded stored value.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Encode a value for storage.
pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(postcard::to_stdvec(value)?)
}
