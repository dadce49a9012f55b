//! Stored form of reconciliation records.
//!
//! Every record starts with a format version byte followed by a postcard encoded
//! [`RecordFile`]. Records at a checkpoint recno (a positive multiple of
//! [`RECONCILIATION_CHECKPOINT_INTERVAL`]) hold every entry from recno `0` through the
//! checkpoint, all others hold exactly one entry. A reader therefore needs one checkpoint
//! plus at most `interval - 1` incremental records to know the full history up to any recno.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::keys::{Epoch, Recno, TxnId};

/// Distance between two checkpoint records.
pub const RECONCILIATION_CHECKPOINT_INTERVAL: Recno = 5;

const FORMAT_VERSION: u8 = 1;

/// The outcome of one reconciliation of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    /// Reconciliation number.
    pub recno: Recno,
    /// Highest epoch considered.
    pub epoch: Epoch,
    /// Transactions accepted in this reconciliation.
    pub accepted: BTreeSet<TxnId>,
    /// Transactions rejected in this reconciliation.
    pub rejected: BTreeSet<TxnId>,
}

/// Contents of one stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordFile {
    /// All entries from recno `0` through the checkpoint recno, in recno order.
    Checkpoint(Vec<ReconciliationRecord>),
    /// A single entry.
    Incremental(ReconciliationRecord),
}

/// Errors decoding a [`RecordFile`].
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The record is empty.
    #[error("empty reconciliation record")]
    Empty,
    /// The record was written by an unknown format version.
    #[error("unsupported reconciliation record version {0}")]
    UnsupportedVersion(u8),
    /// The body did not decode.
    #[error("malformed reconciliation record: {0}")]
    Malformed(#[from] postcard::Error),
}

/// Whether the record for `recno` is written as a checkpoint.
pub fn is_checkpoint(recno: Recno) -> bool {
    recno > 0 && recno % RECONCILIATION_CHECKPOINT_INTERVAL == 0
}

/// The start of the checkpoint window containing `recno`.
pub fn window_start(recno: Recno) -> Recno {
    recno - recno % RECONCILIATION_CHECKPOINT_INTERVAL
}

impl RecordFile {
    /// Encode with the version prefix.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        Ok(postcard::to_extend(self, vec![FORMAT_VERSION])?)
    }

    /// Inverse of [`Self::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let (&version, body) = bytes.split_first().ok_or(RecordError::Empty)?;
        if version != FORMAT_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        Ok(postcard::from_bytes(body)?)
    }

    /// The entries in this record, in recno order.
    pub fn entries(&self) -> &[ReconciliationRecord] {
        match self {
            RecordFile::Checkpoint(entries) => entries,
            RecordFile::Incremental(entry) => std::slice::from_ref(entry),
        }
    }

    /// The entry for the recno this record was written at.
    pub fn last(&self) -> Option<&ReconciliationRecord> {
        self.entries().last()
    }

    /// Consume into the entries.
    pub fn into_entries(self) -> Vec<ReconciliationRecord> {
        match self {
            RecordFile::Checkpoint(entries) => entries,
            RecordFile::Incremental(entry) => vec![entry],
        }
    }
}
