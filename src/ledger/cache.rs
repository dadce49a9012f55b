//! Read-through cache of reconciliation history, one checkpoint window per peer.
//!
//! A window starts at a checkpoint recno `first_recon` and holds every entry from recno `0`
//! (taken from the checkpoint) up to the highest loaded recno (taken from the incremental
//! records following it). Queries inside the loaded range are answered directly; queries
//! further along the same window only fetch the missing incremental records; anything else
//! discards the window and rebuilds it.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{
    record::{window_start, ReconciliationRecord, RecordFile},
    LedgerError,
};
use crate::keys::{PeerId, Recno};

/// History of one peer, loaded from one checkpoint plus incremental records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Window {
    first_recon: Recno,
    /// Entry `i` has recno `i`.
    records: Vec<ReconciliationRecord>,
}

impl Window {
    /// Assemble a window from records fetched at `first_recon` and onwards, in recno order.
    pub(crate) fn build(
        peer: &PeerId,
        first_recon: Recno,
        files: Vec<RecordFile>,
    ) -> Result<Self, LedgerError> {
        let mut window = Self {
            first_recon,
            records: Vec::new(),
        };
        window.append(peer, files)?;
        if window.records.is_empty() || window.last() < first_recon {
            return Err(LedgerError::Corrupt {
                peer: peer.clone(),
                expected: first_recon,
                found: window.records.last().map(|r| r.recno),
            });
        }
        Ok(window)
    }

    /// Append records continuing the window.
    pub(crate) fn append(&mut self, peer: &PeerId, files: Vec<RecordFile>) -> Result<(), LedgerError> {
        for file in files {
            for entry in file.into_entries() {
                let expected = self.records.len() as Recno;
                if entry.recno != expected {
                    return Err(LedgerError::Corrupt {
                        peer: peer.clone(),
                        expected,
                        found: Some(entry.recno),
                    });
                }
                self.records.push(entry);
            }
        }
        Ok(())
    }

    /// First recno of the window, a multiple of the checkpoint interval.
    pub(crate) fn first_recon(&self) -> Recno {
        self.first_recon
    }

    /// Highest loaded recno.
    pub(crate) fn last(&self) -> Recno {
        (self.records.len() as Recno).saturating_sub(1)
    }

    /// Entries for recnos `0..=recno`.
    pub(crate) fn through(&self, recno: Recno) -> &[ReconciliationRecord] {
        let end = (recno as usize + 1).min(self.records.len());
        &self.records[..end]
    }

    /// The entry at `recno`.
    pub(crate) fn record(&self, peer: &PeerId, recno: Recno) -> Result<&ReconciliationRecord, LedgerError> {
        // scan from the window start like a reader of the stored records would
        let start = self.first_recon.min(recno) as usize;
        let mut expected = start as Recno;
        for entry in &self.records[start.min(self.records.len())..] {
            if entry.recno != expected {
                return Err(LedgerError::Corrupt {
                    peer: peer.clone(),
                    expected,
                    found: Some(entry.recno),
                });
            }
            if expected == recno {
                return Ok(entry);
            }
            expected += 1;
        }
        Err(LedgerError::Corrupt {
            peer: peer.clone(),
            expected: recno,
            found: None,
        })
    }
}

/// What has to be fetched to answer a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Plan {
    /// The cached window already covers the query.
    Hit,
    /// Fetch these incremental records and append them to the cached window.
    Extend {
        first_recon: Recno,
        recnos: Vec<Recno>,
    },
    /// Fetch these records and replace the cached window.
    Rebuild {
        first_recon: Recno,
        recnos: Vec<Recno>,
    },
}

/// Per peer window cache.
#[derive(Debug, Default)]
pub(crate) struct LedgerCache {
    windows: Mutex<HashMap<PeerId, Window>>,
}

impl LedgerCache {
    /// Decide how to answer a query for `recno` given the peer's most recent recno.
    pub(crate) fn plan(&self, peer: &PeerId, recno: Recno, most_recent: Recno) -> Plan {
        let checkpoint = window_start(most_recent);
        if let Some(window) = self.windows.lock().get(peer) {
            if recno <= window.last() {
                return Plan::Hit;
            }
            if window.first_recon() == checkpoint {
                return Plan::Extend {
                    first_recon: checkpoint,
                    recnos: (window.last() + 1..=recno).collect(),
                };
            }
        }
        let recnos = if checkpoint == 0 {
            (0..=recno).collect()
        } else {
            std::iter::once(checkpoint)
                .chain(checkpoint + 1..=recno)
                .collect()
        };
        Plan::Rebuild {
            first_recon: checkpoint,
            recnos,
        }
    }

    /// Run `f` on the cached window of `peer`, if it covers `recno`.
    pub(crate) fn read<T>(
        &self,
        peer: &PeerId,
        recno: Recno,
        f: impl FnOnce(&Window) -> T,
    ) -> Option<T> {
        self.windows
            .lock()
            .get(peer)
            .filter(|w| recno <= w.last())
            .map(f)
    }

    /// Replace the window of `peer`.
    pub(crate) fn install(&self, peer: PeerId, window: Window) {
        self.windows.lock().insert(peer, window);
    }

    /// Append fetched incremental records to the window of `peer`.
    ///
    /// Returns `false` if the window changed since the fetch was planned, in which case
    /// nothing is appended.
    pub(crate) fn extend(
        &self,
        peer: &PeerId,
        first_recon: Recno,
        from: Recno,
        files: Vec<RecordFile>,
    ) -> Result<bool, LedgerError> {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(peer) else {
            return Ok(false);
        };
        if window.first_recon() != first_recon || window.last() + 1 != from {
            return Ok(false);
        }
        let mut grown = window.clone();
        grown.append(peer, files)?;
        *window = grown;
        Ok(true)
    }

    /// Forget the window of `peer`.
    pub(crate) fn invalidate(&self, peer: &PeerId) {
        self.windows.lock().remove(peer);
    }
}
