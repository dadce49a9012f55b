//! The peer reconciliation ledger.
//!
//! Every reconciliation a peer performs is recorded under its recno on the node responsible
//! for the peer. Recnos are recorded strictly in order. The [`Ledger`] client answers lookups
//! through a checkpoint window cache and fetches missing records as one concurrent batch.

use std::{collections::BTreeSet, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    directory::{Directory, RoutingKey},
    keys::{storage_key, Epoch, NodeId, PeerId, Recno, TxnId},
    metrics::Metrics,
    proto::{FailureReason, Message, MessageKind, UnexpectedReply},
    rpc::{RequestOpts, Rpc, RpcError},
    store::{self, with_deadlock_retry, Store, StoreError, WriteTxn},
};

mod cache;
pub mod record;

use self::{
    cache::{LedgerCache, Plan, Window},
    record::{is_checkpoint, window_start, ReconciliationRecord, RecordError, RecordFile},
};

/// Errors of the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Stored history is inconsistent. Never repaired automatically.
    #[error("reconciliation record of {peer} corrupt: expected recno {expected}, found {found:?}")]
    Corrupt {
        /// Peer owning the ledger.
        peer: PeerId,
        /// Recno that should have been found.
        expected: Recno,
        /// Recno actually found, if any.
        found: Option<Recno>,
    },
    /// A stored record did not decode.
    #[error(transparent)]
    Record(#[from] RecordError),
    /// A different decision is already recorded at this recno.
    #[error("reconciliation {recno} of {peer} already recorded")]
    AlreadyRecorded {
        /// Peer owning the ledger.
        peer: PeerId,
        /// The recno.
        recno: Recno,
    },
    /// The previous recno is not recorded yet.
    #[error("reconciliation {recno} of {peer} out of order, expected {expected}")]
    OutOfOrder {
        /// Peer owning the ledger.
        peer: PeerId,
        /// The recno.
        recno: Recno,
        /// The next recno the ledger accepts.
        expected: Recno,
    },
    /// The query asked for history past the most recent recno.
    #[error("recno {recno} is beyond the most recent recno {most_recent}")]
    BeyondMostRecent {
        /// Requested recno.
        recno: Recno,
        /// Most recent recno.
        most_recent: Recno,
    },
    /// The ledger owner could not serve the request.
    #[error("ledger of {peer} unavailable: {reason:?}")]
    Unavailable {
        /// Peer owning the ledger.
        peer: PeerId,
        /// The final reply.
        reason: Message,
    },
    /// The ledger owner answered with something else.
    #[error(transparent)]
    UnexpectedReply(#[from] UnexpectedReply),
    /// The request was dropped.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Decision status of one transaction as of some recno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Not decided yet.
    Undecided,
    /// Accepted in the reconciliation with this recno.
    AcceptedAt(Recno),
    /// Rejected in the reconciliation with this recno.
    RejectedAt(Recno),
}

/// One recorded decision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Decision {
    /// The decided transaction.
    pub tid: TxnId,
    /// Whether it was accepted.
    pub accepted: bool,
    /// The reconciliation that decided it.
    pub recno: Recno,
}

fn decisions_of(entry: &ReconciliationRecord) -> impl Iterator<Item = Decision> + '_ {
    let accepted = entry.accepted.iter().map(|tid| Decision {
        tid: tid.clone(),
        accepted: true,
        recno: entry.recno,
    });
    let rejected = entry.rejected.iter().map(|tid| Decision {
        tid: tid.clone(),
        accepted: false,
        recno: entry.recno,
    });
    accepted.chain(rejected)
}

/// Client side of the ledger.
#[derive(derive_more::Debug)]
pub struct Ledger {
    rpc: Rpc,
    #[debug("Directory")]
    directory: Arc<dyn Directory>,
    cache: LedgerCache,
    opts: RequestOpts,
    metrics: Arc<Metrics>,
}

impl Ledger {
    /// Create a ledger client.
    pub fn new(
        rpc: Rpc,
        directory: Arc<dyn Directory>,
        opts: RequestOpts,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            rpc,
            directory,
            cache: LedgerCache::default(),
            opts,
            metrics,
        }
    }

    fn owner(&self, peer: &PeerId) -> NodeId {
        self.directory
            .responsible_for(&RoutingKey::Peer(peer.clone()))
    }

    /// The most recent recorded recno of `peer`.
    pub async fn most_recent_recno(&self, peer: &PeerId) -> Result<Option<Recno>, LedgerError> {
        let reply = self
            .rpc
            .request(
                self.owner(peer),
                Message::RequestMostRecentRecno { peer: peer.clone() },
                self.opts
                    .expecting(&[MessageKind::MostRecentRecnoIs, MessageKind::ReplyFailure]),
            )
            .await?;
        match reply.message {
            Message::MostRecentRecnoIs { recno } if !reply.exhausted => Ok(recno),
            reason @ Message::ReplyFailure { .. } => Err(LedgerError::Unavailable {
                peer: peer.clone(),
                reason,
            }),
            other => Err(UnexpectedReply::new(MessageKind::RequestMostRecentRecno, &other).into()),
        }
    }

    /// Record the outcome of reconciliation `recno` of `peer`.
    ///
    /// Recording the same outcome twice succeeds. A different outcome fails with
    /// [`LedgerError::AlreadyRecorded`].
    pub async fn record_reconciliation(
        &self,
        peer: &PeerId,
        recno: Recno,
        epoch: Epoch,
        accepted: BTreeSet<TxnId>,
        rejected: BTreeSet<TxnId>,
    ) -> Result<(), LedgerError> {
        let reply = self
            .rpc
            .request(
                self.owner(peer),
                Message::RecordReconciliation {
                    peer: peer.clone(),
                    recno,
                    epoch,
                    accepted,
                    rejected,
                },
                // ledger failures are structural, only timeouts are retried
                self.opts
                    .expecting(&[MessageKind::ReplySuccess, MessageKind::ReplyFailure]),
            )
            .await?;
        match reply.message {
            Message::ReplySuccess if !reply.exhausted => {
                debug!(%peer, recno, %epoch, "reconciliation recorded");
                self.metrics.reconciliations_recorded.inc();
                Ok(())
            }
            Message::ReplyFailure {
                reason: FailureReason::AlreadyRecorded,
            } => Err(LedgerError::AlreadyRecorded {
                peer: peer.clone(),
                recno,
            }),
            Message::ReplyFailure {
                reason: FailureReason::OutOfOrder { expected },
            } => Err(LedgerError::OutOfOrder {
                peer: peer.clone(),
                recno,
                expected,
            }),
            reason @ Message::ReplyFailure { .. } => Err(LedgerError::Unavailable {
                peer: peer.clone(),
                reason,
            }),
            other => Err(UnexpectedReply::new(MessageKind::RecordReconciliation, &other).into()),
        }
    }

    /// The highest epoch considered by reconciliation `recno`.
    pub async fn get_epoch_for_recno(
        &self,
        peer: &PeerId,
        recno: Recno,
        most_recent: Recno,
    ) -> Result<Epoch, LedgerError> {
        self.with_window(peer, recno, most_recent, |w| {
            Ok(w.record(peer, recno)?.epoch)
        })
        .await
    }

    /// Decisions made in reconciliation `recno`, or in all reconciliations up to and
    /// including it if `cumulative`.
    pub async fn get_decisions(
        &self,
        peer: &PeerId,
        recno: Recno,
        most_recent: Recno,
        cumulative: bool,
    ) -> Result<Vec<Decision>, LedgerError> {
        self.with_window(peer, recno, most_recent, |w| {
            if cumulative {
                let entries = w.through(recno);
                if entries.len() as Recno != recno + 1 {
                    return Err(LedgerError::Corrupt {
                        peer: peer.clone(),
                        expected: recno,
                        found: entries.last().map(|e| e.recno),
                    });
                }
                Ok(entries.iter().flat_map(decisions_of).collect())
            } else {
                Ok(decisions_of(w.record(peer, recno)?).collect())
            }
        })
        .await
    }

    /// Status of `tid` as of reconciliation `recno`.
    pub async fn get_txn_status(
        &self,
        peer: &PeerId,
        recno: Recno,
        tid: &TxnId,
        most_recent: Recno,
    ) -> Result<TxnStatus, LedgerError> {
        self.with_window(peer, recno, most_recent, |w| {
            for entry in w.through(recno) {
                if entry.accepted.contains(tid) {
                    return Ok(TxnStatus::AcceptedAt(entry.recno));
                }
                if entry.rejected.contains(tid) {
                    return Ok(TxnStatus::RejectedAt(entry.recno));
                }
            }
            Ok(TxnStatus::Undecided)
        })
        .await
    }

    /// Run `f` on a cache window of `peer` covering `recno`, loading it as needed.
    async fn with_window<T>(
        &self,
        peer: &PeerId,
        recno: Recno,
        most_recent: Recno,
        f: impl Fn(&Window) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        if recno > most_recent {
            return Err(LedgerError::BeyondMostRecent {
                recno,
                most_recent,
            });
        }
        let mut missed = false;
        loop {
            match self.cache.plan(peer, recno, most_recent) {
                Plan::Hit => {
                    let Some(res) = self.cache.read(peer, recno, &f) else {
                        // replaced concurrently
                        continue;
                    };
                    if missed {
                        self.metrics.ledger_cache_misses.inc();
                    } else {
                        self.metrics.ledger_cache_hits.inc();
                    }
                    if let Err(LedgerError::Corrupt { .. }) = &res {
                        self.cache.invalidate(peer);
                    }
                    return res;
                }
                Plan::Extend { first_recon, recnos } => {
                    missed = true;
                    trace!(%peer, ?recnos, "extending ledger window");
                    let files = self.fetch(peer, &recnos).await?;
                    let from = recnos[0];
                    if let Err(err) = self.cache.extend(peer, first_recon, from, files) {
                        self.cache.invalidate(peer);
                        return Err(err);
                    }
                }
                Plan::Rebuild { first_recon, recnos } => {
                    missed = true;
                    trace!(%peer, first_recon, ?recnos, "rebuilding ledger window");
                    let files = self.fetch(peer, &recnos).await?;
                    let window = Window::build(peer, first_recon, files)?;
                    self.cache.install(peer.clone(), window);
                }
            }
        }
    }

    /// Fetch the stored records at `recnos` concurrently.
    async fn fetch(&self, peer: &PeerId, recnos: &[Recno]) -> Result<Vec<RecordFile>, LedgerError> {
        let owner = self.owner(peer);
        let requests = recnos.iter().map(|&recno| {
            (
                owner,
                Message::RequestReconciliationRecord {
                    peer: peer.clone(),
                    recno,
                },
            )
        });
        let opts = self.opts.expecting(&[
            MessageKind::ReconciliationRecordIs,
            MessageKind::ReplyFailure,
        ]);
        let replies = self.rpc.request_all(requests, opts).await?;
        recnos
            .iter()
            .zip(replies)
            .map(|(&recno, reply)| match reply.message {
                Message::ReconciliationRecordIs { bytes } if !reply.exhausted => {
                    let file = RecordFile::decode(&bytes)?;
                    let found = file.last().map(|e| e.recno);
                    let shape_ok = match file {
                        RecordFile::Checkpoint(_) => is_checkpoint(recno),
                        RecordFile::Incremental(_) => !is_checkpoint(recno),
                    };
                    if found != Some(recno) || !shape_ok {
                        return Err(LedgerError::Corrupt {
                            peer: peer.clone(),
                            expected: recno,
                            found,
                        });
                    }
                    Ok(file)
                }
                reason @ Message::ReplyFailure { .. } => Err(LedgerError::Unavailable {
                    peer: peer.clone(),
                    reason,
                }),
                other => Err(UnexpectedReply::new(
                    MessageKind::RequestReconciliationRecord,
                    &other,
                )
                .into()),
            })
            .collect()
    }
}

/// Per peer bookkeeping stored next to the records.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerSummary {
    most_recent: Option<Recno>,
}

fn record_err(err: RecordError) -> StoreError {
    StoreError::Other(err.into())
}

/// The storage side of the ledger, run on the node responsible for a peer.
#[derive(Debug, Clone)]
pub struct LedgerStore<S> {
    store: S,
}

impl<S: Store> LedgerStore<S> {
    /// Serve ledgers from `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Handle `RecordReconciliation`.
    ///
    /// The peer summary and the record are written in one transaction.
    pub fn record(&self, peer: &PeerId, entry: ReconciliationRecord) -> Result<Message, StoreError> {
        let summary_key = storage_key::peer(peer)?;
        let record_key = storage_key::recon(peer, entry.recno)?;
        with_deadlock_retry(&self.store, |tx| {
            let summary: PeerSummary = tx
                .get(&summary_key)?
                .map(|bytes| store::decode(&bytes))
                .transpose()?
                .unwrap_or_default();
            let expected = summary.most_recent.map_or(0, |r| r + 1);
            if entry.recno < expected {
                let same = match tx.get(&record_key)? {
                    Some(bytes) => RecordFile::decode(&bytes).map_err(record_err)?.last() == Some(&entry),
                    None => false,
                };
                return Ok(if same {
                    Message::ReplySuccess
                } else {
                    Message::failure(FailureReason::AlreadyRecorded)
                });
            }
            if entry.recno > expected {
                return Ok(Message::failure(FailureReason::OutOfOrder { expected }));
            }
            let file = if is_checkpoint(entry.recno) {
                let mut entries = history(tx, peer, entry.recno - 1)?;
                entries.push(entry.clone());
                RecordFile::Checkpoint(entries)
            } else {
                RecordFile::Incremental(entry.clone())
            };
            tx.put(&record_key, &file.encode().map_err(record_err)?)?;
            let summary = PeerSummary {
                most_recent: Some(entry.recno),
            };
            tx.put(&summary_key, &store::encode(&summary)?)?;
            Ok(Message::ReplySuccess)
        })
    }

    /// Handle `RequestReconciliationRecord`: the stored bytes of one record.
    pub fn record_bytes(&self, peer: &PeerId, recno: Recno) -> Result<Option<Bytes>, StoreError> {
        self.store.get(&storage_key::recon(peer, recno)?)
    }

    /// Handle `RequestMostRecentRecno`.
    pub fn most_recent(&self, peer: &PeerId) -> Result<Option<Recno>, StoreError> {
        Ok(self
            .store
            .get(&storage_key::peer(peer)?)?
            .map(|bytes| store::decode::<PeerSummary>(&bytes))
            .transpose()?
            .and_then(|s| s.most_recent))
    }
}

/// All entries `0..=through` of `peer`, read inside `tx`.
fn history(
    tx: &mut dyn WriteTxn,
    peer: &PeerId,
    through: Recno,
) -> Result<Vec<ReconciliationRecord>, StoreError> {
    let start = window_start(through);
    let mut read = |recno: Recno| -> Result<RecordFile, StoreError> {
        let bytes = tx.get(&storage_key::recon(peer, recno)?)?.ok_or_else(|| {
            StoreError::Other(anyhow::anyhow!("reconciliation {recno} of {peer} missing"))
        })?;
        RecordFile::decode(&bytes).map_err(record_err)
    };
    let (mut entries, first_incremental) = if start > 0 {
        (read(start)?.into_entries(), start + 1)
    } else {
        (Vec::new(), 0)
    };
    for recno in first_incremental..=through {
        entries.extend(read(recno)?.into_entries());
    }
    for (i, entry) in entries.iter().enumerate() {
        if entry.recno != i as Recno {
            return Err(StoreError::Other(anyhow::anyhow!(
                "reconciliation history of {peer} has recno {} at position {i}",
                entry.recno
            )));
        }
    }
    Ok(entries)
}
