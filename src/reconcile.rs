//! Publishing and reconciling transactions.
//!
//! A reconciliation walks every epoch published since the peer's last reconciliation,
//! builds the chain of each foreign transaction that is still undecided, applies the trust
//! policy and records the outcome under the next recno. Transactions whose chain cannot be
//! completed yet are deferred: the recorded epoch stops short of them, so they are
//! considered again by the next reconciliation.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::{
    chain::{AlreadyRejectedAntecedent, ChainMode, Decided, DecisionLookup, TxnChain, TxnLookup},
    directory::{Directory, RoutingKey},
    epoch::{EpochError, EpochSequencer},
    keys::{storage_key, Epoch, NodeId, PeerId, Recno, TxnId},
    ledger::{Ledger, LedgerError},
    proto::{FailureReason, Message, MessageKind, UnexpectedReply},
    rpc::{RequestOpts, Rpc, RpcError},
    store::{self, with_deadlock_retry, PutOutcome, Store, StoreError},
    txn::{Transaction, TrustPolicy},
};

/// Published transactions, stored on the node responsible for each id.
#[derive(Debug, Clone)]
pub struct TxnStore<S> {
    store: S,
}

impl<S: Store> TxnStore<S> {
    /// Serve transactions from `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Handle `PublishTxn`. Publishing identical content again succeeds.
    pub fn publish(&self, txn: &Transaction) -> Result<Message, StoreError> {
        let key = storage_key::txn(txn.id())?;
        let value = store::encode(txn)?;
        let outcome = with_deadlock_retry(&self.store, |tx| tx.put_if_absent(&key, &value))?;
        Ok(match outcome {
            PutOutcome::Created => Message::ReplySuccess,
            PutOutcome::AlreadyExists(existing) if existing == value => Message::ReplySuccess,
            PutOutcome::AlreadyExists(_) => Message::failure(FailureReason::AlreadyRecorded),
        })
    }

    /// A stored transaction.
    pub fn get(&self, tid: &TxnId) -> Result<Option<Transaction>, StoreError> {
        self.store
            .get(&storage_key::txn(tid)?)?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }
}

/// Errors of [`Reconciler`].
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Ledger access failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Epoch access failed.
    #[error(transparent)]
    Epoch(#[from] EpochError),
    /// A transaction could not be stored.
    #[error("publishing {tid} failed: {reason:?}")]
    Publish {
        /// The transaction.
        tid: TxnId,
        /// The final reply.
        reason: Message,
    },
    /// A node answered with something else.
    #[error(transparent)]
    UnexpectedReply(#[from] UnexpectedReply),
    /// A request was dropped.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The recno recorded, `None` if there was nothing to record.
    pub recno: Option<Recno>,
    /// Epoch covered by the ledger after this reconciliation.
    pub epoch: Epoch,
    /// Newly accepted transactions.
    pub accepted: BTreeSet<TxnId>,
    /// Newly rejected transactions.
    pub rejected: BTreeSet<TxnId>,
    /// Candidates whose chain could not be completed yet.
    pub deferred: BTreeSet<TxnId>,
}

/// Decisions as seen by the reconciling peer: its own transactions count as accepted.
struct View<'a> {
    peer: &'a PeerId,
    decided: &'a Decided,
    /// Reported as accepted by a responder during this walk.
    also_accepted: BTreeSet<TxnId>,
}

impl DecisionLookup for View<'_> {
    fn has_accepted(&self, tid: &TxnId) -> bool {
        &tid.peer == self.peer || self.decided.has_accepted(tid) || self.also_accepted.contains(tid)
    }

    fn has_rejected(&self, tid: &TxnId) -> bool {
        self.decided.has_rejected(tid)
    }
}

/// Locally stored transactions plus those fetched during this reconciliation.
struct Available<'a, S> {
    store: &'a TxnStore<S>,
    fetched: &'a BTreeMap<TxnId, Transaction>,
}

impl<S: Store> TxnLookup for Available<'_, S> {
    fn lookup(&self, tid: &TxnId) -> Option<Transaction> {
        if let Some(txn) = self.fetched.get(tid) {
            return Some(txn.clone());
        }
        match self.store.get(tid) {
            Ok(txn) => txn,
            Err(err) => {
                warn!(%tid, "reading transaction failed: {err:#}");
                None
            }
        }
    }
}

enum ChainOutcome {
    Complete(TxnChain),
    Incomplete,
    Rejected(TxnId),
}

/// A complete, trusted chain competing for acceptance.
#[derive(Debug)]
struct Contender {
    head: TxnId,
    components: BTreeSet<TxnId>,
    rows: BTreeMap<TxnId, BTreeSet<(String, Bytes)>>,
    priority: i32,
}

impl Contender {
    fn new(chain: &TxnChain, priority: i32) -> Self {
        let rows = chain
            .txns()
            .iter()
            .map(|(tid, txn)| {
                let rows = txn
                    .touched_rows()
                    .map(|(relation, key)| (relation.to_string(), key.clone()))
                    .collect();
                (tid.clone(), rows)
            })
            .collect();
        Self {
            head: chain.head().clone(),
            components: chain.components(),
            rows,
            priority,
        }
    }

    /// Rows written by components that `other` does not share.
    fn own_rows(&self, other: &Contender) -> BTreeSet<&(String, Bytes)> {
        self.rows
            .iter()
            .filter(|(tid, _)| !other.components.contains(*tid))
            .flat_map(|(_, rows)| rows.iter())
            .collect()
    }

    fn conflicts_with(&self, other: &Contender) -> bool {
        let mine = self.own_rows(other);
        !mine.is_empty() && !mine.is_disjoint(&other.own_rows(self))
    }
}

/// Pick the accepted transactions among complete chains.
///
/// Chains writing the same row independently conflict: the higher priority wins, equal
/// priorities lose both. A chain containing a losing head or an already rejected
/// transaction loses as well.
fn resolve_conflicts(
    contenders: &[Contender],
    rejected: &BTreeSet<TxnId>,
) -> (BTreeSet<TxnId>, BTreeSet<TxnId>) {
    let mut lost = vec![false; contenders.len()];
    for (i, a) in contenders.iter().enumerate() {
        for (j, b) in contenders.iter().enumerate().skip(i + 1) {
            if a.conflicts_with(b) {
                trace!(a = %a.head, b = %b.head, "conflicting chains");
                if a.priority >= b.priority {
                    lost[j] = true;
                }
                if b.priority >= a.priority {
                    lost[i] = true;
                }
            }
        }
    }
    loop {
        let losing_heads: BTreeSet<&TxnId> = contenders
            .iter()
            .zip(&lost)
            .filter(|(_, lost)| **lost)
            .map(|(c, _)| &c.head)
            .collect();
        let mut changed = false;
        for (contender, lost) in contenders.iter().zip(lost.iter_mut()) {
            if *lost {
                continue;
            }
            let tainted = contender
                .components
                .iter()
                .any(|tid| losing_heads.contains(tid) || rejected.contains(tid));
            if tainted {
                *lost = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    let accepted: BTreeSet<TxnId> = contenders
        .iter()
        .zip(&lost)
        .filter(|(_, lost)| !**lost)
        .flat_map(|(c, _)| c.components.iter().cloned())
        .collect();
    let losers = contenders
        .iter()
        .zip(&lost)
        .filter(|(_, lost)| **lost)
        .map(|(c, _)| c.head.clone())
        .filter(|head| !accepted.contains(head))
        .collect();
    (accepted, losers)
}

/// Publishes and reconciles on behalf of one peer.
#[derive(derive_more::Debug)]
pub struct Reconciler<S> {
    peer: PeerId,
    rpc: Rpc,
    #[debug("Directory")]
    directory: Arc<dyn Directory>,
    sequencer: EpochSequencer,
    ledger: Arc<Ledger>,
    txns: TxnStore<S>,
    trust: Arc<dyn TrustPolicy>,
    opts: RequestOpts,
    mode: ChainMode,
    /// Reconciliations of one peer are recorded strictly in order.
    running: tokio::sync::Mutex<()>,
}

impl<S: Store> Reconciler<S> {
    /// Create a reconciler for `peer`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: PeerId,
        rpc: Rpc,
        directory: Arc<dyn Directory>,
        sequencer: EpochSequencer,
        ledger: Arc<Ledger>,
        txns: TxnStore<S>,
        trust: Arc<dyn TrustPolicy>,
        opts: RequestOpts,
    ) -> Self {
        Self {
            peer,
            rpc,
            directory,
            sequencer,
            ledger,
            txns,
            trust,
            opts,
            mode: ChainMode::Ordered,
            running: Default::default(),
        }
    }

    /// Set how chains are assembled.
    pub fn with_chain_mode(mut self, mode: ChainMode) -> Self {
        self.mode = mode;
        self
    }

    /// The reconciling peer.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn owner(&self, tid: &TxnId) -> NodeId {
        self.directory.responsible_for(&RoutingKey::Txn(tid.clone()))
    }

    /// Store `txns` at their responsible nodes and publish them as one epoch.
    pub async fn publish(&self, txns: Vec<Transaction>) -> Result<Epoch, ReconcileError> {
        let tids: Vec<TxnId> = txns.iter().map(|t| t.id().clone()).collect();
        let requests: Vec<_> = txns
            .into_iter()
            .map(|txn| (self.owner(txn.id()), Message::PublishTxn { txn }))
            .collect();
        let opts = self
            .opts
            .expecting(&[MessageKind::ReplySuccess, MessageKind::ReplyFailure]);
        let replies = self.rpc.request_all(requests, opts).await?;
        for (tid, reply) in tids.iter().zip(replies) {
            if reply.exhausted || reply.message != Message::ReplySuccess {
                return Err(ReconcileError::Publish {
                    tid: tid.clone(),
                    reason: reply.message,
                });
            }
        }
        let epoch = self
            .sequencer
            .publish_next_epoch(tids.into_iter().collect())
            .await?;
        info!(peer = %self.peer, %epoch, "published");
        Ok(epoch)
    }

    /// Reconcile everything published since the last reconciliation.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, ReconcileError> {
        let _running = self.running.lock().await;
        let peer = &self.peer;
        let most_recent = self.ledger.most_recent_recno(peer).await?;
        let (covered, decided) = match most_recent {
            Some(recno) => {
                let covered = self.ledger.get_epoch_for_recno(peer, recno, recno).await?;
                let mut decided = Decided::default();
                for decision in self.ledger.get_decisions(peer, recno, recno, true).await? {
                    if decision.accepted {
                        decided.accepted.insert(decision.tid);
                    } else {
                        decided.rejected.insert(decision.tid);
                    }
                }
                (covered, decided)
            }
            None => (Epoch::ZERO, Decided::default()),
        };
        let last = self.sequencer.refresh_last_epoch().await?;

        let mut candidates = Vec::new();
        let mut walked = covered;
        let mut epoch = covered.next();
        while epoch <= last {
            let tids = match self.sequencer.epoch_contents(epoch).await {
                Ok(Some(tids)) => tids,
                Ok(None) => {
                    debug!(%epoch, "epoch not claimed, stopping walk");
                    break;
                }
                Err(EpochError::Unreachable { node, reason }) => {
                    debug!(%epoch, %node, ?reason, "epoch unavailable, stopping walk");
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            for tid in tids {
                if &tid.peer != peer && !decided.has_accepted(&tid) && !decided.has_rejected(&tid)
                {
                    candidates.push((epoch, tid));
                }
            }
            walked = epoch;
            epoch = epoch.next();
        }
        debug!(%peer, %covered, %walked, candidates = candidates.len(), "reconciling");

        let mut fetched = BTreeMap::new();
        let mut rejected = BTreeSet::new();
        let mut deferred = BTreeMap::new();
        let mut contenders = Vec::new();
        for (epoch, tid) in candidates {
            let outcome = self
                .build_chain(&tid, most_recent, &decided, &mut fetched)
                .await?;
            match outcome {
                ChainOutcome::Rejected(antecedent) => {
                    trace!(%tid, %antecedent, "rejected antecedent");
                    rejected.insert(tid);
                }
                ChainOutcome::Incomplete => {
                    deferred.insert(tid, epoch);
                }
                ChainOutcome::Complete(chain) => {
                    let priority = chain
                        .txns()
                        .values()
                        .map(|txn| self.trust.priority(txn))
                        .min()
                        .unwrap_or(0);
                    if priority <= 0 {
                        trace!(%tid, priority, "untrusted");
                        rejected.insert(tid);
                    } else {
                        contenders.push(Contender::new(&chain, priority));
                    }
                }
            }
        }
        let (accepted, losers) = resolve_conflicts(&contenders, &rejected);
        rejected.extend(losers);

        let epoch = deferred
            .values()
            .min()
            .map_or(walked, |first: &Epoch| Epoch(first.0 - 1));
        let mut outcome = ReconcileOutcome {
            recno: None,
            epoch,
            accepted,
            rejected,
            deferred: deferred.into_keys().collect(),
        };
        if outcome.accepted.is_empty() && outcome.rejected.is_empty() && epoch == covered {
            return Ok(outcome);
        }
        let recno = most_recent.map_or(0, |r| r + 1);
        self.ledger
            .record_reconciliation(
                peer,
                recno,
                epoch,
                outcome.accepted.clone(),
                outcome.rejected.clone(),
            )
            .await?;
        info!(
            %peer,
            recno,
            %epoch,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            deferred = outcome.deferred.len(),
            "reconciled"
        );
        outcome.recno = Some(recno);
        Ok(outcome)
    }

    /// Build the chain of `head`, fetching unavailable antecedents from their owners until
    /// the chain is complete or no more progress is made.
    async fn build_chain(
        &self,
        head: &TxnId,
        as_of_recno: Option<Recno>,
        decided: &Decided,
        fetched: &mut BTreeMap<TxnId, Transaction>,
    ) -> Result<ChainOutcome, ReconcileError> {
        let mut view = View {
            peer: &self.peer,
            decided,
            also_accepted: BTreeSet::new(),
        };
        let available = Available {
            store: &self.txns,
            fetched: &*fetched,
        };
        let mut chain = match TxnChain::build(head.clone(), self.mode, &available, &view) {
            Ok(chain) => chain,
            Err(AlreadyRejectedAntecedent(tid)) => return Ok(ChainOutcome::Rejected(tid)),
        };
        let opts = self.opts.expecting(&[
            MessageKind::RetrievedTxn,
            MessageKind::TxnNotNeeded,
            MessageKind::TxnAlreadyRejected,
            MessageKind::AntecedentTxnRejected,
            MessageKind::CheckForTxn,
        ]);
        while !chain.is_complete() {
            let tail: Vec<TxnId> = chain.tail().iter().cloned().collect();
            let requests: Vec<_> = tail
                .iter()
                .map(|tid| {
                    (
                        self.owner(tid),
                        Message::RequestTxnForReconciliation {
                            tid: tid.clone(),
                            requesting_peer: self.peer.clone(),
                            as_of_recno,
                            known_accepted: decided.accepted.clone(),
                        },
                    )
                })
                .collect();
            let replies = self.rpc.request_all(requests, opts).await?;
            for (tid, reply) in tail.iter().zip(replies) {
                if reply.exhausted {
                    debug!(%tid, "transaction owner unreachable");
                    continue;
                }
                match reply.message {
                    Message::RetrievedTxn {
                        txn,
                        more_antecedents_needed,
                        ..
                    } => {
                        trace!(%tid, needed = more_antecedents_needed.len(), "fetched");
                        fetched.insert(txn.id().clone(), txn);
                    }
                    Message::TxnNotNeeded => {
                        view.also_accepted.insert(tid.clone());
                    }
                    Message::TxnAlreadyRejected => return Ok(ChainOutcome::Rejected(tid.clone())),
                    Message::AntecedentTxnRejected { antecedent } => {
                        return Ok(ChainOutcome::Rejected(antecedent))
                    }
                    Message::CheckForTxn { .. } => trace!(%tid, "not available yet"),
                    other => {
                        return Err(UnexpectedReply::new(
                            MessageKind::RequestTxnForReconciliation,
                            &other,
                        )
                        .into())
                    }
                }
            }
            let available = Available {
                store: &self.txns,
                fetched: &*fetched,
            };
            match chain.replace_tail_with_available_txns(&available, &view) {
                Ok(true) => {}
                Ok(false) => break,
                Err(AlreadyRejectedAntecedent(tid)) => return Ok(ChainOutcome::Rejected(tid)),
            }
        }
        Ok(if chain.is_complete() {
            ChainOutcome::Complete(chain)
        } else {
            ChainOutcome::Incomplete
        })
    }
}
