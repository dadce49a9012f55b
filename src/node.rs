//! A reconciliation node: the storage services it runs for others, and the reconciler it
//! runs for its own peer.
//!
//! Create one with [`Node::builder`]. Inbound envelopes go through the [`Ingress`] handed to
//! [`Builder::spawn`], which is also what transports deliver to.

use std::{collections::BTreeSet, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    chain::ChainMode,
    config::NodeConfig,
    directory::{Directory, StaticDirectory},
    epoch::{EpochAllocator, EpochSequencer, EpochStore},
    keys::{Epoch, NodeId, PeerId, Recno, TxnId},
    ledger::{record::ReconciliationRecord, Ledger, LedgerStore, TxnStatus},
    metrics::Metrics,
    net::{Inbox, Transport},
    proto::{Envelope, FailureReason, Message},
    reconcile::{ReconcileError, ReconcileOutcome, Reconciler, TxnStore},
    rpc::{RequestOpts, Rpc},
    store::{Store, StoreError},
    txn::{PeerTrust, Transaction, TrustPolicy},
    workers::{Handler, Ingress, PoolOpts, WorkerPool},
};

/// Builder for [`Node`].
#[derive(derive_more::Debug)]
pub struct Builder<S> {
    config: NodeConfig,
    store: S,
    #[debug(skip)]
    directory: Option<Arc<dyn Directory>>,
    trust: Option<Arc<dyn TrustPolicy>>,
    metrics: Option<Arc<Metrics>>,
    mode: ChainMode,
}

impl<S: Store> Builder<S> {
    /// Use `directory` instead of a [`StaticDirectory`] over the configured members.
    pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Use `trust` instead of the configured [`PeerTrust`].
    pub fn trust(mut self, trust: Arc<dyn TrustPolicy>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Count into `metrics`.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// How the reconciler assembles chains.
    pub fn chain_mode(mut self, mode: ChainMode) -> Self {
        self.mode = mode;
        self
    }

    /// Start the node, sending through `transport` and processing envelopes from `ingress`.
    pub fn spawn(self, transport: Arc<dyn Transport>, ingress: Ingress) -> Node<S> {
        let Self {
            config,
            store,
            directory,
            trust,
            metrics,
            mode,
        } = self;
        let id = config.node_id();
        let metrics = metrics.unwrap_or_default();
        let directory: Arc<dyn Directory> = match directory {
            Some(directory) => directory,
            None => Arc::new(StaticDirectory::new(config.members())),
        };
        let trust: Arc<dyn TrustPolicy> = match trust {
            Some(trust) => trust,
            None => Arc::new(PeerTrust::from(&config.trust)),
        };
        let opts = RequestOpts::from(&config.rpc);

        let rpc = Rpc::new(id, transport, metrics.clone());
        let allocator = Arc::new(EpochAllocator::default());
        let sequencer = EpochSequencer::new(
            rpc.clone(),
            directory.clone(),
            allocator.clone(),
            opts,
            config.epoch_publish_attempts,
            metrics.clone(),
        );
        let ledger = Arc::new(Ledger::new(
            rpc.clone(),
            directory.clone(),
            opts,
            metrics.clone(),
        ));
        let services = Services {
            rpc: rpc.clone(),
            epochs: EpochStore::new(store.clone(), allocator),
            ledgers: LedgerStore::new(store.clone()),
            txns: TxnStore::new(store.clone()),
            ledger: ledger.clone(),
        };
        let pool = WorkerPool::spawn(
            Arc::new(services),
            ingress,
            PoolOpts::from(&config.workers),
            metrics.clone(),
        );
        let peer = config.peer_id();
        let reconciler = Reconciler::new(
            peer.clone(),
            rpc,
            directory,
            sequencer.clone(),
            ledger.clone(),
            TxnStore::new(store),
            trust,
            opts,
        )
        .with_chain_mode(mode);
        info!(node = %id, %peer, "node started");
        Node {
            id,
            reconciler,
            sequencer,
            ledger,
            metrics,
            pool,
        }
    }
}

/// A running node.
///
/// Dropping it stops the worker pool.
#[derive(Debug)]
pub struct Node<S> {
    id: NodeId,
    reconciler: Reconciler<S>,
    sequencer: EpochSequencer,
    ledger: Arc<Ledger>,
    metrics: Arc<Metrics>,
    pool: WorkerPool,
}

impl<S: Store> Node<S> {
    /// Configure a node on top of `store`.
    pub fn builder(config: NodeConfig, store: S) -> Builder<S> {
        Builder {
            config,
            store,
            directory: None,
            trust: None,
            metrics: None,
            mode: ChainMode::default(),
        }
    }

    /// This node's substrate address.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The peer this node reconciles for.
    pub fn peer(&self) -> &PeerId {
        self.reconciler.peer()
    }

    /// Publish `txns` of this node's peer as one epoch.
    pub async fn publish(&self, txns: Vec<Transaction>) -> Result<Epoch, ReconcileError> {
        self.reconciler.publish(txns).await
    }

    /// Reconcile everything published since the last reconciliation.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconciler.reconcile().await
    }

    /// Ledger client of this node.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Epoch sequencer of this node.
    pub fn sequencer(&self) -> &EpochSequencer {
        &self.sequencer
    }

    /// Counters of this node.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The worker pool processing inbound envelopes.
    pub fn workers(&self) -> &WorkerPool {
        &self.pool
    }

    /// Where transports deliver inbound envelopes.
    pub fn inbox(&self) -> Inbox {
        self.pool.inbox()
    }

    /// Stop processing inbound envelopes.
    pub fn shutdown(&self) {
        debug!(node = %self.id, "shutting down");
        self.pool.close();
    }
}

/// The storage services of a node, answering requests of all nodes.
#[derive(Debug)]
struct Services<S> {
    rpc: Rpc,
    epochs: EpochStore<S>,
    ledgers: LedgerStore<S>,
    txns: TxnStore<S>,
    ledger: Arc<Ledger>,
}

impl<S: Store> Handler for Services<S> {
    async fn handle(&self, envelope: Envelope) {
        if envelope.reply_to.is_some() {
            self.rpc.handle_reply(envelope);
            return;
        }
        let answer = match self.answer(&envelope).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(id = %envelope.id, kind = %envelope.message.kind(), "request failed: {err:#}");
                Some(match err {
                    StoreError::Deadlock => Message::failure(FailureReason::Deadlock),
                    StoreError::Key(err) => {
                        Message::failure(FailureReason::InvalidKey(err.to_string()))
                    }
                    err => Message::failure(FailureReason::Storage(err.to_string())),
                })
            }
        };
        if let Some(answer) = answer {
            self.rpc.reply(&envelope, answer);
        }
    }
}

impl<S: Store> Services<S> {
    async fn answer(&self, envelope: &Envelope) -> Result<Option<Message>, StoreError> {
        let answer = match &envelope.message {
            Message::RequestLastEpoch => Message::LastEpochIs {
                epoch: self.epochs.allocator().last_known(),
            },
            Message::PublishEpoch { epoch, tids } => {
                let (epochs, id, epoch, tids) =
                    (self.epochs.clone(), envelope.id, *epoch, tids.clone());
                blocking(move || epochs.publish(id, epoch, tids)).await?
            }
            Message::NoteEpoch { epoch } => {
                self.epochs.allocator().note_epoch(*epoch);
                return Ok(None);
            }
            Message::RequestEpochContents { epoch } => {
                let (epochs, epoch) = (self.epochs.clone(), *epoch);
                match blocking(move || epochs.contents(epoch)).await? {
                Some(tids) => Message::EpochContentsIs { tids },
                    None => Message::failure(FailureReason::NotFound),
                }
            }
            Message::RecordReconciliation {
                peer,
                recno,
                epoch,
                accepted,
                rejected,
            } => {
                let entry = ReconciliationRecord {
                    recno: *recno,
                    epoch: *epoch,
                    accepted: accepted.clone(),
                    rejected: rejected.clone(),
                };
                let (ledgers, peer) = (self.ledgers.clone(), peer.clone());
                blocking(move || ledgers.record(&peer, entry)).await?
            }
            Message::RequestReconciliationRecord { peer, recno } => {
                let (ledgers, peer, recno) = (self.ledgers.clone(), peer.clone(), *recno);
                match blocking(move || ledgers.record_bytes(&peer, recno)).await? {
                    Some(bytes) => Message::ReconciliationRecordIs { bytes },
                    None => Message::failure(FailureReason::NotFound),
                }
            }
            Message::RequestMostRecentRecno { peer } => {
                let (ledgers, peer) = (self.ledgers.clone(), peer.clone());
                Message::MostRecentRecnoIs {
                    recno: blocking(move || ledgers.most_recent(&peer)).await?,
                }
            }
            Message::PublishTxn { txn } => {
                let (txns, txn) = (self.txns.clone(), txn.clone());
                blocking(move || txns.publish(&txn)).await?
            }
            Message::RequestTxnForReconciliation {
                tid,
                requesting_peer,
                as_of_recno,
                known_accepted,
            } => {
                self.txn_for_reconciliation(tid, requesting_peer, *as_of_recno, known_accepted)
                    .await?
            }
            other => Message::ReplyException {
                message: format!("not a request: {}", other.kind()),
            },
        };
        Ok(Some(answer))
    }

    /// Serve a transaction to a reconciling peer, unless its ledger already decided it.
    ///
    /// Decisions are looked up in the requester's ledger as of `as_of_recno`, which may be
    /// stored on yet another node.
    async fn txn_for_reconciliation(
        &self,
        tid: &TxnId,
        requesting_peer: &PeerId,
        as_of_recno: Option<Recno>,
        known_accepted: &BTreeSet<TxnId>,
    ) -> Result<Message, StoreError> {
        if known_accepted.contains(tid) {
            return Ok(Message::TxnNotNeeded);
        }
        let (txns, id) = (self.txns.clone(), tid.clone());
        let Some(txn) = blocking(move || txns.get(&id)).await? else {
            return Ok(Message::CheckForTxn { tid: tid.clone() });
        };
        match self.status(requesting_peer, as_of_recno, tid).await {
            TxnStatus::AcceptedAt(_) => return Ok(Message::TxnNotNeeded),
            TxnStatus::RejectedAt(_) => return Ok(Message::TxnAlreadyRejected),
            TxnStatus::Undecided => {}
        }
        let mut needed = BTreeSet::new();
        for antecedent in txn.antecedents() {
            if known_accepted.contains(&antecedent) || &antecedent.peer == requesting_peer {
                continue;
            }
            match self.status(requesting_peer, as_of_recno, &antecedent).await {
                TxnStatus::AcceptedAt(_) => {}
                TxnStatus::RejectedAt(_) => {
                    return Ok(Message::AntecedentTxnRejected { antecedent })
                }
                TxnStatus::Undecided => {
                    needed.insert(antecedent);
                }
            }
        }
        Ok(Message::RetrievedTxn {
            txn,
            priority: None,
            more_antecedents_needed: needed,
        })
    }

    async fn status(&self, peer: &PeerId, as_of_recno: Option<Recno>, tid: &TxnId) -> TxnStatus {
        let Some(recno) = as_of_recno else {
            return TxnStatus::Undecided;
        };
        match self.ledger.get_txn_status(peer, recno, tid, recno).await {
            Ok(status) => status,
            Err(err) => {
                // the requester resolves the transaction itself
                debug!(%tid, %peer, "status unavailable: {err:#}");
                TxnStatus::Undecided
            }
        }
    }
}

/// Run a storage call on the blocking thread pool, off the worker's async task.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| StoreError::Other(err.into()))?
}
