//! Epoch sequencing.
//!
//! Every published batch claims the next free epoch by creating the epoch's record on the
//! node responsible for it. Creation is create-if-absent, so at most one batch wins each
//! epoch. Losers learn a higher last epoch from the `CouldNotPublishEpoch` reply and try
//! again one above it. Every failed attempt strictly increases the candidate, so the
//! claimed epochs are dense and unique.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    directory::{Directory, RoutingKey},
    keys::{storage_key, Epoch, NodeId, TxnId},
    metrics::Metrics,
    proto::{FailureReason, Message, MessageId, MessageKind, UnexpectedReply},
    rpc::{RequestOpts, Rpc, RpcError},
    store::{self, with_deadlock_retry, PutOutcome, Store, StoreError},
};

/// Default bound on claim attempts of one [`EpochSequencer::publish_next_epoch`] call.
pub const DEFAULT_PUBLISH_ATTEMPTS: usize = 1024;

/// The locally known last epoch.
///
/// The value is a lower bound of the globally last claimed epoch. It only ever moves
/// forward and only to epochs that were actually claimed.
#[derive(Debug, Default)]
pub struct EpochAllocator {
    last_known: AtomicU64,
}

impl EpochAllocator {
    /// The best known last epoch.
    pub fn last_known(&self) -> Epoch {
        Epoch(self.last_known.load(Ordering::SeqCst))
    }

    /// Learn that `epoch` was claimed.
    pub fn note_epoch(&self, epoch: Epoch) {
        let prev = self.last_known.fetch_max(epoch.0, Ordering::SeqCst);
        if prev < epoch.0 {
            trace!(%epoch, "noted epoch");
        }
    }
}

/// Errors of [`EpochSequencer`].
#[derive(Debug, thiserror::Error)]
pub enum EpochError {
    /// Every claim attempt lost against a concurrent publisher.
    #[error("no epoch claimed after {attempts} attempts")]
    Exhausted {
        /// Attempts made.
        attempts: usize,
    },
    /// The node responsible for the epoch did not answer or could not serve it.
    #[error("epoch owner {node} unreachable: {reason:?}")]
    Unreachable {
        /// The responsible node.
        node: NodeId,
        /// The final reply.
        reason: Message,
    },
    /// The responsible node answered with something else.
    #[error(transparent)]
    UnexpectedReply(#[from] UnexpectedReply),
    /// The request was dropped.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Publishes batches under fresh epochs.
#[derive(derive_more::Debug, Clone)]
pub struct EpochSequencer {
    rpc: Rpc,
    #[debug("Directory")]
    directory: Arc<dyn Directory>,
    allocator: Arc<EpochAllocator>,
    opts: RequestOpts,
    max_attempts: usize,
    metrics: Arc<Metrics>,
}

impl EpochSequencer {
    /// Create a sequencer.
    pub fn new(
        rpc: Rpc,
        directory: Arc<dyn Directory>,
        allocator: Arc<EpochAllocator>,
        opts: RequestOpts,
        max_attempts: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            rpc,
            directory,
            allocator,
            opts,
            max_attempts,
            metrics,
        }
    }

    /// The local allocator.
    pub fn allocator(&self) -> &Arc<EpochAllocator> {
        &self.allocator
    }

    /// The best known last epoch, without asking anyone.
    pub fn last_known_epoch(&self) -> Epoch {
        self.allocator.last_known()
    }

    /// Claim the next free epoch for `tids`.
    ///
    /// On success the epoch is noted locally and gossiped to all other nodes.
    pub async fn publish_next_epoch(&self, tids: BTreeSet<TxnId>) -> Result<Epoch, EpochError> {
        let opts = self.opts.expecting(&[
            MessageKind::ReplySuccess,
            MessageKind::CouldNotPublishEpoch,
        ]);
        let mut last = self.allocator.last_known();
        for attempt in 0..self.max_attempts {
            let candidate = last.next();
            let owner = self
                .directory
                .responsible_for(&RoutingKey::Epoch(candidate));
            let reply = self
                .rpc
                .request(
                    owner,
                    Message::PublishEpoch {
                        epoch: candidate,
                        tids: tids.clone(),
                    },
                    opts,
                )
                .await?;
            if reply.exhausted {
                return Err(EpochError::Unreachable {
                    node: owner,
                    reason: reply.message,
                });
            }
            match reply.message {
                Message::ReplySuccess => {
                    debug!(epoch = %candidate, attempt, txns = tids.len(), "epoch claimed");
                    self.metrics.epochs_published.inc();
                    self.allocator.note_epoch(candidate);
                    self.broadcast(candidate);
                    return Ok(candidate);
                }
                Message::CouldNotPublishEpoch { actual_last } => {
                    trace!(epoch = %candidate, %actual_last, "epoch taken");
                    self.metrics.epoch_conflicts.inc();
                    last = actual_last.max(candidate);
                    self.allocator.note_epoch(last);
                }
                other => {
                    return Err(UnexpectedReply::new(MessageKind::PublishEpoch, &other).into())
                }
            }
        }
        Err(EpochError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    fn broadcast(&self, epoch: Epoch) {
        let me = self.rpc.node();
        for node in self.directory.nodes() {
            if node != me {
                self.rpc.send(node, Message::NoteEpoch { epoch });
            }
        }
    }

    /// Ask every node for its last known epoch and note the highest answer.
    ///
    /// Unreachable nodes are skipped, the result is still a valid lower bound.
    pub async fn refresh_last_epoch(&self) -> Result<Epoch, EpochError> {
        let opts = self.opts.expecting(&[MessageKind::LastEpochIs]);
        let requests = self
            .directory
            .nodes()
            .into_iter()
            .map(|node| (node, Message::RequestLastEpoch));
        for reply in self.rpc.request_all(requests, opts).await? {
            match reply.message {
                Message::LastEpochIs { epoch } if !reply.exhausted => {
                    self.allocator.note_epoch(epoch)
                }
                _ => debug!(node = %reply.from, "no last epoch"),
            }
        }
        Ok(self.allocator.last_known())
    }

    /// Read the batch published at `epoch` from its responsible node.
    ///
    /// Returns `None` if the epoch is not claimed. An owner that stays unreachable or keeps
    /// failing is reported as [`EpochError::Unreachable`].
    pub async fn epoch_contents(&self, epoch: Epoch) -> Result<Option<BTreeSet<TxnId>>, EpochError> {
        let owner = self.directory.responsible_for(&RoutingKey::Epoch(epoch));
        let reply = self
            .rpc
            .request(
                owner,
                Message::RequestEpochContents { epoch },
                self.opts
                    .expecting(&[MessageKind::EpochContentsIs, MessageKind::ReplyFailure]),
            )
            .await?;
        match reply.message {
            Message::EpochContentsIs { tids } if !reply.exhausted => Ok(Some(tids)),
            Message::ReplyFailure {
                reason: FailureReason::NotFound,
            } if !reply.exhausted => Ok(None),
            reason @ Message::ReplyFailure { .. } => Err(EpochError::Unreachable {
                node: owner,
                reason,
            }),
            other => Err(UnexpectedReply::new(MessageKind::RequestEpochContents, &other).into()),
        }
    }
}

/// Stored value of a claimed epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EpochRecord {
    /// The claiming request. Retries and duplicates of it carry the same id.
    claimed_by: MessageId,
    tids: BTreeSet<TxnId>,
}

/// The storage side of epoch sequencing, run on the node responsible for an epoch.
#[derive(Debug, Clone)]
pub struct EpochStore<S> {
    store: S,
    allocator: Arc<EpochAllocator>,
}

impl<S: Store> EpochStore<S> {
    /// Serve epochs from `store`.
    pub fn new(store: S, allocator: Arc<EpochAllocator>) -> Self {
        Self { store, allocator }
    }

    /// Handle `PublishEpoch` sent as request `request`.
    ///
    /// Answers `ReplySuccess` if the epoch is now claimed by this request, including when a
    /// retry finds its own earlier write.
    pub fn publish(
        &self,
        request: MessageId,
        epoch: Epoch,
        tids: BTreeSet<TxnId>,
    ) -> Result<Message, StoreError> {
        let key = storage_key::epoch(epoch);
        let value = store::encode(&EpochRecord {
            claimed_by: request,
            tids,
        })?;
        let claimed = with_deadlock_retry(&self.store, |tx| {
            Ok(match tx.put_if_absent(&key, &value)? {
                PutOutcome::Created => true,
                PutOutcome::AlreadyExists(existing) => existing == value,
            })
        })?;
        // the epoch is taken either way
        self.allocator.note_epoch(epoch);
        if claimed {
            Ok(Message::ReplySuccess)
        } else {
            Ok(Message::CouldNotPublishEpoch {
                actual_last: self.allocator.last_known().max(epoch),
            })
        }
    }

    /// Handle `RequestEpochContents`.
    pub fn contents(&self, epoch: Epoch) -> Result<Option<BTreeSet<TxnId>>, StoreError> {
        self.store
            .get(&storage_key::epoch(epoch))?
            .map(|bytes| store::decode::<EpochRecord>(&bytes).map(|r| r.tids))
            .transpose()
    }

    /// The local allocator.
    pub fn allocator(&self) -> &Arc<EpochAllocator> {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::{
        directory::StaticDirectory,
        net::mem::{Faults, MemNetwork},
        store::memory,
        test_utils::spawn_service,
    };

    /// Starts `nodes` nodes that only speak the epoch protocol.
    fn cluster(net: &MemNetwork, nodes: u64, opts: RequestOpts) -> Vec<EpochSequencer> {
        let directory: Arc<dyn Directory> = Arc::new(StaticDirectory::new((0..nodes).map(NodeId)));
        (0..nodes)
            .map(|i| {
                let allocator = Arc::new(EpochAllocator::default());
                let epochs = EpochStore::new(memory::Store::default(), allocator.clone());
                let rpc = spawn_service(net, NodeId(i), move |envelope| {
                    Some(match envelope.message.clone() {
                        Message::PublishEpoch { epoch, tids } => {
                            epochs.publish(envelope.id, epoch, tids).unwrap()
                        }
                        Message::RequestLastEpoch => Message::LastEpochIs {
                            epoch: epochs.allocator().last_known(),
                        },
                        Message::NoteEpoch { epoch } => {
                            epochs.allocator().note_epoch(epoch);
                            return None;
                        }
                        Message::RequestEpochContents { epoch } => {
                            match epochs.contents(epoch).unwrap() {
                                Some(tids) => Message::EpochContentsIs { tids },
                                None => Message::failure(FailureReason::NotFound),
                            }
                        }
                        other => panic!("unexpected {other:?}"),
                    })
                });
                EpochSequencer::new(
                    rpc,
                    directory.clone(),
                    allocator,
                    opts,
                    DEFAULT_PUBLISH_ATTEMPTS,
                    Default::default(),
                )
            })
            .collect()
    }

    fn opts() -> RequestOpts {
        RequestOpts {
            retry_delay: Duration::from_millis(5),
            max_retries: 20,
            timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sequential_publishes_are_dense() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let nodes = cluster(&net, 3, opts());
        let mut seq = 0;
        for round in 1..=6u64 {
            let publisher = &nodes[(round % 3) as usize];
            let epoch = publisher
                .publish_next_epoch(BTreeSet::from([TxnId::new(1, seq)]))
                .await?;
            seq += 1;
            assert_eq!(epoch, Epoch(round));
        }
        let contents = nodes[0].epoch_contents(Epoch(2)).await?;
        assert_eq!(contents, Some(BTreeSet::from([TxnId::new(1, 1)])));
        assert_eq!(nodes[0].epoch_contents(Epoch(99)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn stale_publisher_catches_up() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let nodes = cluster(&net, 2, opts());
        for seq in 0..3 {
            nodes[0]
                .publish_next_epoch(BTreeSet::from([TxnId::new(0, seq)]))
                .await?;
        }
        // forget the gossip
        let stale = EpochSequencer::new(
            nodes[1].rpc.clone(),
            nodes[1].directory.clone(),
            Arc::new(EpochAllocator::default()),
            opts(),
            DEFAULT_PUBLISH_ATTEMPTS,
            Default::default(),
        );
        let epoch = stale
            .publish_next_epoch(BTreeSet::from([TxnId::new(1, 0)]))
            .await?;
        assert_eq!(epoch, Epoch(4));
        Ok(())
    }

    #[tokio::test]
    async fn capped_attempts_are_reported() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let nodes = cluster(&net, 1, opts());
        nodes[0]
            .publish_next_epoch(BTreeSet::from([TxnId::new(0, 0)]))
            .await?;
        let stale = EpochSequencer::new(
            nodes[0].rpc.clone(),
            nodes[0].directory.clone(),
            Arc::new(EpochAllocator::default()),
            opts(),
            1,
            Default::default(),
        );
        let res = stale
            .publish_next_epoch(BTreeSet::from([TxnId::new(0, 1)]))
            .await;
        assert!(matches!(res, Err(EpochError::Exhausted { attempts: 1 })));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_learns_remote_epochs() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let nodes = cluster(&net, 3, opts());
        nodes[0]
            .publish_next_epoch(BTreeSet::from([TxnId::new(0, 0)]))
            .await?;
        let fresh = EpochSequencer::new(
            nodes[2].rpc.clone(),
            nodes[2].directory.clone(),
            Arc::new(EpochAllocator::default()),
            opts(),
            DEFAULT_PUBLISH_ATTEMPTS,
            Default::default(),
        );
        assert_eq!(fresh.refresh_last_epoch().await?, Epoch(1));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_epoch_owner_is_an_error() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let nodes = cluster(&net, 2, opts());
        nodes[0]
            .publish_next_epoch(BTreeSet::from([TxnId::new(0, 0)]))
            .await?;
        let owner = nodes[0]
            .directory
            .responsible_for(&RoutingKey::Epoch(Epoch(1)));
        net.set_offline(owner, true);
        let res = nodes[0].epoch_contents(Epoch(1)).await;
        assert!(matches!(res, Err(EpochError::Unreachable { node, .. }) if node == owner));

        net.set_offline(owner, false);
        assert_eq!(nodes[0].epoch_contents(Epoch(2)).await?, None);
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn concurrent_publishes_claim_dense_epochs(
            publishers in 1u64..4,
            per_publisher in 1u32..5,
            seed in any::<u64>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let mut claimed = rt.block_on(async move {
                let faults = Faults {
                    drop_rate: 0.05,
                    duplicate_rate: 0.2,
                    max_delay: Some(Duration::from_millis(3)),
                };
                let net = MemNetwork::new(faults, seed);
                let nodes = cluster(&net, publishers, opts());
                let tasks: Vec<_> = nodes
                    .into_iter()
                    .enumerate()
                    .map(|(i, sequencer)| {
                        tokio::spawn(async move {
                            let mut out = Vec::new();
                            for seq in 0..per_publisher {
                                let tids = BTreeSet::from([TxnId::new(i as i32, seq)]);
                                out.push(sequencer.publish_next_epoch(tids).await.unwrap());
                            }
                            out
                        })
                    })
                    .collect();
                let mut claimed = Vec::new();
                for task in tasks {
                    claimed.extend(task.await.unwrap());
                }
                claimed
            });
            claimed.sort();
            let expected: Vec<_> = (1..=publishers * per_publisher as u64).map(Epoch).collect();
            prop_assert_eq!(claimed, expected);
        }
    }
}
