//! Worker pool processing inbound messages from a single ingress queue.
//!
//! Handlers may wait for replies to requests they sent themselves, and those replies arrive
//! through the same queue. If every worker is waiting, nobody is left to process the replies.
//! A supervisor therefore watches the pool and spawns one more worker whenever all workers are
//! blocked on a reply while messages are queued.
//!
//! The pool can grow without bound under pathological load. This is an accepted tradeoff
//! for never deadlocking on nested requests.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{metrics::Metrics, net::Inbox, proto::Envelope};

tokio::task_local! {
    static POOL: Arc<PoolStats>;
}

#[derive(Debug, Default)]
struct PoolStats {
    workers: AtomicUsize,
    blocked: AtomicUsize,
}

/// Marks the current worker as blocked on a reply until dropped.
#[derive(Debug)]
pub(crate) struct BlockedGuard(Arc<PoolStats>);

impl Drop for BlockedGuard {
    fn drop(&mut self) {
        self.0.blocked.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Account the current task as blocked, if it is a pool worker.
pub(crate) fn enter_blocked() -> Option<BlockedGuard> {
    POOL.try_with(|stats| {
        stats.blocked.fetch_add(1, Ordering::SeqCst);
        BlockedGuard(stats.clone())
    })
    .ok()
}

/// Processes one inbound envelope.
pub trait Handler: Send + Sync + 'static {
    /// Handle `envelope`. May await replies to nested requests.
    fn handle(&self, envelope: Envelope) -> impl Future<Output = ()> + Send;
}

/// Sizing of a [`WorkerPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolOpts {
    /// Workers started up front.
    pub initial_workers: usize,
    /// How often the supervisor checks for a stalled pool.
    pub stall_check_interval: Duration,
}

impl Default for PoolOpts {
    fn default() -> Self {
        Self {
            initial_workers: 4,
            stall_check_interval: Duration::from_millis(50),
        }
    }
}

/// The single ingress queue of a node.
///
/// Created before the pool so transports can be handed the inbox first.
#[derive(Debug, Clone)]
pub struct Ingress {
    inbox: async_channel::Sender<Envelope>,
    queue: async_channel::Receiver<Envelope>,
}

impl Default for Ingress {
    fn default() -> Self {
        Self::new()
    }
}

impl Ingress {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        let (inbox, queue) = async_channel::unbounded();
        Self { inbox, queue }
    }

    /// Where transports deliver inbound envelopes.
    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }
}

/// A growable pool of worker tasks.
#[derive(Debug)]
pub struct WorkerPool {
    inbox: async_channel::Sender<Envelope>,
    stats: Arc<PoolStats>,
    _supervisor: AbortOnDropHandle<()>,
}

impl WorkerPool {
    /// Start the pool and its supervisor.
    pub fn spawn<H: Handler>(
        handler: Arc<H>,
        ingress: Ingress,
        opts: PoolOpts,
        metrics: Arc<Metrics>,
    ) -> Self {
        let Ingress { inbox, queue } = ingress;
        let stats = Arc::new(PoolStats::default());
        for _ in 0..opts.initial_workers.max(1) {
            spawn_worker(queue.clone(), handler.clone(), stats.clone());
        }
        let supervisor = tokio::spawn(
            supervise(queue, handler, stats.clone(), opts, metrics)
                .instrument(error_span!("supervisor")),
        );
        Self {
            inbox,
            stats,
            _supervisor: AbortOnDropHandle::new(supervisor),
        }
    }

    /// The ingress queue. Transports deliver inbound envelopes here.
    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    /// Number of running workers.
    pub fn workers(&self) -> usize {
        self.stats.workers.load(Ordering::SeqCst)
    }

    /// Number of workers currently blocked on a reply.
    pub fn blocked(&self) -> usize {
        self.stats.blocked.load(Ordering::SeqCst)
    }

    /// Stop accepting messages. Workers exit once the queue is drained.
    pub fn close(&self) {
        self.inbox.close();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inbox.close();
    }
}

fn spawn_worker<H: Handler>(
    queue: async_channel::Receiver<Envelope>,
    handler: Arc<H>,
    stats: Arc<PoolStats>,
) {
    let id = stats.workers.fetch_add(1, Ordering::SeqCst);
    let scope = stats.clone();
    tokio::spawn(
        POOL.scope(scope, async move {
            while let Ok(envelope) = queue.recv().await {
                trace!(id = %envelope.id, kind = %envelope.message.kind(), "handle");
                handler.handle(envelope).await;
            }
            stats.workers.fetch_sub(1, Ordering::SeqCst);
            debug!("worker exit");
        })
        .instrument(error_span!("worker", id)),
    );
}

async fn supervise<H: Handler>(
    queue: async_channel::Receiver<Envelope>,
    handler: Arc<H>,
    stats: Arc<PoolStats>,
    opts: PoolOpts,
    metrics: Arc<Metrics>,
) {
    let mut interval = tokio::time::interval(opts.stall_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if queue.is_closed() {
            break;
        }
        let workers = stats.workers.load(Ordering::SeqCst);
        let blocked = stats.blocked.load(Ordering::SeqCst);
        if blocked >= workers && !queue.is_empty() {
            warn!(workers, queued = queue.len(), "all workers blocked, spawning another");
            metrics.workers_spawned_on_stall.inc();
            spawn_worker(queue.clone(), handler.clone(), stats.clone());
        }
    }
}
