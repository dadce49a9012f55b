//! Request/reply on top of one-way, lossy messaging.
//!
//! Every outstanding request owns one entry in a concurrent pending table keyed by its
//! [`MessageId`]. An entry moves through the following states:
//!
//! - *awaiting reply*: the request was sent and a timeout is armed.
//! - *retry scheduled*: a failure reply (or timeout) arrived while retries remain. The
//!   original envelope is resent after [`RequestOpts::retry_delay`]. Failure replies
//!   arriving in between are discarded, a success reply cancels the resend and is
//!   delivered.
//! - *finished*: a success reply was delivered and the continuation reported
//!   [`Progress::Finished`], or retries were exhausted and the final failure reply was
//!   delivered. The entry is removed and later replies or timers are ignored.
//!
//! All transitions happen under the entry's own lock, never a table wide one, so two
//! replies racing for the same request cannot both finish it.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, trace};

use crate::{
    keys::NodeId,
    metrics::Metrics,
    net::Transport,
    proto::{Envelope, FailureReason, Message, MessageId, MessageKind},
    workers,
};

/// Parameters of one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestOpts {
    /// Delay before resending after a failure.
    pub retry_delay: Duration,
    /// How often the request is resent before giving up.
    pub max_retries: u32,
    /// How long to wait for a reply to each attempt.
    pub timeout: Duration,
    /// Reply kinds that count as success. Anything else is a failure, and so is a
    /// transient [`Message::ReplyFailure`] even if `ReplyFailure` is listed here.
    pub success: &'static [MessageKind],
}

impl Default for RequestOpts {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(100),
            max_retries: 3,
            timeout: Duration::from_secs(2),
            success: &[MessageKind::ReplySuccess],
        }
    }
}

impl RequestOpts {
    /// Same options with a different set of success kinds.
    pub fn expecting(self, success: &'static [MessageKind]) -> Self {
        Self { success, ..self }
    }

    /// Whether `message` ends the request as a success.
    pub fn accepts(&self, message: &Message) -> bool {
        self.success.contains(&message.kind()) && !message.is_transient_failure()
    }
}

/// A reply handed to a [`Continuation`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The node that sent the reply. For timeouts, the node the request was sent to.
    pub from: NodeId,
    /// The reply payload.
    pub message: Message,
    /// Set when retries were exhausted and `message` is the final failure.
    pub exhausted: bool,
}

impl Reply {
    /// Whether the reply is of one of the given kinds and not a final failure.
    pub fn is_one_of(&self, kinds: &[MessageKind]) -> bool {
        !self.exhausted && kinds.contains(&self.message.kind())
    }
}

/// Whether a continuation is done with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Remove the request.
    Finished,
    /// Keep waiting for more replies to the same request.
    Pending,
}

/// Receives the replies of one request.
pub trait Continuation: Send + 'static {
    /// Called with each delivered reply.
    fn deliver(&mut self, reply: Reply) -> Progress;
}

impl<F> Continuation for F
where
    F: FnMut(Reply) -> Progress + Send + 'static,
{
    fn deliver(&mut self, reply: Reply) -> Progress {
        (self)(reply)
    }
}

/// Errors of the async request helpers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The request was dropped before a reply was delivered.
    #[error("request {0} dropped without a reply")]
    Dropped(MessageId),
}

/// State of one outstanding request.
struct ReplyData {
    request: Envelope,
    continuation: Box<dyn Continuation>,
    retries_remaining: u32,
    timeout_handle: Option<JoinHandle<()>>,
    opts: RequestOpts,
    retry_scheduled: bool,
    finished: bool,
    /// Bumped on each attempt so stale timers can be recognised.
    generation: u64,
}

impl fmt::Debug for ReplyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyData")
            .field("id", &self.request.id)
            .field("retries_remaining", &self.retries_remaining)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ReplyData {
    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timeout_handle.take() {
            handle.abort();
        }
    }
}

#[derive(derive_more::Debug)]
struct Inner {
    node: NodeId,
    #[debug("Transport")]
    transport: Arc<dyn Transport>,
    pending: DashMap<MessageId, Arc<Mutex<ReplyData>>>,
    next_seq: AtomicU64,
    metrics: Arc<Metrics>,
}

/// The request/reply substrate of one node.
#[derive(Debug, Clone)]
pub struct Rpc {
    inner: Arc<Inner>,
}

impl Rpc {
    /// Create the substrate for `node`, sending through `transport`.
    pub fn new(node: NodeId, transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                node,
                transport,
                pending: DashMap::new(),
                next_seq: AtomicU64::new(0),
                metrics,
            }),
        }
    }

    /// The local node.
    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    fn next_id(&self) -> MessageId {
        MessageId {
            from: self.inner.node,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn transmit(&self, envelope: Envelope) {
        trace!(to = %envelope.to, id = %envelope.id, kind = %envelope.message.kind(), "send");
        if let Err(err) = self.inner.transport.send(envelope) {
            // loss is handled by timeouts
            debug!("transport refused message: {err:#}");
        }
    }

    /// Fire and forget.
    pub fn send(&self, to: NodeId, message: Message) {
        let envelope = Envelope {
            id: self.next_id(),
            from: self.inner.node,
            to,
            reply_to: None,
            message,
        };
        self.transmit(envelope);
    }

    /// Answer `request` with `message`.
    pub fn reply(&self, request: &Envelope, message: Message) {
        let envelope = Envelope {
            id: self.next_id(),
            from: self.inner.node,
            to: request.from,
            reply_to: Some(request.id),
            message,
        };
        self.transmit(envelope);
    }

    /// Send `message` to `to` and deliver its replies to `continuation`.
    ///
    /// Failure replies and timeouts are retried as configured in `opts`. Once retries are
    /// exhausted the continuation receives the final failure with [`Reply::exhausted`] set;
    /// it never sees an error.
    pub fn send_await_reply(
        &self,
        to: NodeId,
        message: Message,
        continuation: impl Continuation,
        opts: RequestOpts,
    ) -> MessageId {
        let id = self.next_id();
        let request = Envelope {
            id,
            from: self.inner.node,
            to,
            reply_to: None,
            message,
        };
        let entry = Arc::new(Mutex::new(ReplyData {
            request: request.clone(),
            continuation: Box::new(continuation),
            retries_remaining: opts.max_retries,
            timeout_handle: None,
            opts,
            retry_scheduled: false,
            finished: false,
            generation: 0,
        }));
        // registered before sending, so a fast reply finds its entry
        self.inner.pending.insert(id, entry.clone());
        let mut data = entry.lock();
        self.inner.metrics.requests_sent.inc();
        self.transmit(request);
        self.arm_timeout(id, &mut data);
        id
    }

    /// Route an inbound reply to its request. Returns `false` if `envelope` is not a reply.
    pub fn handle_reply(&self, envelope: Envelope) -> bool {
        let Some(reply_to) = envelope.reply_to else {
            return false;
        };
        let entry = self.inner.pending.get(&reply_to).map(|e| e.value().clone());
        let Some(entry) = entry else {
            trace!(id = %reply_to, "reply for unknown or finished request discarded");
            self.inner.metrics.replies_discarded.inc();
            return true;
        };
        let mut data = entry.lock();
        if data.finished || (data.retry_scheduled && !data.opts.accepts(&envelope.message)) {
            trace!(id = %reply_to, "reply discarded");
            self.inner.metrics.replies_discarded.inc();
            return true;
        }
        if data.retry_scheduled {
            // a late success overtakes the pending resend
            data.retry_scheduled = false;
            data.cancel_timer();
            data.generation += 1;
        }
        let reply = Reply {
            from: envelope.from,
            message: envelope.message,
            exhausted: false,
        };
        self.process(reply_to, &mut data, reply, false);
        true
    }

    fn process(&self, id: MessageId, data: &mut ReplyData, mut reply: Reply, timed_out: bool) {
        let success = !timed_out && data.opts.accepts(&reply.message);
        if success || data.retries_remaining == 0 {
            reply.exhausted = !success;
            if reply.exhausted {
                debug!(%id, kind = %reply.message.kind(), "retries exhausted");
                self.inner.metrics.requests_exhausted.inc();
            }
            let progress = data.continuation.deliver(reply);
            if !success || progress == Progress::Finished {
                self.finish(id, data);
            } else {
                self.arm_timeout(id, data);
            }
        } else {
            data.retries_remaining -= 1;
            data.retry_scheduled = true;
            data.cancel_timer();
            data.generation += 1;
            let generation = data.generation;
            trace!(%id, remaining = data.retries_remaining, "scheduling retry");
            let rpc = self.clone();
            let delay = data.opts.retry_delay;
            data.timeout_handle = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                rpc.resend(id, generation);
            }));
        }
    }

    fn resend(&self, id: MessageId, generation: u64) {
        let Some(entry) = self.inner.pending.get(&id).map(|e| e.value().clone()) else {
            return;
        };
        let mut data = entry.lock();
        if data.finished || data.generation != generation {
            return;
        }
        data.retry_scheduled = false;
        // the handle of the task running this function, dropping it does not abort us
        data.timeout_handle = None;
        self.inner.metrics.requests_sent.inc();
        self.inner.metrics.requests_retried.inc();
        self.transmit(data.request.clone());
        self.arm_timeout(id, &mut data);
    }

    fn arm_timeout(&self, id: MessageId, data: &mut ReplyData) {
        data.cancel_timer();
        data.generation += 1;
        let generation = data.generation;
        let timeout = data.opts.timeout;
        let rpc = self.clone();
        data.timeout_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            rpc.on_timeout(id, generation);
        }));
    }

    fn on_timeout(&self, id: MessageId, generation: u64) {
        let Some(entry) = self.inner.pending.get(&id).map(|e| e.value().clone()) else {
            return;
        };
        let mut data = entry.lock();
        if data.finished || data.retry_scheduled || data.generation != generation {
            return;
        }
        // the handle of the task running this function
        data.timeout_handle = None;
        debug!(%id, to = %data.request.to, "request timed out");
        let reply = Reply {
            from: data.request.to,
            message: Message::failure(FailureReason::TimedOut),
            exhausted: false,
        };
        self.process(id, &mut data, reply, true);
    }

    fn finish(&self, id: MessageId, data: &mut ReplyData) {
        data.finished = true;
        data.cancel_timer();
        self.inner.pending.remove(&id);
        trace!(%id, "request finished");
    }

    /// Send a request and wait for its final reply.
    ///
    /// While waiting, a worker task is accounted as blocked, see [`crate::workers`].
    pub async fn request(
        &self,
        to: NodeId,
        message: Message,
        opts: RequestOpts,
    ) -> Result<Reply, RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let id = self.send_await_reply(
            to,
            message,
            move |reply: Reply| {
                if let Some(tx) = tx.take() {
                    tx.send(reply).ok();
                }
                Progress::Finished
            },
            opts,
        );
        let _blocked = workers::enter_blocked();
        rx.await.map_err(|_| RpcError::Dropped(id))
    }

    /// Send several requests at once and wait for all final replies, in request order.
    pub async fn request_all(
        &self,
        requests: impl IntoIterator<Item = (NodeId, Message)>,
        opts: RequestOpts,
    ) -> Result<Vec<Reply>, RpcError> {
        let receivers: Vec<_> = requests
            .into_iter()
            .map(|(to, message)| {
                let (tx, rx) = oneshot::channel();
                let mut tx = Some(tx);
                let id = self.send_await_reply(
                    to,
                    message,
                    move |reply: Reply| {
                        if let Some(tx) = tx.take() {
                            tx.send(reply).ok();
                        }
                        Progress::Finished
                    },
                    opts,
                );
                async move { rx.await.map_err(|_| RpcError::Dropped(id)) }
            })
            .collect();
        let _blocked = workers::enter_blocked();
        futures::future::join_all(receivers)
            .await
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::net::mem::MemNetwork;

    /// A node that answers every request with a fixed message.
    fn echo_node(net: &MemNetwork, node: NodeId, answer: Message) -> Rpc {
        let (tx, rx) = async_channel::unbounded();
        let rpc = Rpc::new(node, Arc::new(net.register(node, tx)), Default::default());
        let server = rpc.clone();
        tokio::spawn(async move {
            while let Ok(envelope) = rx.recv().await {
                if !server.handle_reply(envelope.clone()) {
                    server.reply(&envelope, answer.clone());
                }
            }
        });
        rpc
    }

    fn client(net: &MemNetwork, node: NodeId) -> Rpc {
        let (tx, rx) = async_channel::unbounded();
        let rpc = Rpc::new(node, Arc::new(net.register(node, tx)), Default::default());
        let client = rpc.clone();
        tokio::spawn(async move {
            while let Ok(envelope) = rx.recv().await {
                client.handle_reply(envelope);
            }
        });
        rpc
    }

    fn opts(max_retries: u32) -> RequestOpts {
        RequestOpts {
            retry_delay: Duration::from_millis(10),
            max_retries,
            timeout: Duration::from_millis(200),
            success: &[MessageKind::ReplySuccess],
        }
    }

    #[tokio::test]
    async fn request_success() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let _server = echo_node(&net, NodeId(1), Message::ReplySuccess);
        let rpc = client(&net, NodeId(0));
        let reply = rpc
            .request(NodeId(1), Message::RequestLastEpoch, opts(0))
            .await?;
        assert_eq!(reply.message, Message::ReplySuccess);
        assert!(!reply.exhausted);
        assert_eq!(rpc.pending_requests(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn retries_are_exhausted_after_max_retries_plus_one_sends() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let failure = Message::failure(FailureReason::NotFound);
        let _server = echo_node(&net, NodeId(1), failure.clone());
        let rpc = client(&net, NodeId(0));

        let reply = rpc
            .request(NodeId(1), Message::RequestLastEpoch, opts(4))
            .await?;
        assert!(reply.exhausted);
        assert_eq!(reply.message, failure);

        let attempts = net
            .sent()
            .iter()
            .filter(|e| e.from == NodeId(0) && e.message == Message::RequestLastEpoch)
            .count();
        assert_eq!(attempts, 5);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_failures() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let _server = echo_node(&net, NodeId(1), Message::ReplySuccess);
        net.set_offline(NodeId(1), true);
        let rpc = client(&net, NodeId(0));

        let reply = rpc
            .request(NodeId(1), Message::RequestLastEpoch, opts(2))
            .await?;
        assert!(reply.exhausted);
        assert_eq!(reply.message, Message::failure(FailureReason::TimedOut));
        assert_eq!(net.sent().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_replies_are_delivered_once() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let (tx, _rx) = async_channel::unbounded();
        let rpc = Rpc::new(
            NodeId(0),
            Arc::new(net.register(NodeId(0), tx)),
            Default::default(),
        );
        let (server_tx, server_rx) = async_channel::unbounded();
        let _server = net.register(NodeId(1), server_tx);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        rpc.send_await_reply(
            NodeId(1),
            Message::RequestLastEpoch,
            move |_reply: Reply| {
                counter.fetch_add(1, Ordering::SeqCst);
                Progress::Finished
            },
            opts(0),
        );
        let request = server_rx.recv().await?;
        let reply = Envelope {
            id: MessageId {
                from: NodeId(1),
                seq: 0,
            },
            from: NodeId(1),
            to: NodeId(0),
            reply_to: Some(request.id),
            message: Message::ReplySuccess,
        };

        let a = rpc.clone();
        let b = rpc.clone();
        let (ra, rb) = (reply.clone(), reply);
        let t1 = tokio::task::spawn_blocking(move || a.handle_reply(ra));
        let t2 = tokio::task::spawn_blocking(move || b.handle_reply(rb));
        assert!(t1.await?);
        assert!(t2.await?);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rpc.pending_requests(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn pending_continuations_receive_more_replies() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let (tx, _rx) = async_channel::unbounded();
        let rpc = Rpc::new(
            NodeId(0),
            Arc::new(net.register(NodeId(0), tx)),
            Default::default(),
        );
        let (server_tx, server_rx) = async_channel::unbounded();
        let _server = net.register(NodeId(1), server_tx);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        rpc.send_await_reply(
            NodeId(1),
            Message::RequestLastEpoch,
            move |_reply: Reply| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Progress::Pending
                } else {
                    Progress::Finished
                }
            },
            opts(0),
        );
        let request = server_rx.recv().await?;
        for seq in 0..3 {
            rpc.handle_reply(Envelope {
                id: MessageId {
                    from: NodeId(1),
                    seq,
                },
                from: NodeId(1),
                to: NodeId(0),
                reply_to: Some(request.id),
                message: Message::ReplySuccess,
            });
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(rpc.pending_requests(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_cancels_scheduled_retry() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let (tx, _rx) = async_channel::unbounded();
        let rpc = Rpc::new(
            NodeId(0),
            Arc::new(net.register(NodeId(0), tx)),
            Default::default(),
        );
        let (server_tx, server_rx) = async_channel::unbounded();
        let _server = net.register(NodeId(1), server_tx);

        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        rpc.send_await_reply(
            NodeId(1),
            Message::RequestLastEpoch,
            move |reply: Reply| {
                sink.lock().push(reply);
                Progress::Finished
            },
            RequestOpts {
                retry_delay: Duration::from_millis(300),
                max_retries: 1,
                timeout: Duration::from_millis(30),
                success: &[MessageKind::ReplySuccess],
            },
        );
        let request = server_rx.recv().await?;

        // the first attempt timed out, the resend is still waiting
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(got.lock().is_empty());
        rpc.handle_reply(Envelope {
            id: MessageId {
                from: NodeId(1),
                seq: 0,
            },
            from: NodeId(1),
            to: NodeId(0),
            reply_to: Some(request.id),
            message: Message::ReplySuccess,
        });
        assert_eq!(
            *got.lock(),
            vec![Reply {
                from: NodeId(1),
                message: Message::ReplySuccess,
                exhausted: false,
            }]
        );
        assert_eq!(rpc.pending_requests(), 0);

        // no resend after the retry delay
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(server_rx.is_empty());
        assert_eq!(got.lock().len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failures_during_scheduled_retry_are_discarded() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let (tx, _rx) = async_channel::unbounded();
        let rpc = Rpc::new(
            NodeId(0),
            Arc::new(net.register(NodeId(0), tx)),
            Default::default(),
        );
        let (server_tx, server_rx) = async_channel::unbounded();
        let _server = net.register(NodeId(1), server_tx);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        rpc.send_await_reply(
            NodeId(1),
            Message::RequestLastEpoch,
            move |_reply: Reply| {
                counter.fetch_add(1, Ordering::SeqCst);
                Progress::Finished
            },
            RequestOpts {
                retry_delay: Duration::from_millis(300),
                max_retries: 1,
                timeout: Duration::from_millis(30),
                success: &[MessageKind::ReplySuccess],
            },
        );
        let request = server_rx.recv().await?;
        tokio::time::sleep(Duration::from_millis(80)).await;
        rpc.handle_reply(Envelope {
            id: MessageId {
                from: NodeId(1),
                seq: 0,
            },
            from: NodeId(1),
            to: NodeId(0),
            reply_to: Some(request.id),
            message: Message::failure(FailureReason::NotFound),
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // the resend still goes out
        let resent = server_rx.recv().await?;
        assert_eq!(resent.id, request.id);
        Ok(())
    }

    #[tokio::test]
    async fn transient_failures_are_retried_even_when_expected() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let deadlock = Message::failure(FailureReason::Deadlock);
        let _server = echo_node(&net, NodeId(1), deadlock.clone());
        let _structural = echo_node(&net, NodeId(2), Message::failure(FailureReason::NotFound));
        let rpc = client(&net, NodeId(0));
        let opts = opts(2).expecting(&[MessageKind::ReplySuccess, MessageKind::ReplyFailure]);

        let reply = rpc.request(NodeId(1), Message::RequestLastEpoch, opts).await?;
        assert!(reply.exhausted);
        assert_eq!(reply.message, deadlock);

        let reply = rpc.request(NodeId(2), Message::RequestLastEpoch, opts).await?;
        assert!(!reply.exhausted);
        assert_eq!(reply.message, Message::failure(FailureReason::NotFound));

        let attempts = |to: NodeId| {
            net.sent()
                .iter()
                .filter(|e| e.to == to && e.message == Message::RequestLastEpoch)
                .count()
        };
        assert_eq!(attempts(NodeId(1)), 3);
        assert_eq!(attempts(NodeId(2)), 1);
        Ok(())
    }

    #[tokio::test]
    async fn request_all_preserves_order() -> anyhow::Result<()> {
        let net = MemNetwork::default();
        let _a = echo_node(&net, NodeId(1), Message::ReplySuccess);
        let _b = echo_node(&net, NodeId(2), Message::TxnNotNeeded);
        let rpc = client(&net, NodeId(0));
        let replies = rpc
            .request_all(
                [
                    (NodeId(1), Message::RequestLastEpoch),
                    (NodeId(2), Message::RequestLastEpoch),
                ],
                opts(0).expecting(&[MessageKind::ReplySuccess, MessageKind::TxnNotNeeded]),
            )
            .await?;
        assert_eq!(replies[0].from, NodeId(1));
        assert_eq!(replies[1].message, Message::TxnNotNeeded);
        Ok(())
    }
}
