//! In process network for tests and simulations.
//!
//! The network can drop, duplicate and delay messages and take nodes offline, which is
//! how the retry, timeout and idempotency paths of the substrate are exercised.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;

use super::{Inbox, Transport};
use crate::{keys::NodeId, proto::Envelope};

/// Fault injection settings for a [`MemNetwork`].
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Probability that a message is silently lost.
    pub drop_rate: f64,
    /// Probability that a delivered message is delivered twice.
    pub duplicate_rate: f64,
    /// Upper bound of a random per message delivery delay.
    pub max_delay: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    inboxes: HashMap<NodeId, Inbox>,
    offline: HashMap<NodeId, bool>,
    faults: Faults,
    rng: StdRng,
    sent: Vec<Envelope>,
}

/// An in process network connecting any number of nodes.
#[derive(Debug, Clone)]
pub struct MemNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemNetwork {
    fn default() -> Self {
        Self::new(Faults::default(), 0)
    }
}

impl MemNetwork {
    /// Create a network with the given faults, seeded for reproducibility.
    pub fn new(faults: Faults, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                inboxes: HashMap::new(),
                offline: HashMap::new(),
                faults,
                rng: StdRng::seed_from_u64(seed),
                sent: Vec::new(),
            })),
        }
    }

    /// Attach a node, returning the transport it sends through.
    pub fn register(&self, node: NodeId, inbox: Inbox) -> MemTransport {
        self.inner.lock().inboxes.insert(node, inbox);
        MemTransport {
            network: self.clone(),
        }
    }

    /// Take a node off the network (messages to it are lost) or bring it back.
    pub fn set_offline(&self, node: NodeId, offline: bool) {
        self.inner.lock().offline.insert(node, offline);
    }

    /// Replace the fault settings.
    pub fn set_faults(&self, faults: Faults) {
        self.inner.lock().faults = faults;
    }

    /// Every envelope handed to the network so far, including lost ones.
    pub fn sent(&self) -> Vec<Envelope> {
        self.inner.lock().sent.clone()
    }

    fn route(&self, envelope: Envelope) -> anyhow::Result<()> {
        let (inbox, copies, delay) = {
            let mut inner = self.inner.lock();
            inner.sent.push(envelope.clone());
            let inbox = inner
                .inboxes
                .get(&envelope.to)
                .cloned()
                .with_context(|| format!("unknown node {}", envelope.to))?;
            if inner.offline.get(&envelope.to).copied().unwrap_or(false) {
                trace!(to = %envelope.to, id = %envelope.id, "node offline, message lost");
                return Ok(());
            }
            let faults = inner.faults.clone();
            if faults.drop_rate > 0.0 && inner.rng.gen_bool(faults.drop_rate) {
                trace!(to = %envelope.to, id = %envelope.id, "message lost");
                return Ok(());
            }
            let copies = if faults.duplicate_rate > 0.0 && inner.rng.gen_bool(faults.duplicate_rate)
            {
                2
            } else {
                1
            };
            let delay = faults
                .max_delay
                .map(|max| inner.rng.gen_range(Duration::ZERO..=max));
            (inbox, copies, delay)
        };

        for _ in 0..copies {
            let inbox = inbox.clone();
            let envelope = envelope.clone();
            match delay {
                Some(delay) if !delay.is_zero() => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        inbox.send(envelope).await.ok();
                    });
                }
                _ => {
                    // a closed inbox is a node that shut down, which looks like loss
                    inbox.try_send(envelope).ok();
                }
            }
        }
        Ok(())
    }
}

/// The [`Transport`] handed out by [`MemNetwork::register`].
#[derive(Debug, Clone)]
pub struct MemTransport {
    network: MemNetwork,
}

impl Transport for MemTransport {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.network.route(envelope)
    }
}
