//! Resolves logical keys to the node responsible for them.

use std::collections::BTreeSet;

use crate::keys::{Epoch, NodeId, PeerId, TxnId};

/// A logical key whose records live on one responsible node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    /// A peer's reconciliation ledger.
    Peer(PeerId),
    /// A published transaction.
    Txn(TxnId),
    /// A published epoch.
    Epoch(Epoch),
}

impl RoutingKey {
    /// Hash input of the key. Unlike the storage form it has no length limit on names.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            RoutingKey::Peer(peer) => {
                out.push(b'p');
                write_peer(&mut out, peer);
            }
            RoutingKey::Txn(tid) => {
                out.push(b't');
                write_peer(&mut out, &tid.peer);
                out.extend_from_slice(&tid.seq.to_be_bytes());
            }
            RoutingKey::Epoch(epoch) => {
                out.push(b'e');
                out.extend_from_slice(&epoch.0.to_be_bytes());
            }
        }
        out
    }
}

fn write_peer(out: &mut Vec<u8>, peer: &PeerId) {
    match peer {
        PeerId::Int(id) => {
            out.push(0);
            out.extend_from_slice(&id.to_be_bytes());
        }
        PeerId::Str(name) => {
            out.push(1);
            out.extend_from_slice(&(name.len() as u64).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
        }
    }
}

/// Peer directory and routing.
pub trait Directory: Send + Sync + std::fmt::Debug + 'static {
    /// The node currently responsible for `key`.
    fn responsible_for(&self, key: &RoutingKey) -> NodeId;

    /// All known nodes, used for best effort broadcast.
    fn nodes(&self) -> Vec<NodeId>;
}

/// A fixed membership directory using rendezvous hashing.
///
/// Every key is owned by the node with the highest `blake3(node || key)` score, so all
/// nodes agree on ownership without coordination.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    nodes: BTreeSet<NodeId>,
}

impl StaticDirectory {
    /// Create a directory over `nodes`.
    ///
    /// # Panics
    ///
    /// If `nodes` is empty.
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let nodes: BTreeSet<_> = nodes.into_iter().collect();
        assert!(!nodes.is_empty(), "directory needs at least one node");
        Self { nodes }
    }

    fn score(node: NodeId, key: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&node.0.to_be_bytes());
        hasher.update(key);
        *hasher.finalize().as_bytes()
    }
}

impl Directory for StaticDirectory {
    fn responsible_for(&self, key: &RoutingKey) -> NodeId {
        let key = key.to_bytes();
        self.nodes
            .iter()
            .copied()
            .max_by_key(|node| Self::score(*node, &key))
            .expect("directory is never empty")
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.nodes.iter().copied().collect()
    }
}
