//! Transactions and the trust policy applied to them.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::keys::{PeerId, TxnId};

/// A row level update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Relation the row belongs to.
    pub relation: String,
    /// Key of the updated row.
    pub key: Bytes,
    /// New value, `None` for a deletion.
    pub value: Option<Bytes>,
    /// Transactions whose output this update depends on.
    pub antecedents: Vec<TxnId>,
}

impl Update {
    /// Insert or replace `key` in `relation`.
    pub fn put(relation: impl Into<String>, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            relation: relation.into(),
            key: key.into(),
            value: Some(value.into()),
            antecedents: Vec::new(),
        }
    }

    /// Delete `key` from `relation`.
    pub fn delete(relation: impl Into<String>, key: impl Into<Bytes>) -> Self {
        Self {
            relation: relation.into(),
            key: key.into(),
            value: None,
            antecedents: Vec::new(),
        }
    }

    /// Record that this update depends on `tid`.
    pub fn depends_on(mut self, tid: TxnId) -> Self {
        self.antecedents.push(tid);
        self
    }
}

/// An immutable, ordered list of updates committed under one [`TxnId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    id: TxnId,
    updates: Vec<Update>,
}

impl Transaction {
    /// Create a transaction from its updates.
    pub fn new(id: TxnId, updates: Vec<Update>) -> Self {
        Self { id, updates }
    }

    /// The transaction id.
    pub fn id(&self) -> &TxnId {
        &self.id
    }

    /// The updates, in commit order.
    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    /// All distinct antecedents of all updates, excluding the transaction itself.
    pub fn antecedents(&self) -> BTreeSet<TxnId> {
        self.updates
            .iter()
            .flat_map(|u| u.antecedents.iter())
            .filter(|tid| **tid != self.id)
            .cloned()
            .collect()
    }

    /// `(relation, key)` pairs written by this transaction.
    pub fn touched_rows(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.updates.iter().map(|u| (u.relation.as_str(), &u.key))
    }
}

/// Maps a transaction to the priority with which it should be accepted.
///
/// A priority `> 0` means the transaction is trusted enough to be considered.
pub trait TrustPolicy: Send + Sync + std::fmt::Debug {
    /// Priority of `txn`.
    fn priority(&self, txn: &Transaction) -> i32;
}

/// Trust conditions keyed by the publishing peer.
#[derive(Debug, Clone, Default)]
pub struct PeerTrust {
    default: i32,
    peers: BTreeMap<PeerId, i32>,
    relations: BTreeMap<String, i32>,
}

impl PeerTrust {
    /// Trust every peer with `default` priority unless configured otherwise.
    pub fn new(default: i32) -> Self {
        Self {
            default,
            ..Default::default()
        }
    }

    /// Set the priority for transactions published by `peer`.
    pub fn with_peer(mut self, peer: impl Into<PeerId>, priority: i32) -> Self {
        self.peers.insert(peer.into(), priority);
        self
    }

    /// Cap the priority of any transaction touching `relation`.
    pub fn with_relation(mut self, relation: impl Into<String>, priority: i32) -> Self {
        self.relations.insert(relation.into(), priority);
        self
    }
}

impl TrustPolicy for PeerTrust {
    fn priority(&self, txn: &Transaction) -> i32 {
        let base = self
            .peers
            .get(&txn.id().peer)
            .copied()
            .unwrap_or(self.default);
        txn.updates()
            .iter()
            .filter_map(|u| self.relations.get(&u.relation))
            .fold(base, |acc, cap| acc.min(*cap))
    }
}
