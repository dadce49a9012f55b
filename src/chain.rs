//! Transaction chains.
//!
//! A chain is the lineage of a head transaction that has to be considered together with
//! it: the head plus every antecedent that is neither accepted yet nor rejected. The walk
//! over antecedents uses an explicit worklist, since antecedent graphs can be deep and
//! share nodes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{trace, warn};

use crate::{keys::TxnId, txn::Transaction};

/// Access to locally available transaction contents.
pub trait TxnLookup {
    /// The transaction with id `tid`, if available.
    fn lookup(&self, tid: &TxnId) -> Option<Transaction>;
}

impl TxnLookup for BTreeMap<TxnId, Transaction> {
    fn lookup(&self, tid: &TxnId) -> Option<Transaction> {
        self.get(tid).cloned()
    }
}

impl TxnLookup for HashMap<TxnId, Transaction> {
    fn lookup(&self, tid: &TxnId) -> Option<Transaction> {
        self.get(tid).cloned()
    }
}

/// Already made decisions of the reconciling peer.
pub trait DecisionLookup {
    /// Whether `tid` was accepted.
    fn has_accepted(&self, tid: &TxnId) -> bool;
    /// Whether `tid` was rejected.
    fn has_rejected(&self, tid: &TxnId) -> bool;
}

/// Decisions held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decided {
    /// Accepted transactions.
    pub accepted: BTreeSet<TxnId>,
    /// Rejected transactions.
    pub rejected: BTreeSet<TxnId>,
}

impl DecisionLookup for Decided {
    fn has_accepted(&self, tid: &TxnId) -> bool {
        self.accepted.contains(tid)
    }

    fn has_rejected(&self, tid: &TxnId) -> bool {
        self.rejected.contains(tid)
    }
}

/// An antecedent of the head was rejected, so the head must be rejected too.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("antecedent {0} was already rejected")]
pub struct AlreadyRejectedAntecedent(pub TxnId);

/// How a chain exposes its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainMode {
    /// A flat list in dependency order.
    #[default]
    Ordered,
    /// An explicit antecedent to dependent relation.
    Graph,
}

/// The contents of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainContents {
    /// Every antecedent precedes its dependents.
    Ordered(Vec<Transaction>),
    /// Transactions and, for each of them, the components that depend on it directly.
    Graph {
        /// Component transactions.
        txns: BTreeMap<TxnId, Transaction>,
        /// Antecedent to dependents edges between components.
        dependents: BTreeMap<TxnId, BTreeSet<TxnId>>,
    },
}

/// The resolved, or partially resolved, lineage of a head transaction.
#[derive(Debug, Clone)]
pub struct TxnChain {
    head: TxnId,
    mode: ChainMode,
    /// Fetched and undecided.
    txns: BTreeMap<TxnId, Transaction>,
    /// Needed but not available yet.
    tail: BTreeSet<TxnId>,
}

impl TxnChain {
    /// Build the chain of `head`.
    ///
    /// Fails if `head` or any of its antecedents was already rejected.
    pub fn build(
        head: TxnId,
        mode: ChainMode,
        source: &impl TxnLookup,
        decisions: &impl DecisionLookup,
    ) -> Result<Self, AlreadyRejectedAntecedent> {
        let mut chain = Self {
            tail: BTreeSet::from([head.clone()]),
            head,
            mode,
            txns: BTreeMap::new(),
        };
        chain.replace_tail_with_available_txns(source, decisions)?;
        Ok(chain)
    }

    /// Resolve the current tail against `source` and `decisions`, walking the antecedents of
    /// everything that becomes available.
    ///
    /// Returns whether the chain changed. On error the chain is left unchanged.
    pub fn replace_tail_with_available_txns(
        &mut self,
        source: &impl TxnLookup,
        decisions: &impl DecisionLookup,
    ) -> Result<bool, AlreadyRejectedAntecedent> {
        let mut txns = self.txns.clone();
        let mut tail = BTreeSet::new();
        let mut seen: BTreeSet<TxnId> = self.tail.clone();
        let mut pending: Vec<TxnId> = self.tail.iter().cloned().collect();
        let mut changed = false;
        while !pending.is_empty() {
            let mut next = Vec::new();
            for tid in pending {
                if decisions.has_rejected(&tid) {
                    trace!(head = %self.head, %tid, "rejected antecedent");
                    return Err(AlreadyRejectedAntecedent(tid));
                }
                if decisions.has_accepted(&tid) {
                    changed = true;
                    continue;
                }
                let Some(txn) = source.lookup(&tid) else {
                    tail.insert(tid);
                    continue;
                };
                if txn.id() != &tid {
                    warn!(%tid, got = %txn.id(), "lookup returned a different transaction");
                    tail.insert(tid);
                    continue;
                }
                changed = true;
                for antecedent in txn.antecedents() {
                    if !txns.contains_key(&antecedent) && seen.insert(antecedent.clone()) {
                        next.push(antecedent);
                    }
                }
                txns.insert(tid, txn);
            }
            pending = next;
        }
        self.txns = txns;
        self.tail = tail;
        Ok(changed)
    }

    /// The head transaction id.
    pub fn head(&self) -> &TxnId {
        &self.head
    }

    /// Ids of the transactions included in the chain.
    pub fn components(&self) -> BTreeSet<TxnId> {
        self.txns.keys().cloned().collect()
    }

    /// Antecedents still to be resolved.
    pub fn tail(&self) -> &BTreeSet<TxnId> {
        &self.tail
    }

    /// Whether every antecedent is resolved.
    pub fn is_complete(&self) -> bool {
        self.tail.is_empty()
    }

    /// The head transaction, once fetched.
    pub fn head_txn(&self) -> Option<&Transaction> {
        self.txns.get(&self.head)
    }

    /// Component transactions keyed by id.
    pub fn txns(&self) -> &BTreeMap<TxnId, Transaction> {
        &self.txns
    }

    /// The contents in the chain's mode.
    pub fn contents(&self) -> ChainContents {
        match self.mode {
            ChainMode::Ordered => ChainContents::Ordered(self.ordered()),
            ChainMode::Graph => ChainContents::Graph {
                txns: self.txns.clone(),
                dependents: self.dependents(),
            },
        }
    }

    fn dependents(&self) -> BTreeMap<TxnId, BTreeSet<TxnId>> {
        let mut dependents: BTreeMap<TxnId, BTreeSet<TxnId>> = BTreeMap::new();
        for (tid, txn) in &self.txns {
            for antecedent in txn.antecedents() {
                if self.txns.contains_key(&antecedent) {
                    dependents.entry(antecedent).or_default().insert(tid.clone());
                }
            }
        }
        dependents
    }

    /// Components sorted so that antecedents come first. Ties are broken by id.
    fn ordered(&self) -> Vec<Transaction> {
        let dependents = self.dependents();
        let mut missing: BTreeMap<&TxnId, usize> = self
            .txns
            .iter()
            .map(|(tid, txn)| {
                let count = txn
                    .antecedents()
                    .iter()
                    .filter(|a| self.txns.contains_key(*a))
                    .count();
                (tid, count)
            })
            .collect();
        let mut ready: BTreeSet<&TxnId> = missing
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(tid, _)| *tid)
            .collect();
        let mut out = Vec::with_capacity(self.txns.len());
        while let Some(tid) = ready.pop_first() {
            missing.remove(tid);
            out.push(self.txns[tid].clone());
            for dependent in dependents.get(tid).into_iter().flatten() {
                if let Some(count) = missing.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        if !missing.is_empty() {
            warn!(head = %self.head, cyclic = missing.len(), "antecedent cycle in chain");
            out.extend(missing.keys().map(|tid| self.txns[*tid].clone()));
        }
        out
    }
}
