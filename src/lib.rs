//! Peer-to-peer reconciliation of updates over a distributed store.
//!
//! Peers publish batches of [`Transaction`]s. Every batch claims the next [`Epoch`], which
//! gives all published transactions one global order. Peers then reconcile independently:
//! each walks the epochs published since its last reconciliation, decides per transaction
//! whether to accept or reject it according to its [`TrustPolicy`], and records the
//! outcome in its ledger under a dense per-peer reconciliation number.
//!
//! Epochs, ledgers and transactions are stored on the node responsible for them according
//! to a [`Directory`], and all access goes through request/reply messages with retries, see
//! [`rpc`]. A [`Node`] runs both sides.
//!
//! [`Directory`]: directory::Directory
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod chain;
pub mod config;
pub mod directory;
pub mod epoch;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod net;
pub mod node;
pub mod proto;
pub mod reconcile;
pub mod rpc;
pub mod store;
pub mod txn;
pub mod workers;

#[cfg(test)]
pub(crate) mod test_utils;

pub use keys::{Epoch, NodeId, PeerId, Recno, TxnId};
pub use node::Node;
pub use txn::{PeerTrust, Transaction, TrustPolicy, Update};
