//! Metrics for the reconciliation store

use iroh_metrics::{Counter, MetricsGroup};

/// Counters for one node.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "recon")]
pub struct Metrics {
    /// Requests sent through the substrate, including retries.
    pub requests_sent: Counter,
    /// Requests resent after a failure reply or timeout.
    pub requests_retried: Counter,
    /// Requests whose retries were exhausted.
    pub requests_exhausted: Counter,
    /// Replies discarded because their request already finished.
    pub replies_discarded: Counter,
    /// Epochs successfully claimed by this node.
    pub epochs_published: Counter,
    /// Epoch claims lost to a concurrent publisher.
    pub epoch_conflicts: Counter,
    /// Reconciliation records written.
    pub reconciliations_recorded: Counter,
    /// Ledger lookups answered from the checkpoint cache.
    pub ledger_cache_hits: Counter,
    /// Ledger lookups that fetched records.
    pub ledger_cache_misses: Counter,
    /// Workers spawned because every worker was blocked on a reply.
    pub workers_spawned_on_stall: Counter,
}
