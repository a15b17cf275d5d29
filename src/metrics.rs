//! Counters for the synchronization engine.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked for one store.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "statesync")]
pub struct Metrics {
    /// Local writes staged into the pending buffer
    #[metrics(help = "Number of local writes staged.")]
    pub local_sets: Counter,
    /// Local removals staged into the pending buffer
    #[metrics(help = "Number of local removals staged.")]
    pub local_removes: Counter,
    /// Non-empty flushes sent to the authority
    #[metrics(help = "Number of non-empty flushes sent.")]
    pub flushes: Counter,
    /// Flushes whose batch was dropped on transport failure
    #[metrics(help = "Number of flushes dropped on transport failure.")]
    pub flush_failures: Counter,

    /// Updates pushed by the authority
    #[metrics(help = "Number of updates received from the authority.")]
    pub remote_updates: Counter,
    /// Key changes applied to the mirror
    #[metrics(help = "Number of key changes applied to the mirror.")]
    pub remote_keys_applied: Counter,

    /// Lock requests issued over the channel
    #[metrics(help = "Number of lock requests issued.")]
    pub lock_requests: Counter,
    /// Lock requests the authority granted
    #[metrics(help = "Number of lock requests granted.")]
    pub lock_grants: Counter,
    /// Lock requests rejected by the authority or failed in transport
    #[metrics(help = "Number of lock requests rejected or failed.")]
    pub lock_rejections: Counter,
}
