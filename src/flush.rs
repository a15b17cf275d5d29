//! The periodic reconciliation driver.
//!
//! One flush task runs per store, waking on a fixed period and draining the
//! pending buffer into a single batched request. The period decouples the
//! rate of local mutation calls from the rate of network requests: a burst
//! of writes between two ticks goes out as one batch.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::store::StoreInner;

pub(crate) struct FlushScheduler;

impl FlushScheduler {
    /// Spawn the flush loop for `store` on its runtime.
    ///
    /// The loop holds only a weak reference, so it stops on its own when the
    /// store is dropped without an explicit close.
    pub(crate) fn spawn(store: &Arc<StoreInner>, period: Duration) {
        let weak = Arc::downgrade(store);
        let cancel = store.cancellation();
        store.runtime().spawn(Self::run(weak, period, cancel));
    }

    async fn run(store: Weak<StoreInner>, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(store) = store.upgrade() else {
                break;
            };
            store.flush().await;
        }
        trace!("flush loop stopped");
    }
}
