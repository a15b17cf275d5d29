//! The transport seam between the local store and the remote authority.
//!
//! A [`StateChannel`] carries two things: a push stream of incremental
//! updates issued by the authority in server order, and the three request
//! types a client issues (batched value updates, lock, unlock). The store
//! never sees the concrete transport; tests and local simulation use the
//! in-memory loopback in [`mem`].

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::value::{SessionToken, Value};

pub mod mem;

/// Priority sent with lock requests when the caller has no preference.
pub const DEFAULT_LOCK_PRIORITY: f32 = 1.0;

/// One incremental update pushed by the authority.
///
/// Delivery is assumed at-least-once, in the order the server issued the
/// updates. A null value under `changed` means the key was removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    /// Keys that were set (or, with a null value, removed).
    pub changed: BTreeMap<String, Value>,
    /// Keys that were removed.
    pub removed: Vec<String>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// An asynchronous bidirectional channel to the state authority.
///
/// Requests may fail or time out; the store absorbs those failures and
/// surfaces them only through its state-machine events.
#[async_trait]
pub trait StateChannel: Send + Sync + 'static {
    /// The push stream of updates from the authority.
    ///
    /// The receiver ends when the channel is disconnected for good.
    fn updates(&self) -> flume::Receiver<StateUpdate>;

    /// Send one batched mutation: set all of `set`, remove all of `remove`.
    async fn request_update(
        &self,
        token: &SessionToken,
        set: BTreeMap<String, Value>,
        remove: Vec<String>,
    ) -> Result<()>;

    /// Ask the authority for an exclusive lock on `key`.
    ///
    /// `Ok(false)` means contention: another session holds the key.
    async fn request_lock(&self, token: &SessionToken, key: &str, priority: f32) -> Result<bool>;

    /// Release a lock on `key` held by this session.
    async fn request_unlock(&self, token: &SessionToken, key: &str) -> Result<bool>;
}
