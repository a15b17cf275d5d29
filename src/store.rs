//! The authoritative local mirror and its reconciliation protocol.
//!
//! A [`StateStore`] keeps a mirror of the authority's key/value map, a buffer
//! of staged local writes, and two background tasks: the update listener
//! applying pushed updates in arrival order, and the flush loop draining the
//! buffer to the channel on a fixed period. Typed access goes through
//! [`ResourceHandle`]s and [`CollectionView`]s obtained from the store.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    channel::{StateChannel, StateUpdate, DEFAULT_LOCK_PRIORITY},
    collection::{CollectionCore, CollectionView},
    events::Subscribers,
    flush::FlushScheduler,
    metrics::Metrics,
    resource::{ResourceCore, ResourceHandle},
    value::{JsonCodec, ResourceCodec, SessionToken, Value},
    Error,
};

/// Default period of the flush loop (30 Hz).
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(33);

/// Options for spawning a store.
#[derive(Debug, Clone)]
pub struct StoreOpts {
    /// Period of the flush loop draining staged writes to the channel.
    pub flush_interval: Duration,
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// A store-level key event, as observed by [`StateStore::subscribe`].
#[derive(Debug, Clone, PartialEq, strum::Display)]
pub enum StoreEvent {
    /// A key was set or changed in the authoritative mirror.
    Updated { key: String, value: Value },
    /// A key was removed from the authoritative mirror.
    Removed { key: String },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::Updated { key, .. } => key,
            StoreEvent::Removed { key } => key,
        }
    }
}

/// Observer of per-key mirror changes, registered by derived views.
pub(crate) trait KeyObserver: Send + Sync {
    /// `value` is `None` when the key was removed.
    fn on_key_changed(&self, key: &str, value: Option<&Value>);
}

#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    set: BTreeMap<String, Value>,
    remove: BTreeSet<String>,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    fn clear(&mut self) {
        self.set.clear();
        self.remove.clear();
    }
}

/// The local mirror of a server-authoritative key/value store.
///
/// Cheaply cloneable; all clones share the same mirror and write buffer.
/// Dropping every clone (and every handle derived from the store) stops the
/// background tasks; an explicit [`close`](Self::close) additionally sends
/// one best-effort final flush.
#[derive(Debug, Clone)]
pub struct StateStore {
    pub(crate) inner: Arc<StoreInner>,
}

#[derive(derive_more::Debug)]
pub(crate) struct StoreInner {
    #[debug(skip)]
    channel: Arc<dyn StateChannel>,
    token: SessionToken,
    rt: tokio::runtime::Handle,
    remote: RwLock<BTreeMap<String, Value>>,
    pending: Mutex<PendingWrites>,
    resources: Mutex<HashMap<String, Weak<ResourceCore>>>,
    observers: Mutex<Vec<Weak<dyn KeyObserver>>>,
    subscribers: Mutex<Subscribers<StoreEvent>>,
    metrics: Metrics,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl StateStore {
    /// Spawn a store over the given channel.
    ///
    /// Starts the update listener and the flush loop. Must be called from
    /// within a tokio runtime.
    pub fn spawn(channel: Arc<dyn StateChannel>, opts: StoreOpts) -> Self {
        let updates = channel.updates();
        let inner = Arc::new(StoreInner {
            channel,
            token: SessionToken::generate(),
            rt: tokio::runtime::Handle::current(),
            remote: Default::default(),
            pending: Default::default(),
            resources: Default::default(),
            observers: Default::default(),
            subscribers: Default::default(),
            metrics: Default::default(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        debug!(token = %inner.token, "spawning state store");
        inner.rt.spawn(update_listener(
            Arc::downgrade(&inner),
            updates,
            inner.cancel.clone(),
        ));
        FlushScheduler::spawn(&inner, opts.flush_interval);
        Self { inner }
    }

    /// The session token used for every request from this store.
    pub fn token(&self) -> SessionToken {
        self.inner.token
    }

    /// Stage a local write. Cancels any staged removal of the same key.
    pub fn schedule_set(&self, key: &str, value: Value) -> Result<(), Error> {
        self.inner.schedule_set(key, value)
    }

    /// Stage a local removal. Cancels any staged write of the same key.
    pub fn schedule_remove(&self, key: &str) -> Result<(), Error> {
        self.inner.schedule_remove(key)
    }

    /// Drain the write buffer and send one batched update now.
    ///
    /// The flush loop calls this periodically; calling it directly is useful
    /// when a caller wants its writes on the wire without waiting a tick.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Request an exclusive lock on `key` from the authority.
    ///
    /// `false` covers both contention and transport failure.
    pub async fn lock_key(&self, key: &str) -> bool {
        if key.is_empty() || self.inner.is_closed() {
            return false;
        }
        self.inner.lock_key(key).await
    }

    /// Release a lock on `key`. `false` if this session did not hold it.
    pub async fn release_key(&self, key: &str) -> bool {
        if key.is_empty() || self.inner.is_closed() {
            return false;
        }
        self.inner.release_key(key).await
    }

    /// A typed handle over one key, decoding through serde.
    pub fn get_resource<T>(&self, key: &str, default: T) -> Result<ResourceHandle<T>, Error>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        self.get_resource_with(key, default, JsonCodec)
    }

    /// A typed handle over one key with a caller-supplied codec.
    ///
    /// Handles for the same key share their local state and lock machine, so
    /// one logical resource cannot diverge within one process.
    pub fn get_resource_with<T, C>(
        &self,
        key: &str,
        default: T,
        codec: C,
    ) -> Result<ResourceHandle<T, C>, Error>
    where
        T: Clone,
        C: ResourceCodec<T>,
    {
        self.inner.check_open(key)?;
        let core = self.inner.resource_core(key);
        Ok(ResourceHandle::new(core, default, codec))
    }

    /// A live view of all keys starting with `prefix`, decoded through serde.
    pub fn get_collection<T>(&self, prefix: &str) -> CollectionView<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.get_collection_with(prefix, JsonCodec)
    }

    /// A live prefix view with a caller-supplied codec.
    pub fn get_collection_with<T, C>(&self, prefix: &str, codec: C) -> CollectionView<T, C>
    where
        T: Clone + Send + Sync + 'static,
        C: ResourceCodec<T>,
    {
        // Seed and register while holding the observers list: an update
        // applied to the mirror is either visible to the seed snapshot or
        // dispatched to the registered observer, never lost in between.
        let mut observers = self.inner.observers.lock();
        let core = CollectionCore::new(prefix, codec, &self.inner);
        let weak = Arc::downgrade(&core);
        let observer: Weak<dyn KeyObserver> = weak;
        observers.push(observer);
        drop(observers);
        CollectionView::new(core)
    }

    /// Subscribe to store-level key events.
    pub fn subscribe(&self) -> flume::Receiver<StoreEvent> {
        self.inner.subscribers.lock().subscribe()
    }

    /// The authoritative value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.remote.read().get(key).cloned()
    }

    /// Whether the authoritative mirror currently holds `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.remote.read().contains_key(key)
    }

    /// A copy of the authoritative mirror.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner.remote.read().clone()
    }

    /// Counters for this store.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the store: stop both background tasks, attempt one final flush,
    /// and notify handles still negotiating or holding a lock.
    ///
    /// Handles in `Pending` or `Locked` observe the close as an implicit
    /// lock rejection. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing store");
        self.inner.cancel.cancel();
        self.inner.flush().await;
        self.inner.pending.lock().clear();
        let cores: Vec<_> = {
            let resources = self.inner.resources.lock();
            resources.values().filter_map(Weak::upgrade).collect()
        };
        let mut held = Vec::new();
        for core in cores {
            if core.holds_lock() {
                held.push(core.key().to_string());
            }
            core.on_store_closed();
        }
        // hand the held locks back so the authority does not keep them
        // bound to a session that no longer exists
        for key in held {
            self.inner.release_key(&key).await;
        }
    }
}

impl StoreInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.rt
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn check_open(&self, key: &str) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn schedule_set(&self, key: &str, value: Value) -> Result<(), Error> {
        self.check_open(key)?;
        trace!(%key, "schedule set");
        let mut pending = self.pending.lock();
        pending.remove.remove(key);
        pending.set.insert(key.to_string(), value);
        self.metrics.local_sets.inc();
        Ok(())
    }

    pub(crate) fn schedule_remove(&self, key: &str) -> Result<(), Error> {
        self.check_open(key)?;
        trace!(%key, "schedule remove");
        let mut pending = self.pending.lock();
        pending.set.remove(key);
        pending.remove.insert(key.to_string());
        self.metrics.local_removes.inc();
        Ok(())
    }

    /// Withdraw any staged write or removal for `key` without flushing it.
    pub(crate) fn cancel_scheduled(&self, key: &str) {
        let mut pending = self.pending.lock();
        pending.set.remove(key);
        pending.remove.remove(key);
    }

    /// Drain the buffer and issue one batched update request.
    ///
    /// Failures are absorbed: the batch is already drained, so a transport
    /// error here loses those writes. The authority never saw them and no
    /// retry is attempted.
    pub(crate) async fn flush(&self) {
        let (set, remove) = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            (
                std::mem::take(&mut pending.set),
                std::mem::take(&mut pending.remove),
            )
        };
        for key in set.keys().chain(remove.iter()) {
            if let Some(core) = self.live_resource(key) {
                core.mark_flushed();
            }
        }
        let count = set.len() + remove.len();
        trace!(%count, "flush");
        self.metrics.flushes.inc();
        let remove: Vec<String> = remove.into_iter().collect();
        if let Err(err) = self.channel.request_update(&self.token, set, remove).await {
            self.metrics.flush_failures.inc();
            warn!(%count, "flush failed, staged writes dropped: {err:#}");
        }
    }

    pub(crate) async fn lock_key(&self, key: &str) -> bool {
        self.metrics.lock_requests.inc();
        match self
            .channel
            .request_lock(&self.token, key, DEFAULT_LOCK_PRIORITY)
            .await
        {
            Ok(true) => {
                debug!(%key, "lock granted");
                self.metrics.lock_grants.inc();
                true
            }
            Ok(false) => {
                debug!(%key, "lock rejected");
                self.metrics.lock_rejections.inc();
                false
            }
            Err(err) => {
                debug!(%key, "lock request failed: {err:#}");
                self.metrics.lock_rejections.inc();
                false
            }
        }
    }

    pub(crate) async fn release_key(&self, key: &str) -> bool {
        match self.channel.request_unlock(&self.token, key).await {
            Ok(released) => released,
            Err(err) => {
                debug!(%key, "unlock request failed: {err:#}");
                false
            }
        }
    }

    /// The shared per-key core, creating it on first request.
    fn resource_core(self: &Arc<Self>, key: &str) -> Arc<ResourceCore> {
        let mut resources = self.resources.lock();
        if let Some(core) = resources.get(key).and_then(Weak::upgrade) {
            return core;
        }
        let remote = self.remote.read().get(key).cloned();
        let core = ResourceCore::new(key.to_string(), remote, Arc::downgrade(self));
        resources.insert(key.to_string(), Arc::downgrade(&core));
        core
    }

    /// The per-key core if a handle for it is still alive.
    fn live_resource(&self, key: &str) -> Option<Arc<ResourceCore>> {
        let mut resources = self.resources.lock();
        match resources.get(key) {
            Some(weak) => match weak.upgrade() {
                Some(core) => Some(core),
                None => {
                    resources.remove(key);
                    None
                }
            },
            None => None,
        }
    }

    /// The mirror restricted to `prefix`, keyed by the id after the prefix.
    pub(crate) fn snapshot_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        self.remote
            .read()
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .filter(|id| !id.is_empty())
                    .map(|id| (id.to_string(), value.clone()))
            })
            .collect()
    }

    /// Apply one pushed update to the mirror and fan out per-key events.
    pub(crate) fn on_remote_update(&self, update: StateUpdate) {
        self.metrics.remote_updates.inc();
        let mut applied: Vec<(String, Option<Value>)> =
            Vec::with_capacity(update.changed.len() + update.removed.len());
        {
            let mut remote = self.remote.write();
            for (key, value) in update.changed {
                if value.is_null() {
                    if remote.remove(&key).is_some() {
                        applied.push((key, None));
                    }
                } else {
                    remote.insert(key.clone(), value.clone());
                    applied.push((key, Some(value)));
                }
            }
            for key in update.removed {
                if remote.remove(&key).is_some() {
                    applied.push((key, None));
                }
            }
        }
        self.metrics.remote_keys_applied.inc_by(applied.len() as u64);
        for (key, value) in applied {
            trace!(%key, removed = value.is_none(), "remote update");
            if let Some(core) = self.live_resource(&key) {
                core.on_remote_change(value.as_ref());
            }
            self.notify_observers(&key, value.as_ref());
            let event = match value {
                Some(value) => StoreEvent::Updated { key, value },
                None => StoreEvent::Removed { key },
            };
            self.subscribers.lock().send(event);
        }
    }

    fn notify_observers(&self, key: &str, value: Option<&Value>) {
        let observers: Vec<_> = {
            let mut list = self.observers.lock();
            list.retain(|weak| weak.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_key_changed(key, value);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_snapshot(&self) -> (BTreeMap<String, Value>, BTreeSet<String>) {
        let pending = self.pending.lock();
        (pending.set.clone(), pending.remove.clone())
    }
}

/// Long-lived loop consuming the channel's push stream.
async fn update_listener(
    store: Weak<StoreInner>,
    updates: flume::Receiver<StateUpdate>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv_async() => match update {
                Ok(update) => update,
                Err(_) => {
                    debug!("update stream closed");
                    break;
                }
            },
        };
        let Some(store) = store.upgrade() else {
            break;
        };
        store.on_remote_update(update);
    }
    trace!("update listener stopped");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::channel::mem::MemServer;

    fn store_on(server: &Arc<MemServer>) -> StateStore {
        StateStore::spawn(server.connect(), StoreOpts::default())
    }

    async fn recv<E>(rx: &flume::Receiver<E>) -> E {
        tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn local_writes_coalesce_per_key() {
        let server = MemServer::new();
        let store = store_on(&server);
        store.schedule_set("k", json!(1)).unwrap();
        store.schedule_set("k", json!(2)).unwrap();
        let (set, _) = store.inner.pending_snapshot();
        assert_eq!(set.get("k"), Some(&json!(2)));
        store.flush().await;
        assert_eq!(server.snapshot().get("k"), Some(&json!(2)));
        assert_eq!(store.metrics().flushes.get(), 1);
    }

    #[tokio::test]
    async fn set_and_remove_are_mutually_exclusive() {
        let server = MemServer::new();
        let store = store_on(&server);
        store.schedule_set("k", json!(1)).unwrap();
        store.schedule_remove("k").unwrap();
        let (set, remove) = store.inner.pending_snapshot();
        assert!(!set.contains_key("k"));
        assert!(remove.contains("k"));

        store.schedule_set("k", json!(2)).unwrap();
        let (set, remove) = store.inner.pending_snapshot();
        assert_eq!(set.get("k"), Some(&json!(2)));
        assert!(!remove.contains("k"));
    }

    #[tokio::test]
    async fn empty_flush_sends_nothing() {
        let server = MemServer::new();
        let store = store_on(&server);
        store.flush().await;
        assert_eq!(store.metrics().flushes.get(), 0);
    }

    #[tokio::test]
    async fn mirror_follows_remote_updates() {
        let server = MemServer::new();
        let store = store_on(&server);
        let events = store.subscribe();
        let writer = server.connect();
        let token = SessionToken::generate();
        writer
            .request_update(
                &token,
                BTreeMap::from([("k".to_string(), json!("v"))]),
                vec![],
            )
            .await
            .unwrap();
        let event = recv(&events).await;
        assert_eq!(
            event,
            StoreEvent::Updated {
                key: "k".to_string(),
                value: json!("v")
            }
        );
        assert_eq!(store.get("k"), Some(json!("v")));

        writer
            .request_update(&token, BTreeMap::new(), vec!["k".to_string()])
            .await
            .unwrap();
        let event = recv(&events).await;
        assert_eq!(
            event,
            StoreEvent::Removed {
                key: "k".to_string()
            }
        );
        assert!(!store.contains_key("k"));
    }

    #[tokio::test]
    async fn null_payload_is_a_removal() {
        let server = MemServer::new();
        let store = store_on(&server);
        store.inner.on_remote_update(StateUpdate {
            changed: BTreeMap::from([("k".to_string(), json!(1))]),
            removed: vec![],
        });
        assert!(store.contains_key("k"));
        store.inner.on_remote_update(StateUpdate {
            changed: BTreeMap::from([("k".to_string(), Value::Null)]),
            removed: vec![],
        });
        assert!(!store.contains_key("k"));
    }

    #[tokio::test]
    async fn mutation_on_closed_store_fails() {
        let server = MemServer::new();
        let store = store_on(&server);
        store.close().await;
        assert!(matches!(
            store.schedule_set("k", json!(1)),
            Err(Error::Closed)
        ));
        assert!(matches!(store.schedule_remove("k"), Err(Error::Closed)));
        assert!(!store.lock_key("k").await);
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let server = MemServer::new();
        let store = store_on(&server);
        assert!(matches!(
            store.schedule_set("", json!(1)),
            Err(Error::EmptyKey)
        ));
        assert!(matches!(store.schedule_remove(""), Err(Error::EmptyKey)));
        assert!(matches!(
            store.get_resource("", json!(null)),
            Err(Error::EmptyKey)
        ));
    }

    #[tokio::test]
    async fn close_flushes_staged_writes() {
        let server = MemServer::new();
        let store = store_on(&server);
        store.schedule_set("k", json!("last")).unwrap();
        store.close().await;
        assert_eq!(server.snapshot().get("k"), Some(&json!("last")));
        // second close is a no-op
        store.close().await;
    }

    #[tokio::test]
    async fn flush_failure_drops_staged_writes() {
        let server = MemServer::new();
        let channel = server.connect();
        let store = StateStore::spawn(channel.clone(), StoreOpts::default());
        store.schedule_set("k", json!(1)).unwrap();
        channel.set_partitioned(true);
        store.flush().await;
        assert_eq!(store.metrics().flush_failures.get(), 1);
        let (set, remove) = store.inner.pending_snapshot();
        assert!(set.is_empty() && remove.is_empty());
        // the write is gone for good: a later successful flush has nothing to send
        channel.set_partitioned(false);
        store.flush().await;
        assert_eq!(server.snapshot().get("k"), None);
    }

    #[tokio::test]
    async fn counters_track_the_update_cycle() {
        let server = MemServer::new();
        let store = store_on(&server);
        let events = store.subscribe();
        store.schedule_set("a", json!(1)).unwrap();
        store.schedule_set("b", json!(2)).unwrap();
        store.schedule_remove("c").unwrap();
        store.flush().await;
        // the echo carries both set keys; "c" was never present upstream
        for _ in 0..2 {
            recv(&events).await;
        }
        let metrics = store.metrics();
        assert_eq!(metrics.local_sets.get(), 2);
        assert_eq!(metrics.local_removes.get(), 1);
        assert_eq!(metrics.flushes.get(), 1);
        assert_eq!(metrics.remote_updates.get(), 1);
        assert_eq!(metrics.remote_keys_applied.get(), 2);
    }

    #[tokio::test]
    async fn same_key_returns_shared_handle_state() {
        let server = MemServer::new();
        let store = store_on(&server);
        let a = store.get_resource::<f64>("k", 0.0).unwrap();
        let b = store.get_resource::<f64>("k", 0.0).unwrap();
        a.set_local_value(1.5).unwrap();
        assert_eq!(b.value(), 1.5);
    }
}
