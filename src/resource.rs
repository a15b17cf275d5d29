//! Typed, lock-gated optimistic views over single keys.
//!
//! A [`ResourceHandle`] layers two things over one store key: an optimistic
//! local override (the caller's last write, shown immediately and shadowing
//! the authority until resolved) and a lock state machine gating whether
//! those writes may be published unconditionally.
//!
//! The untyped per-key state lives in a [`ResourceCore`] shared by every
//! handle for the same key, so one logical resource cannot hold divergent
//! local state within one process. Handles are cheap typed views over the
//! core, in the manner of a watcher over a watchable value.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    events::Subscribers,
    store::StoreInner,
    value::{ResourceCodec, Value},
    Error,
};

/// The lock state machine of one resource.
///
/// `Unlocked --acquire--> Pending --grant--> Locked`;
/// `Pending --rejection--> Unlocked`; `Locked --release--> Unlocked`.
/// No transition is retried automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum LockState {
    /// No lock is held or requested.
    #[default]
    Unlocked,
    /// A lock request is in flight; its result is not yet known.
    Pending,
    /// The authority granted this session the lock.
    Locked,
}

/// Events emitted by a resource, observed via [`ResourceHandle::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ResourceEvent {
    /// The effective value changed, from either the local or the remote side.
    ValueChanged,
    /// The authoritative value changed and the handle adopted it.
    ///
    /// Not emitted while a pending local write shadows the authority.
    RemoteValueChanged,
    /// The in-flight lock request was granted.
    LockAccepted,
    /// The in-flight lock request was rejected, or the store closed while a
    /// lock was pending or held. The pending local write, if any, was
    /// discarded in favor of the authority.
    LockRejected,
    /// The lock was released by the caller.
    LockReleased,
}

#[derive(Debug, Default)]
struct CoreState {
    /// This key's slice of the authoritative mirror.
    remote: Option<Value>,
    /// The caller's optimistic write; `None` while pending means a removal.
    local: Option<Value>,
    /// Whether `local` shadows `remote`.
    pending: bool,
    /// Whether the pending write has left the store's buffer. Adoption of a
    /// remote value while pending waits for this, so the effective value
    /// never flickers back to a stale authority between flush and echo.
    flushed: bool,
    lock: LockState,
}

impl CoreState {
    fn effective(&self) -> Option<&Value> {
        if self.pending {
            self.local.as_ref()
        } else {
            self.remote.as_ref()
        }
    }

    /// Drop the pending local write and fall back to the authority.
    /// Returns whether the effective value changed.
    fn discard_local(&mut self) -> bool {
        let changed = self.pending && self.local != self.remote;
        self.pending = false;
        self.flushed = false;
        self.local = None;
        changed
    }
}

/// Untyped per-key state shared by every handle for one key.
#[derive(Debug)]
pub(crate) struct ResourceCore {
    key: String,
    store: Weak<StoreInner>,
    state: Mutex<CoreState>,
    subscribers: Mutex<Subscribers<ResourceEvent>>,
}

impl ResourceCore {
    pub(crate) fn new(key: String, remote: Option<Value>, store: Weak<StoreInner>) -> Arc<Self> {
        Arc::new(Self {
            key,
            store,
            state: Mutex::new(CoreState {
                remote,
                ..Default::default()
            }),
            subscribers: Default::default(),
        })
    }

    fn store(&self) -> Result<Arc<StoreInner>, Error> {
        self.store
            .upgrade()
            .filter(|store| !store.is_closed())
            .ok_or(Error::Closed)
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn holds_lock(&self) -> bool {
        self.state.lock().lock == LockState::Locked
    }

    fn emit(&self, event: ResourceEvent) {
        trace!(key = %self.key, %event, "resource event");
        self.subscribers.lock().send(event);
    }

    fn set_local(self: &Arc<Self>, raw: Value, with_lock: bool) -> Result<(), Error> {
        enum Then {
            Schedule,
            Acquire,
            Queued,
        }
        let store = self.store()?;
        let mut state = self.state.lock();
        let changed = state.effective() != Some(&raw);
        state.local = Some(raw.clone());
        state.pending = true;
        state.flushed = false;
        let then = match (with_lock, state.lock) {
            // advisory write, or the lock is already held: publish on next flush
            (false, _) | (true, LockState::Locked) => Then::Schedule,
            // queued behind the in-flight request; scheduled when it resolves
            (true, LockState::Pending) => Then::Queued,
            (true, LockState::Unlocked) => {
                state.lock = LockState::Pending;
                Then::Acquire
            }
        };
        drop(state);
        match then {
            Then::Schedule => store.schedule_set(&self.key, raw)?,
            Then::Acquire => self.spawn_acquire(store),
            Then::Queued => {}
        }
        if changed {
            self.emit(ResourceEvent::ValueChanged);
        }
        Ok(())
    }

    fn spawn_acquire(self: &Arc<Self>, store: Arc<StoreInner>) {
        let core = self.clone();
        store.runtime().clone().spawn(async move {
            let granted = store.lock_key(&core.key).await;
            core.on_lock_result(granted, &store);
        });
    }

    fn on_lock_result(&self, granted: bool, store: &StoreInner) {
        let mut state = self.state.lock();
        if state.lock != LockState::Pending {
            // released or closed while the request was in flight
            return;
        }
        if granted {
            state.lock = LockState::Locked;
            let staged = state.pending.then(|| state.local.clone());
            drop(state);
            self.emit(ResourceEvent::LockAccepted);
            if let Some(local) = staged {
                let res = match local {
                    Some(value) => store.schedule_set(&self.key, value),
                    None => store.schedule_remove(&self.key),
                };
                res.ok();
            }
        } else {
            state.lock = LockState::Unlocked;
            let changed = state.discard_local();
            drop(state);
            self.emit(ResourceEvent::LockRejected);
            if changed {
                self.emit(ResourceEvent::ValueChanged);
            }
        }
    }

    fn release(self: &Arc<Self>) -> Result<(), Error> {
        let store = self.store()?;
        let mut state = self.state.lock();
        if state.lock != LockState::Locked {
            return Ok(());
        }
        state.lock = LockState::Unlocked;
        let changed = state.discard_local();
        drop(state);
        // a write staged under the lock but not yet flushed is withdrawn too
        store.cancel_scheduled(&self.key);
        self.emit(ResourceEvent::LockReleased);
        if changed {
            self.emit(ResourceEvent::ValueChanged);
        }
        let key = self.key.clone();
        store.runtime().clone().spawn(async move {
            store.release_key(&key).await;
        });
        Ok(())
    }

    fn remove_local(&self) -> Result<(), Error> {
        let store = self.store()?;
        store.schedule_remove(&self.key)?;
        let mut state = self.state.lock();
        let changed = state.effective().is_some();
        state.local = None;
        state.pending = true;
        state.flushed = false;
        drop(state);
        if changed {
            self.emit(ResourceEvent::ValueChanged);
        }
        Ok(())
    }

    /// Called by the flush when this key's staged write leaves the buffer.
    pub(crate) fn mark_flushed(&self) {
        let mut state = self.state.lock();
        if state.pending {
            state.flushed = true;
        }
    }

    /// Called by the update listener with this key's new authoritative value.
    pub(crate) fn on_remote_change(&self, value: Option<&Value>) {
        let mut state = self.state.lock();
        let old_remote = std::mem::replace(&mut state.remote, value.cloned());
        if state.pending {
            if state.lock == LockState::Pending {
                // conflict is settled by the lock result, not by this update
                return;
            }
            if !state.flushed {
                // our write is still in the buffer and will overwrite this
                return;
            }
            // the flushed write came back (or was superseded): adopt
            let changed = state.local != state.remote;
            state.pending = false;
            state.flushed = false;
            state.local = None;
            drop(state);
            self.emit(ResourceEvent::RemoteValueChanged);
            if changed {
                self.emit(ResourceEvent::ValueChanged);
            }
        } else if old_remote != state.remote {
            drop(state);
            self.emit(ResourceEvent::RemoteValueChanged);
            self.emit(ResourceEvent::ValueChanged);
        }
    }

    /// The store is closing: an unresolved or held lock counts as rejected.
    pub(crate) fn on_store_closed(&self) {
        let mut state = self.state.lock();
        if state.lock == LockState::Unlocked {
            return;
        }
        state.lock = LockState::Unlocked;
        let changed = state.discard_local();
        drop(state);
        self.emit(ResourceEvent::LockRejected);
        if changed {
            self.emit(ResourceEvent::ValueChanged);
        }
    }
}

/// A typed, single-key view over the store.
///
/// Obtained from `StateStore::get_resource`. Handles for the same key share
/// one [`ResourceCore`]; the handle itself carries only the codec and the
/// default value returned when the key is absent or does not decode.
pub struct ResourceHandle<T, C = crate::value::JsonCodec> {
    core: Arc<ResourceCore>,
    codec: C,
    default: T,
}

impl<T, C> fmt::Debug for ResourceHandle<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHandle({})", self.core.key)
    }
}

impl<T: Clone, C: Clone> Clone for ResourceHandle<T, C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            codec: self.codec.clone(),
            default: self.default.clone(),
        }
    }
}

impl<T, C> ResourceHandle<T, C>
where
    T: Clone,
    C: ResourceCodec<T>,
{
    pub(crate) fn new(core: Arc<ResourceCore>, default: T, codec: C) -> Self {
        Self {
            core,
            codec,
            default,
        }
    }

    /// The key this handle views.
    pub fn key(&self) -> &str {
        &self.core.key
    }

    /// The effective value: the pending local write if one shadows the
    /// authority, else the decoded authoritative value, else the default.
    pub fn value(&self) -> T {
        let state = self.core.state.lock();
        state
            .effective()
            .and_then(|raw| self.codec.decode(raw))
            .unwrap_or_else(|| self.default.clone())
    }

    /// Whether the effective value is present (locally staged removals read
    /// as absent before the authority agrees).
    pub fn has_value(&self) -> bool {
        self.core.state.lock().effective().is_some()
    }

    /// The current lock state.
    pub fn lock_state(&self) -> LockState {
        self.core.state.lock().lock
    }

    /// Set the local value and ensure it is published under a lock.
    ///
    /// The value is visible through [`value`](Self::value) immediately. If no
    /// lock is held, acquisition starts in the background; the write reaches
    /// the wire only once the lock is granted, and is discarded (with a
    /// [`ResourceEvent::LockRejected`]) if it is not.
    pub fn set_local_value_with_lock(&self, value: T) -> Result<(), Error> {
        let raw = self.codec.encode(&value);
        self.core.set_local(raw, true)
    }

    /// Set the local value and publish it on the next flush regardless of
    /// lock state. For advisory values where contention is acceptable.
    pub fn set_local_value(&self, value: T) -> Result<(), Error> {
        let raw = self.codec.encode(&value);
        self.core.set_local(raw, false)
    }

    /// Release a held lock, adopting the authoritative value and discarding
    /// any unflushed local write. No-op when not locked.
    pub fn release_lock(&self) -> Result<(), Error> {
        self.core.release()
    }

    /// Stage a removal of this key. [`has_value`](Self::has_value) reads
    /// false immediately, before the authority agrees.
    pub fn remove(&self) -> Result<(), Error> {
        self.core.remove_local()
    }

    /// Subscribe to this resource's events.
    pub fn subscribe(&self) -> flume::Receiver<ResourceEvent> {
        self.core.subscribers.lock().subscribe()
    }
}
