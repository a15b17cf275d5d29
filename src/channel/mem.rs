//! In-memory loopback authority.
//!
//! [`MemServer`] plays the server side of the protocol for tests and local
//! simulation: a last-writer-wins map, a per-key lock table keyed by session
//! token, and a broadcast of every applied update to all connected clients
//! (the sender included, so clients observe their own writes echoed back).
//! A newly connected client receives the full current state as its first
//! push.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{StateChannel, StateUpdate};
use crate::value::{SessionToken, Value};

/// The server side: authoritative map, lock table, connected clients.
#[derive(Debug, Default)]
pub struct MemServer {
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    map: BTreeMap<String, Value>,
    locks: HashMap<String, SessionToken>,
    clients: Vec<flume::Sender<StateUpdate>>,
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("keys", &self.map.len())
            .field("locks", &self.locks.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl MemServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect a new client, pushing the current state as its first update.
    pub fn connect(self: &Arc<Self>) -> Arc<MemChannel> {
        let (tx, rx) = flume::unbounded();
        let mut state = self.state.lock();
        if !state.map.is_empty() {
            tx.send(StateUpdate {
                changed: state.map.clone(),
                removed: Vec::new(),
            })
            .ok();
        }
        state.clients.push(tx);
        Arc::new(MemChannel {
            server: self.clone(),
            updates: rx,
            partitioned: AtomicBool::new(false),
            lock_hold: tokio::sync::watch::Sender::new(false),
        })
    }

    /// A copy of the authoritative map, for assertions.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.state.lock().map.clone()
    }

    /// The session currently holding the lock on `key`, if any.
    pub fn lock_holder(&self, key: &str) -> Option<SessionToken> {
        self.state.lock().locks.get(key).copied()
    }

    fn apply_update(
        &self,
        token: &SessionToken,
        set: BTreeMap<String, Value>,
        remove: Vec<String>,
    ) {
        let mut state = self.state.lock();
        let mut changed = BTreeMap::new();
        let mut removed = Vec::new();
        for (key, value) in set {
            // Writes to a key locked by another session are skipped.
            if state.locks.get(&key).is_some_and(|holder| holder != token) {
                trace!(%key, "rejecting write to key locked by another session");
                continue;
            }
            if value.is_null() {
                if state.map.remove(&key).is_some() {
                    removed.push(key);
                }
            } else {
                state.map.insert(key.clone(), value.clone());
                changed.insert(key, value);
            }
        }
        for key in remove {
            if state.locks.get(&key).is_some_and(|holder| holder != token) {
                trace!(%key, "rejecting removal of key locked by another session");
                continue;
            }
            if state.map.remove(&key).is_some() {
                removed.push(key);
            }
        }
        if changed.is_empty() && removed.is_empty() {
            return;
        }
        let update = StateUpdate { changed, removed };
        state
            .clients
            .retain(|client| client.send(update.clone()).is_ok());
    }

    fn try_lock(&self, token: &SessionToken, key: &str) -> bool {
        let mut state = self.state.lock();
        match state.locks.get(key) {
            // re-granting to the current holder succeeds
            Some(holder) => holder == token,
            None => {
                state.locks.insert(key.to_string(), *token);
                true
            }
        }
    }

    fn try_unlock(&self, token: &SessionToken, key: &str) -> bool {
        let mut state = self.state.lock();
        if state.locks.get(key).is_some_and(|holder| holder == token) {
            state.locks.remove(key);
            true
        } else {
            false
        }
    }
}

/// One client's end of the loopback.
pub struct MemChannel {
    server: Arc<MemServer>,
    updates: flume::Receiver<StateUpdate>,
    partitioned: AtomicBool,
    lock_hold: tokio::sync::watch::Sender<bool>,
}

impl fmt::Debug for MemChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemChannel")
            .field("partitioned", &self.partitioned.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemChannel {
    /// Simulate transport loss: while partitioned, every request fails.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::Relaxed);
    }

    /// While held, lock requests stay in flight instead of resolving.
    pub fn hold_locks(&self, hold: bool) {
        self.lock_hold.send_replace(hold);
    }

    fn check_connected(&self) -> Result<()> {
        if self.partitioned.load(Ordering::Relaxed) {
            bail!("transport unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl StateChannel for MemChannel {
    fn updates(&self) -> flume::Receiver<StateUpdate> {
        self.updates.clone()
    }

    async fn request_update(
        &self,
        token: &SessionToken,
        set: BTreeMap<String, Value>,
        remove: Vec<String>,
    ) -> Result<()> {
        self.check_connected()?;
        self.server.apply_update(token, set, remove);
        Ok(())
    }

    async fn request_lock(
        &self,
        token: &SessionToken,
        key: &str,
        _priority: f32,
    ) -> Result<bool> {
        let mut held = self.lock_hold.subscribe();
        while *held.borrow_and_update() {
            held.changed().await.ok();
        }
        self.check_connected()?;
        Ok(self.server.try_lock(token, key))
    }

    async fn request_unlock(&self, token: &SessionToken, key: &str) -> Result<bool> {
        self.check_connected()?;
        Ok(self.server.try_unlock(token, key))
    }
}
