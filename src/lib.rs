//! Client-side synchronization and locking engine for a server-authoritative
//! key/value store.
//!
//! A [`StateStore`] mirrors the authority's map, stages optimistic local
//! writes into a buffer that a periodic flush drains to the network, and
//! applies pushed updates in server order. Typed access goes through
//! [`ResourceHandle`]s (single key, optimistic override plus a per-key lock
//! state machine) and [`CollectionView`]s (live prefix-filtered projections).
//! The transport is abstracted behind [`StateChannel`]; an in-memory loopback
//! authority lives in [`channel::mem`].
//!
//! Network and contention failures are absorbed and surfaced through events
//! ([`ResourceEvent::LockRejected`] and friends), never as errors from
//! mutation calls. Only caller misuse is reported synchronously, as [`Error`].

pub mod channel;
pub mod collection;
mod events;
mod flush;
pub mod metrics;
pub mod resource;
pub mod store;
pub mod value;

pub use self::{
    channel::{StateChannel, StateUpdate},
    collection::{CollectionEvent, CollectionView},
    resource::{LockState, ResourceEvent, ResourceHandle},
    store::{StateStore, StoreEvent, StoreOpts, DEFAULT_FLUSH_INTERVAL},
    value::{JsonCodec, ResourceCodec, SessionToken, Value},
};

/// Caller-misuse errors reported synchronously from mutation calls.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// A key or item id was empty.
    #[error("key must not be empty")]
    EmptyKey,
    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}
