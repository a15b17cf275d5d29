//! Live, prefix-filtered projections of the store.
//!
//! A [`CollectionView`] presents every key under a prefix as a set of typed
//! items. The decoded item map is a pure function of the authoritative
//! mirror restricted to the prefix; local adds and removes go through the
//! same pending buffer as single resources, keyed `prefix + id`, and show up
//! in the view only once the authority echoes them back.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    events::Subscribers,
    store::{KeyObserver, StoreInner},
    value::{ResourceCodec, Value},
    Error,
};

/// Events emitted by a collection, observed via [`CollectionView::subscribe`].
///
/// An absent-to-present transition fires `ItemCreated` only; a value change
/// of a present item fires `ItemUpdated` only.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum CollectionEvent {
    ItemCreated(String),
    ItemUpdated(String),
    ItemRemoved(String),
}

impl CollectionEvent {
    pub fn id(&self) -> &str {
        match self {
            CollectionEvent::ItemCreated(id)
            | CollectionEvent::ItemUpdated(id)
            | CollectionEvent::ItemRemoved(id) => id,
        }
    }
}

pub(crate) struct CollectionCore<T, C> {
    prefix: String,
    codec: C,
    store: Weak<StoreInner>,
    items: Mutex<HashMap<String, T>>,
    subscribers: Mutex<Subscribers<CollectionEvent>>,
}

impl<T, C> fmt::Debug for CollectionCore<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionCore")
            .field("prefix", &self.prefix)
            .field("items", &self.items.lock().len())
            .finish()
    }
}

impl<T, C> CollectionCore<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: ResourceCodec<T>,
{
    pub(crate) fn new(prefix: &str, codec: C, store: &Arc<StoreInner>) -> Arc<Self> {
        // seed from the current mirror so a late view observes earlier state
        let items = store
            .snapshot_prefix(prefix)
            .into_iter()
            .filter_map(|(id, raw)| codec.decode(&raw).map(|item| (id, item)))
            .collect();
        Arc::new(Self {
            prefix: prefix.to_string(),
            codec,
            store: Arc::downgrade(store),
            items: Mutex::new(items),
            subscribers: Default::default(),
        })
    }
}

impl<T, C> KeyObserver for CollectionCore<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: ResourceCodec<T>,
{
    fn on_key_changed(&self, key: &str, value: Option<&Value>) {
        let Some(id) = key.strip_prefix(&self.prefix) else {
            return;
        };
        if id.is_empty() {
            return;
        }
        // an undecodable payload counts as absent from the typed view
        let decoded = value.and_then(|raw| self.codec.decode(raw));
        let mut items = self.items.lock();
        let event = match decoded {
            Some(item) => match items.insert(id.to_string(), item) {
                None => CollectionEvent::ItemCreated(id.to_string()),
                Some(_) => CollectionEvent::ItemUpdated(id.to_string()),
            },
            None => {
                if items.remove(id).is_none() {
                    return;
                }
                CollectionEvent::ItemRemoved(id.to_string())
            }
        };
        drop(items);
        trace!(prefix = %self.prefix, %event, "collection event");
        self.subscribers.lock().send(event);
    }
}

/// A live set of typed items selected by key prefix.
///
/// Obtained from `StateStore::get_collection`. Reads come from the decoded
/// cache; mutations are staged into the store's pending buffer.
pub struct CollectionView<T, C = crate::value::JsonCodec> {
    core: Arc<CollectionCore<T, C>>,
}

impl<T, C> fmt::Debug for CollectionView<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionView({:?})", self.core.prefix)
    }
}

impl<T, C> Clone for CollectionView<T, C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T, C> CollectionView<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: ResourceCodec<T>,
{
    pub(crate) fn new(core: Arc<CollectionCore<T, C>>) -> Self {
        Self { core }
    }

    /// The key prefix selecting this collection.
    pub fn prefix(&self) -> &str {
        &self.core.prefix
    }

    fn store(&self) -> Result<Arc<StoreInner>, Error> {
        self.core.store.upgrade().ok_or(Error::Closed)
    }

    /// Stage a write of `prefix + id`.
    pub fn add(&self, id: &str, item: &T) -> Result<(), Error> {
        if id.is_empty() {
            return Err(Error::EmptyKey);
        }
        let raw = self.core.codec.encode(item);
        self.store()?
            .schedule_set(&format!("{}{id}", self.core.prefix), raw)
    }

    /// Stage a removal of `prefix + id`.
    pub fn remove(&self, id: &str) -> Result<(), Error> {
        if id.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.store()?
            .schedule_remove(&format!("{}{id}", self.core.prefix))
    }

    pub fn len(&self) -> usize {
        self.core.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.items.lock().is_empty()
    }

    pub fn contains_key(&self, id: &str) -> bool {
        self.core.items.lock().contains_key(id)
    }

    /// The decoded item under `id`, if present in the authority.
    pub fn get(&self, id: &str) -> Option<T> {
        self.core.items.lock().get(id).cloned()
    }

    /// The ids of all present items, unordered.
    pub fn ids(&self) -> Vec<String> {
        self.core.items.lock().keys().cloned().collect()
    }

    /// Subscribe to item events derived from store key events.
    pub fn subscribe(&self) -> flume::Receiver<CollectionEvent> {
        self.core.subscribers.lock().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::{
        channel::{mem::MemServer, StateChannel},
        store::{StateStore, StoreOpts},
        value::SessionToken,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Avatar {
        name: String,
        hue: f64,
    }

    async fn recv(rx: &flume::Receiver<CollectionEvent>) -> CollectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn store_on(server: &Arc<MemServer>) -> StateStore {
        StateStore::spawn(server.connect(), StoreOpts::default())
    }

    #[tokio::test]
    async fn create_update_remove_distinction() {
        let server = MemServer::new();
        let store = store_on(&server);
        let avatars = store.get_collection::<Avatar>("avatar.");
        let events = avatars.subscribe();

        let alice = Avatar {
            name: "alice".to_string(),
            hue: 0.3,
        };
        avatars.add("abc", &alice).unwrap();
        // nothing observable until the authority confirms
        assert!(avatars.is_empty());
        store.flush().await;

        assert_eq!(
            recv(&events).await,
            CollectionEvent::ItemCreated("abc".to_string())
        );
        assert_eq!(avatars.get("abc"), Some(alice.clone()));
        assert_eq!(avatars.len(), 1);
        assert!(avatars.contains_key("abc"));

        let brighter = Avatar {
            name: "alice".to_string(),
            hue: 0.9,
        };
        avatars.add("abc", &brighter).unwrap();
        store.flush().await;
        assert_eq!(
            recv(&events).await,
            CollectionEvent::ItemUpdated("abc".to_string())
        );

        avatars.remove("abc").unwrap();
        store.flush().await;
        assert_eq!(
            recv(&events).await,
            CollectionEvent::ItemRemoved("abc".to_string())
        );
        assert!(avatars.is_empty());
    }

    #[tokio::test]
    async fn only_prefixed_keys_are_projected() {
        let server = MemServer::new();
        let store = store_on(&server);
        let avatars = store.get_collection::<Value>("avatar.");
        let events = avatars.subscribe();
        let store_events = store.subscribe();
        store.schedule_set("other.abc", json!(1)).unwrap();
        store.schedule_set("avatar.abc", json!(2)).unwrap();
        store.flush().await;
        // wait for both keys to round-trip
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), store_events.recv_async())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(avatars.ids(), vec!["abc".to_string()]);
        assert_eq!(
            recv(&events).await,
            CollectionEvent::ItemCreated("abc".to_string())
        );
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn late_view_sees_existing_items() {
        let server = MemServer::new();
        let seeder = server.connect();
        seeder
            .request_update(
                &SessionToken::generate(),
                BTreeMap::from([("item.a".to_string(), json!({"name": "a", "hue": 0.1}))]),
                vec![],
            )
            .await
            .unwrap();
        let store = store_on(&server);
        let store_events = store.subscribe();
        tokio::time::timeout(Duration::from_secs(5), store_events.recv_async())
            .await
            .unwrap()
            .unwrap();
        let items = store.get_collection::<Avatar>("item.");
        assert_eq!(items.len(), 1);
        assert!(items.contains_key("a"));
    }

    #[tokio::test]
    async fn undecodable_items_are_absent() {
        let server = MemServer::new();
        let store = store_on(&server);
        let items = store.get_collection::<Avatar>("item.");
        let events = items.subscribe();
        store.schedule_set("item.good", json!({"name": "g", "hue": 0.5})).unwrap();
        store.schedule_set("item.bad", json!("not an avatar")).unwrap();
        store.flush().await;
        assert_eq!(
            recv(&events).await,
            CollectionEvent::ItemCreated("good".to_string())
        );
        assert_eq!(items.len(), 1);
        assert!(!items.contains_key("bad"));
    }

    #[tokio::test]
    async fn view_creation_racing_an_update_never_loses_the_key() {
        let server = MemServer::new();
        let seeder = server.connect();
        for round in 0..50u32 {
            let store = store_on(&server);
            let store_events = store.subscribe();
            let key = format!("race.{round}");
            let write = {
                let seeder = seeder.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    seeder
                        .request_update(
                            &SessionToken::generate(),
                            BTreeMap::from([(key, json!(round))]),
                            vec![],
                        )
                        .await
                        .unwrap();
                })
            };
            let view = store.get_collection::<Value>("race.");
            // store-level subscribers are notified after observers, so once
            // the event for our key arrives the view must contain it
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), store_events.recv_async())
                    .await
                    .unwrap()
                    .unwrap();
                if event.key() == key {
                    break;
                }
            }
            assert!(view.contains_key(&round.to_string()), "round {round}");
            write.await.unwrap();
            store.close().await;
        }
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let server = MemServer::new();
        let store = store_on(&server);
        let items = store.get_collection::<Value>("item.");
        assert!(matches!(items.add("", &json!(1)), Err(Error::EmptyKey)));
        assert!(matches!(items.remove(""), Err(Error::EmptyKey)));
    }
}
