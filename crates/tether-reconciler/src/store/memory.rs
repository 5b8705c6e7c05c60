//! In-memory collaborator implementations.
//!
//! [`MemoryStore`] implements the store contract over process-local maps:
//! handy for tests and for running the reconciler standalone against a
//! scripted provider. Deletion follows the declarative convention: an
//! upstream delete stamps `metadata.deletionTimestamp`, and the object is
//! actually removed by the first `update` that finds the deletion stamp
//! with no finalizers left.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tether_core::{ConnectionDetails, Kind, ObjectKey, Resource};

use super::{
    ConnectionPublisher, Event, EventRecorder, ObjectStore, PublishError, StoreError, WatchHandler,
};

type KindObjects = BTreeMap<ObjectKey, Resource>;

/// Process-local watchable object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<Kind, KindObjects>>,
    watches: RwLock<HashMap<Kind, Vec<WatchHandler>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces an object, as an upstream actor would.
    pub fn apply(&self, resource: Resource) {
        let kind = resource.kind().expect("applied objects carry a kind");
        self.objects
            .write()
            .expect("object map poisoned")
            .entry(kind.clone())
            .or_default()
            .insert(resource.object_key(), resource.clone());
        self.notify(&kind, &resource);
    }

    /// Marks an object for deletion, as an upstream actor would.
    ///
    /// The object stays visible (with a deletion timestamp) until its
    /// finalizers clear.
    pub fn mark_deleted(&self, kind: &Kind, key: &ObjectKey) {
        let updated = {
            let mut objects = self.objects.write().expect("object map poisoned");
            objects.get_mut(kind).and_then(|of_kind| {
                of_kind.get_mut(key).map(|resource| {
                    resource.set_deletion_timestamp("1970-01-01T00:00:01Z");
                    resource.clone()
                })
            })
        };
        if let Some(resource) = updated {
            self.notify(kind, &resource);
        }
    }

    /// Synchronous lookup, for assertions in polling test loops.
    #[must_use]
    pub fn get_cloned(&self, kind: &Kind, key: &ObjectKey) -> Option<Resource> {
        self.objects
            .read()
            .expect("object map poisoned")
            .get(kind)
            .and_then(|of_kind| of_kind.get(key))
            .cloned()
    }

    /// Number of objects of a kind currently stored.
    #[must_use]
    pub fn count(&self, kind: &Kind) -> usize {
        self.objects
            .read()
            .expect("object map poisoned")
            .get(kind)
            .map_or(0, BTreeMap::len)
    }

    fn notify(&self, kind: &Kind, resource: &Resource) {
        let watches = self.watches.read().expect("watch map poisoned");
        if let Some(handlers) = watches.get(kind) {
            for handler in handlers {
                handler(resource);
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Option<Resource>, StoreError> {
        Ok(self
            .objects
            .read()
            .expect("object map poisoned")
            .get(kind)
            .and_then(|of_kind| of_kind.get(key))
            .cloned())
    }

    async fn list(&self, kind: &Kind) -> Result<Vec<Resource>, StoreError> {
        Ok(self
            .objects
            .read()
            .expect("object map poisoned")
            .get(kind)
            .map(|of_kind| of_kind.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update(&self, resource: &Resource) -> Result<(), StoreError> {
        let kind = resource.kind().map_err(|e| StoreError::Backend {
            message: e.to_string(),
        })?;
        let key = resource.object_key();

        {
            let mut objects = self.objects.write().expect("object map poisoned");
            let of_kind = objects.entry(kind.clone()).or_default();
            if !of_kind.contains_key(&key) {
                return Err(StoreError::Conflict { key });
            }
            if resource.deletion_timestamp().is_some() && resource.finalizers().is_empty() {
                // Watchers see the final state once; the next get is None.
                of_kind.remove(&key);
            } else {
                of_kind.insert(key, resource.clone());
            }
        }

        self.notify(&kind, resource);
        Ok(())
    }

    async fn update_status(&self, resource: &Resource) -> Result<(), StoreError> {
        let kind = resource.kind().map_err(|e| StoreError::Backend {
            message: e.to_string(),
        })?;
        let key = resource.object_key();

        let mut objects = self.objects.write().expect("object map poisoned");
        let of_kind = objects.entry(kind).or_default();
        match of_kind.get_mut(&key) {
            Some(stored) => {
                // Only the status subtree moves on this path.
                if let Some(status) = resource.value().get("status") {
                    let mut value = stored.value().clone();
                    value["status"] = status.clone();
                    *stored = Resource::from_value(value).expect("stored roots are mappings");
                }
                Ok(())
            }
            None => Err(StoreError::Conflict { key }),
        }
    }

    fn add_watch(&self, kind: &Kind, handler: WatchHandler) -> Result<(), StoreError> {
        self.watches
            .write()
            .expect("watch map poisoned")
            .entry(kind.clone())
            .or_default()
            .push(handler);
        Ok(())
    }
}

/// Publisher that retains the last details per object key.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<HashMap<String, ConnectionDetails>>,
}

impl MemoryPublisher {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The last details published for an object, if any.
    #[must_use]
    pub fn get(&self, resource: &Resource) -> Option<ConnectionDetails> {
        self.published
            .lock()
            .expect("published map poisoned")
            .get(&resource.object_key().to_string())
            .cloned()
    }
}

#[async_trait]
impl ConnectionPublisher for MemoryPublisher {
    async fn publish(
        &self,
        resource: &Resource,
        details: &ConnectionDetails,
    ) -> Result<(), PublishError> {
        self.published
            .lock()
            .expect("published map poisoned")
            .insert(resource.object_key().to_string(), details.clone());
        Ok(())
    }
}

/// Recorder that retains events per object key.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<(String, Event)>>,
}

impl MemoryRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reasons recorded for an object, in order.
    #[must_use]
    pub fn reasons_for(&self, resource: &Resource) -> Vec<String> {
        let key = resource.object_key().to_string();
        self.events
            .lock()
            .expect("event log poisoned")
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, e)| e.reason.clone())
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, resource: &Resource, event: Event) {
        self.events
            .lock()
            .expect("event log poisoned")
            .push((resource.object_key().to_string(), event));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn widget_kind() -> Kind {
        Kind::new("example.org", "v1", "Widget")
    }

    fn widget(name: &str) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "example.org/v1",
            "kind": "Widget",
            "metadata": { "name": name },
            "spec": { "size": 3 },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn apply_get_list_round_trip() {
        let store = MemoryStore::new();
        store.apply(widget("w1"));
        store.apply(widget("w2"));

        let key = ObjectKey::new("", "w1");
        let fetched = store.get(&widget_kind(), &key).await.unwrap().unwrap();
        assert_eq!(fetched.name(), "w1");
        assert_eq!(store.list(&widget_kind()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn watch_fires_on_apply_and_update() {
        let store = MemoryStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        store
            .add_watch(
                &widget_kind(),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        store.apply(widget("w1"));
        let mut updated = widget("w1");
        updated.add_finalizer("tether.io/external-resource");
        store.update(&updated).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deletion_removes_once_finalizers_clear() {
        let store = MemoryStore::new();
        let mut resource = widget("w1");
        resource.add_finalizer("tether.io/external-resource");
        store.apply(resource.clone());

        let key = ObjectKey::new("", "w1");
        store.mark_deleted(&widget_kind(), &key);

        // Still present while the finalizer holds.
        let held = store.get(&widget_kind(), &key).await.unwrap().unwrap();
        assert!(held.deletion_timestamp().is_some());

        // Clearing the finalizer releases the object.
        let mut cleared = held;
        cleared.remove_finalizer("tether.io/external-resource");
        store.update(&cleared).await.unwrap();
        assert!(store.get(&widget_kind(), &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_status_only_moves_status() {
        let store = MemoryStore::new();
        store.apply(widget("w1"));

        let mut copy = widget("w1");
        copy.set_condition(tether_core::Condition::ok("Ready", "Available"));
        // Mutate spec on the copy; it must not reach the store.
        let mut value = copy.value().clone();
        value["spec"]["size"] = json!(9);
        let copy = Resource::from_value(value).unwrap();
        store.update_status(&copy).await.unwrap();

        let stored = store
            .get(&widget_kind(), &ObjectKey::new("", "w1"))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.condition("Ready").unwrap().status);
        assert_eq!(stored.value().pointer("/spec/size"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn update_of_missing_object_conflicts() {
        let store = MemoryStore::new();
        let err = store.update(&widget("ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
