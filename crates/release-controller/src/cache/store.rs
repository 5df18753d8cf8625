//! In-memory object store with monotonic visibility.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::backend::{ObjectList, WatchEvent};
use crate::model::{ObjectKey, Resource};

#[derive(Debug)]
struct StoreState<T> {
    objects: HashMap<ObjectKey, T>,
    /// Highest version applied or listed per namespace.
    versions: HashMap<String, u64>,
}

impl<T> Default for StoreState<T> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            versions: HashMap::new(),
        }
    }
}

impl<T: Resource> StoreState<T> {
    fn observe_version(&mut self, namespace: &str, version: u64) {
        let entry = self.versions.entry(namespace.to_string()).or_default();
        *entry = (*entry).max(version);
    }

    /// Returns true if `version` is newer than anything known for `key`.
    ///
    /// A key the store does not hold is compared against the namespace
    /// version: its object was deleted, or never listed, at or after that
    /// version.
    fn is_newer(&self, key: &ObjectKey, version: u64) -> bool {
        let known = match self.objects.get(key) {
            Some(held) => held.resource_version(),
            None => self.versions.get(&key.namespace).copied().unwrap_or(0),
        };
        version > known
    }
}

/// Thread-safe cache of one resource kind across namespaces.
///
/// Cloning is cheap and every clone sees the same contents. Only informers
/// write to a store.
///
/// ## Monotonic visibility
///
/// An event carrying a version older than or equal to the version already
/// held for the object is ignored, so readers never see an object go back in
/// time. An event for an object the store does not hold must be newer than
/// the namespace version, so a late add cannot resurrect a deleted object.
/// The store keeps no per-object record of deletes.
#[derive(Debug, Clone)]
pub struct Store<T> {
    state: Arc<RwLock<StoreState<T>>>,
}

impl<T: Resource> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> Store<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    /// Returns the objects of a namespace ordered by name.
    #[must_use]
    pub fn list(&self, namespace: &str) -> Vec<T> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut objects: Vec<T> = state
            .objects
            .values()
            .filter(|object| object.namespace() == namespace)
            .cloned()
            .collect();
        drop(state);
        objects.sort_by(|a, b| a.name().cmp(b.name()));
        objects
    }

    /// Returns one object, or `None` if it is not (yet) known.
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<T> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.objects.get(&ObjectKey::new(namespace, name)).cloned()
    }

    /// Returns the highest version applied for a namespace.
    #[must_use]
    pub fn latest_version_in(&self, namespace: &str) -> u64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.versions.get(namespace).copied().unwrap_or(0)
    }

    /// Applies a watch event.
    ///
    /// Returns true if the event changed the store.
    pub fn apply(&self, event: &WatchEvent<T>) -> bool {
        let object = event.object();
        let key = object.key();
        let version = object.resource_version();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.is_newer(&key, version) {
            return false;
        }
        state.observe_version(object.namespace(), version);

        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                state.objects.insert(key, object.clone());
                true
            }
            WatchEvent::Deleted(_) => state.objects.remove(&key).is_some(),
        }
    }

    /// Replaces the contents of a namespace with a fresh listing.
    ///
    /// Listed objects newer than what the store holds are added or modified;
    /// held objects absent from the listing are deleted. The namespace version
    /// moves up to the listing's version, so buffered events the listing
    /// already covers are ignored afterwards. Returns the events that changed
    /// the store so handlers can be notified.
    pub fn replace(&self, namespace: &str, listing: ObjectList<T>) -> Vec<WatchEvent<T>> {
        let listed: HashMap<ObjectKey, T> = listing
            .items
            .into_iter()
            .filter(|object| object.namespace() == namespace)
            .map(|object| (object.key(), object))
            .collect();
        let list_version = listed
            .values()
            .map(Resource::resource_version)
            .fold(listing.resource_version, u64::max);

        let mut changes = Vec::new();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let stale: Vec<ObjectKey> = state
            .objects
            .keys()
            .filter(|key| key.namespace == namespace && !listed.contains_key(key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(object) = state.objects.remove(&key) {
                changes.push(WatchEvent::Deleted(object));
            }
        }

        for (key, object) in listed {
            let event = match state.objects.get(&key) {
                Some(held) if held.resource_version() >= object.resource_version() => continue,
                Some(_) => WatchEvent::Modified(object.clone()),
                None => WatchEvent::Added(object.clone()),
            };
            state.objects.insert(key, object);
            changes.push(event);
        }

        state.observe_version(namespace, list_version);
        drop(state);
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComponentTag, ImageStream};
    use chrono::Utc;

    fn stream(name: &str, version: u64, tags: &[&str]) -> ImageStream {
        let mut stream = ImageStream::new("ci", name);
        stream.resource_version = version;
        for tag in tags {
            stream = stream.with_tag(ComponentTag::new(*tag, format!("img/{tag}"), Utc::now()));
        }
        stream
    }

    #[test]
    fn older_versions_are_ignored() {
        let store = Store::new();
        assert!(store.apply(&WatchEvent::Added(stream("stable", 5, &["cli", "installer"]))));
        assert!(!store.apply(&WatchEvent::Modified(stream("stable", 3, &["cli"]))));
        assert!(!store.apply(&WatchEvent::Modified(stream("stable", 5, &["cli"]))));

        let held = store.get("ci", "stable").unwrap();
        assert_eq!(held.resource_version, 5);
        assert_eq!(held.tags.len(), 2);
        assert_eq!(store.latest_version_in("ci"), 5);
    }

    #[test]
    fn deletes_are_not_resurrected_by_late_adds() {
        let store = Store::new();
        store.apply(&WatchEvent::Added(stream("stable", 1, &["cli"])));
        assert!(store.apply(&WatchEvent::Deleted(stream("stable", 4, &["cli"]))));
        assert!(store.get("ci", "stable").is_none());

        assert!(!store.apply(&WatchEvent::Modified(stream("stable", 3, &["cli"]))));
        assert!(store.get("ci", "stable").is_none());

        assert!(store.apply(&WatchEvent::Added(stream("stable", 6, &["cli"]))));
        assert!(store.get("ci", "stable").is_some());
    }

    #[test]
    fn list_is_scoped_to_namespace_and_sorted() {
        let store = Store::new();
        store.apply(&WatchEvent::Added(stream("b", 1, &[])));
        store.apply(&WatchEvent::Added(stream("a", 2, &[])));
        let mut other = stream("c", 3, &[]);
        other.namespace = "other".into();
        store.apply(&WatchEvent::Added(other));

        let names: Vec<String> = store.list("ci").into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.list("other").len(), 1);
    }

    #[test]
    fn replace_reports_adds_and_deletes() {
        let store = Store::new();
        store.apply(&WatchEvent::Added(stream("old", 1, &[])));
        store.apply(&WatchEvent::Added(stream("kept", 2, &[])));

        let changes = store.replace(
            "ci",
            ObjectList {
                items: vec![stream("kept", 2, &[]), stream("new", 3, &[])],
                resource_version: 3,
            },
        );
        let kinds: Vec<(&str, String)> = changes
            .iter()
            .map(|e| (e.kind(), e.object().name.clone()))
            .collect();

        assert!(kinds.contains(&("added", "new".to_string())));
        assert!(kinds.contains(&("deleted", "old".to_string())));
        assert!(!kinds.iter().any(|(_, name)| name == "kept"));
        assert!(store.get("ci", "old").is_none());
        assert_eq!(store.latest_version_in("ci"), 3);
    }

    #[test]
    fn buffered_events_older_than_the_listing_are_ignored() {
        let store = Store::new();
        // Created at 5 and deleted at 6, both before a listing taken at 7.
        let changes = store.replace(
            "ci",
            ObjectList {
                items: vec![stream("kept", 2, &[])],
                resource_version: 7,
            },
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(store.latest_version_in("ci"), 7);

        assert!(!store.apply(&WatchEvent::Added(stream("gone", 5, &[]))));
        assert!(!store.apply(&WatchEvent::Deleted(stream("gone", 6, &[]))));
        assert!(store.get("ci", "gone").is_none());
        assert!(!store.apply(&WatchEvent::Modified(stream("kept", 2, &[]))));

        assert!(store.apply(&WatchEvent::Added(stream("fresh", 8, &[]))));
        assert_eq!(store.list("ci").len(), 2);
    }

    #[test]
    fn deleted_objects_leave_nothing_behind() {
        let store = Store::new();
        for (version, name) in (1..=50).zip((0..50).map(|i| format!("tag-{i}"))) {
            store.apply(&WatchEvent::Added(stream(&name, version * 2 - 1, &[])));
            store.apply(&WatchEvent::Deleted(stream(&name, version * 2, &[])));
        }
        let state = store.state.read().unwrap();
        assert!(state.objects.is_empty());
        assert_eq!(state.versions.get("ci"), Some(&100));
    }
}
