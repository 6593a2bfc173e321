use crate::k8s::source::Object;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;

/// UID-keyed mirror of one kind. Owned by a single writer (the list-watch
/// worker); readers take sorted point-in-time snapshots.
#[derive(Debug)]
pub struct Store<K> {
    objects: HashMap<String, Arc<K>>,
    resource_version: Option<String>,
    synced: bool,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            resource_version: None,
            synced: false,
        }
    }
}

/// Store key: the object UID, or namespace/name for objects without one
fn store_key<K: Object>(obj: &K) -> String {
    obj.uid().unwrap_or_else(|| {
        format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
    })
}

impl<K: Object> Store<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole content with a fresh list result and mark synced
    pub fn replace(&mut self, items: Vec<K>, resource_version: String) {
        self.objects = items
            .into_iter()
            .map(|obj| (store_key(&obj), Arc::new(obj)))
            .collect();
        self.resource_version = Some(resource_version);
        self.synced = true;
    }

    /// Insert or update an object
    pub fn apply(&mut self, obj: K) {
        if let Some(rv) = obj.resource_version() {
            self.resource_version = Some(rv);
        }
        self.objects.insert(store_key(&obj), Arc::new(obj));
    }

    /// Remove an object. Returns `false` if it was not mirrored.
    pub fn delete(&mut self, obj: &K) -> bool {
        if let Some(rv) = obj.resource_version() {
            self.resource_version = Some(rv);
        }
        self.objects.remove(&store_key(obj)).is_some()
    }

    pub fn set_resource_version(&mut self, resource_version: String) {
        self.resource_version = Some(resource_version);
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    #[must_use]
    pub const fn is_synced(&self) -> bool {
        self.synced
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All objects ordered by (namespace, name)
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<K>> {
        let mut objects: Vec<Arc<K>> = self.objects.values().cloned().collect();
        objects.sort_by(|a, b| {
            (a.namespace(), a.name_any()).cmp(&(b.namespace(), b.name_any()))
        });
        objects
    }

    #[must_use]
    pub fn get(&self, name: &str, namespace: Option<&str>) -> Option<Arc<K>> {
        self.objects
            .values()
            .find(|obj| obj.name_any() == name && obj.namespace().as_deref() == namespace)
            .cloned()
    }
}
