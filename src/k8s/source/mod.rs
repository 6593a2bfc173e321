/**
 * Upstream list-watch sources
 *
 * A source enumerates one kind once (`list`), then streams ordered changes
 * from the returned resource version (`watch`). Sources signal an expired
 * resource version explicitly so the cache can re-list instead of silently
 * missing events. Direct single-object reads and deletes bypass the cache.
 */
pub mod kube_source;
pub mod memory;

pub use kube_source::{KubeBinder, KubeSource};
pub use memory::MemorySource;
#[cfg(any(test, feature = "test-util"))]
pub use memory::SourceFailure;

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;

/// Objects the engine can mirror and stream
pub trait Object:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// Kind name used in topics, cache keys and logs
#[must_use]
pub fn kind_of<K: Object>() -> String {
    K::kind(&()).to_string()
}

/// Lowercase plural used for API verbs in errors (e.g. `pods`)
#[must_use]
pub fn plural_of<K: Object>() -> String {
    K::plural(&()).to_string()
}

/// Which slice of a kind a watch covers
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchScope {
    pub namespace: Option<String>,
    pub field_selector: Option<String>,
}

impl WatchScope {
    /// Every object of the kind, cluster-wide
    #[must_use]
    pub const fn all() -> Self {
        Self {
            namespace: None,
            field_selector: None,
        }
    }

    /// Events whose involved object is `name`
    #[must_use]
    pub fn involving(name: &str, namespace: Option<&str>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            field_selector: Some(format!("involvedObject.name={name}")),
        }
    }

    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.namespace.is_none() && self.field_selector.is_none()
    }
}

/// Result of a bulk list: the objects plus the version to watch from
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// One change observed on the watch stream
#[derive(Debug, Clone)]
pub enum SourceEvent<K> {
    /// Object added or modified
    Applied(K),
    Deleted(K),
    /// Progress marker carrying a newer resource version
    Bookmark(String),
    /// The resource version we are watching from is gone; re-list
    Expired,
}

pub type WatchStream<K> = BoxStream<'static, Result<SourceEvent<K>>>;

#[async_trait]
pub trait ResourceSource<K: Object>: Send + Sync {
    async fn list(&self) -> Result<ListPage<K>>;

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>>;

    /// Strongly consistent single-object read
    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<K> {
        let _ = (name, namespace);
        Err(Error::Unsupported(format!("direct get of {}", plural_of::<K>())))
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        let _ = (name, namespace);
        Err(Error::Unsupported(format!("delete of {}", plural_of::<K>())))
    }
}

/// Binds a cluster client to a source for one kind and scope
pub trait SourceBinder<C, K: Object>: Send + Sync {
    fn bind(&self, client: &C, scope: &WatchScope) -> Arc<dyn ResourceSource<K>>;
}

impl<C, K, F> SourceBinder<C, K> for F
where
    K: Object,
    F: Fn(&C, &WatchScope) -> Arc<dyn ResourceSource<K>> + Send + Sync,
{
    fn bind(&self, client: &C, scope: &WatchScope) -> Arc<dyn ResourceSource<K>> {
        self(client, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Event, Pod};

    #[test]
    fn test_kind_names() {
        assert_eq!(kind_of::<Pod>(), "Pod");
        assert_eq!(plural_of::<Pod>(), "pods");
        assert_eq!(kind_of::<Event>(), "Event");
    }

    #[test]
    fn test_involving_scope() {
        let scope = WatchScope::involving("web-1", Some("default"));
        assert_eq!(scope.field_selector.as_deref(), Some("involvedObject.name=web-1"));
        assert_eq!(scope.namespace.as_deref(), Some("default"));
        assert!(!scope.is_all());
        assert!(WatchScope::all().is_all());
    }
}
