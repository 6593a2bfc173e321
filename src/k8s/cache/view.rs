/**
 * Views and flush targets
 *
 * A `ResourceView` turns one object into one row of the client payload. A
 * `FlushTarget` owns a topic and renders the rows published to it whenever
 * the cache it is registered on flushes. A row that fails to serialize is
 * skipped so one malformed object never kills a stream.
 */
use super::watch_cache::WatchCache;
use crate::error::{Error, Result};
use crate::k8s::source::Object;
use crate::k8s::stream::StreamTopic;
use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::serde_json::{self, Value, json};
use kube::ResourceExt;
use std::sync::{Arc, Weak};
use tracing::warn;

/// Payload of a snapshot with no rows
pub const EMPTY_SNAPSHOT: &[u8] = b"[]";

#[must_use]
pub const fn empty_snapshot() -> Bytes {
    Bytes::from_static(EMPTY_SNAPSHOT)
}

/// Per-kind transform from object to client row
pub trait ResourceView<K>: Send + Sync {
    /// # Errors
    ///
    /// Returns `Error::Serialization` when the object cannot be represented
    fn row(&self, obj: &K) -> Result<Value>;
}

impl<K, F> ResourceView<K> for F
where
    F: Fn(&K) -> Result<Value> + Send + Sync,
{
    fn row(&self, obj: &K) -> Result<Value> {
        self(obj)
    }
}

/// The full object as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectView;

impl<K: Object> ResourceView<K> for ObjectView {
    fn row(&self, obj: &K) -> Result<Value> {
        serde_json::to_value(obj).map_err(|e| Error::Serialization {
            object: obj.name_any(),
            message: e.to_string(),
        })
    }
}

/// Identity and age columns common to every kind
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryView;

impl<K: Object> ResourceView<K> for SummaryView {
    fn row(&self, obj: &K) -> Result<Value> {
        Ok(json!({
            "kind": K::kind(&()),
            "name": obj.name_any(),
            "namespace": obj.namespace(),
            "uid": obj.uid(),
            "resourceVersion": obj.resource_version(),
            "created": obj.creation_timestamp().map(|t| t.0.to_string()),
        }))
    }
}

/// Render `objects` as a JSON array, skipping rows that fail to serialize
pub fn render_rows<K: Object>(view: &dyn ResourceView<K>, objects: &[Arc<K>]) -> Bytes {
    let rows: Vec<Value> = objects
        .iter()
        .filter_map(|obj| match view.row(obj) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!("⚠️ Skipping {} {}: {}", K::kind(&()), obj.name_any(), e);
                None
            }
        })
        .collect();

    if rows.is_empty() {
        return empty_snapshot();
    }
    serde_json::to_vec(&rows).map_or_else(
        |e| {
            warn!("⚠️ Failed to encode {} snapshot: {}", K::kind(&()), e);
            empty_snapshot()
        },
        Bytes::from,
    )
}

/// A topic rendered from a cache's snapshot on every flush
#[async_trait]
pub trait FlushTarget<K>: Send + Sync {
    fn topic(&self) -> &StreamTopic;

    async fn render(&self, objects: &[Arc<K>]) -> Result<Bytes>;
}

type Filter<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// The kind's snapshot, optionally narrowed, rendered through a view
pub struct ViewTarget<K> {
    topic: StreamTopic,
    view: Arc<dyn ResourceView<K>>,
    filter: Option<Filter<K>>,
}

impl<K: Object> ViewTarget<K> {
    #[must_use]
    pub fn new(topic: StreamTopic, view: Arc<dyn ResourceView<K>>) -> Self {
        Self {
            topic,
            view,
            filter: None,
        }
    }

    /// Narrow to objects in `namespace` and/or named `name`
    #[must_use]
    pub fn selecting(self, namespace: Option<String>, name: Option<String>) -> Self {
        if namespace.is_none() && name.is_none() {
            return self;
        }
        self.filtered(move |obj: &K| {
            namespace.as_ref().is_none_or(|ns| obj.namespace().as_ref() == Some(ns))
                && name.as_ref().is_none_or(|n| &obj.name_any() == n)
        })
    }

    #[must_use]
    pub fn filtered(mut self, filter: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

#[async_trait]
impl<K: Object> FlushTarget<K> for ViewTarget<K> {
    fn topic(&self) -> &StreamTopic {
        &self.topic
    }

    async fn render(&self, objects: &[Arc<K>]) -> Result<Bytes> {
        match &self.filter {
            Some(filter) => {
                let selected: Vec<Arc<K>> =
                    objects.iter().filter(|obj| filter(obj)).cloned().collect();
                Ok(render_rows(self.view.as_ref(), &selected))
            }
            None => Ok(render_rows(self.view.as_ref(), objects)),
        }
    }
}

/// Children of one owner object, e.g. the pods of a `ReplicaSet`.
///
/// Registered on the owner's cache directly and on the children's cache via
/// [`OwnedTrigger`], so a change to either re-publishes the topic without a
/// dedicated watch. Holds the caches weakly; a torn-down cache renders as
/// empty.
pub struct OwnedTarget<P: Object, S: Object> {
    topic: StreamTopic,
    owner_name: String,
    owner_namespace: Option<String>,
    owners: Weak<WatchCache<P>>,
    children: Weak<WatchCache<S>>,
    view: Arc<dyn ResourceView<S>>,
}

impl<P: Object, S: Object> OwnedTarget<P, S> {
    #[must_use]
    pub fn new(
        topic: StreamTopic,
        owner_name: String,
        owner_namespace: Option<String>,
        owners: &Arc<WatchCache<P>>,
        children: &Arc<WatchCache<S>>,
        view: Arc<dyn ResourceView<S>>,
    ) -> Self {
        Self {
            topic,
            owner_name,
            owner_namespace,
            owners: Arc::downgrade(owners),
            children: Arc::downgrade(children),
            view,
        }
    }

    fn render_from(&self, owners: &[Arc<P>], children: &[Arc<S>]) -> Bytes {
        let owner_uid = owners
            .iter()
            .find(|o| {
                o.name_any() == self.owner_name && o.namespace() == self.owner_namespace
            })
            .and_then(|o| o.uid());

        let Some(owner_uid) = owner_uid else {
            return empty_snapshot();
        };

        let owned: Vec<Arc<S>> = children
            .iter()
            .filter(|child| {
                child
                    .owner_references()
                    .iter()
                    .any(|reference| reference.uid == owner_uid)
            })
            .cloned()
            .collect();
        render_rows(self.view.as_ref(), &owned)
    }
}

#[async_trait]
impl<P: Object, S: Object> FlushTarget<P> for OwnedTarget<P, S> {
    fn topic(&self) -> &StreamTopic {
        &self.topic
    }

    async fn render(&self, objects: &[Arc<P>]) -> Result<Bytes> {
        let Some(children) = self.children.upgrade() else {
            return Ok(empty_snapshot());
        };
        let children = children.snapshot().await;
        Ok(self.render_from(objects, &children))
    }
}

/// Re-publishes an [`OwnedTarget`] when the children's cache changes
pub struct OwnedTrigger<P: Object, S: Object>(pub Arc<OwnedTarget<P, S>>);

#[async_trait]
impl<P: Object, S: Object> FlushTarget<S> for OwnedTrigger<P, S> {
    fn topic(&self) -> &StreamTopic {
        &self.0.topic
    }

    async fn render(&self, objects: &[Arc<S>]) -> Result<Bytes> {
        let Some(owners) = self.0.owners.upgrade() else {
            return Ok(empty_snapshot());
        };
        let owners = owners.snapshot().await;
        Ok(self.0.render_from(&owners, objects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::registry::ConnectionKey;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    fn pod(ns: &str, name: &str) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn names(payload: &Bytes) -> Vec<String> {
        let rows: Vec<Value> = serde_json::from_slice(payload).unwrap();
        rows.iter()
            .map(|r| r["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_empty_snapshot_is_explicit() {
        let payload = render_rows::<Pod>(&SummaryView, &[]);
        assert_eq!(payload.as_ref(), b"[]");
    }

    #[test]
    fn test_failing_rows_are_skipped() {
        let view = |p: &Pod| -> Result<Value> {
            if p.name_any() == "bad" {
                Err(Error::Serialization {
                    object: "bad".to_string(),
                    message: "boom".to_string(),
                })
            } else {
                Ok(json!({ "name": p.name_any() }))
            }
        };
        let payload = render_rows(&view, &[pod("default", "good"), pod("default", "bad")]);
        assert_eq!(names(&payload), vec!["good"]);
    }

    #[tokio::test]
    async fn test_view_target_selects_namespace() {
        let topic = StreamTopic::new(ConnectionKey::new("dev", "kind"), "Pod");
        let target = ViewTarget::new(topic, Arc::new(SummaryView))
            .selecting(Some("default".to_string()), None);

        let payload = target
            .render(&[pod("default", "web"), pod("kube-system", "dns")])
            .await
            .unwrap();
        assert_eq!(names(&payload), vec!["web"]);
    }
}
