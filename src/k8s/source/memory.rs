/**
 * In-memory list-watch source
 *
 * Behaves like an API server for a single kind: every mutation bumps a
 * resource version and is appended to a change log that watches replay from.
 * Compacting the log expires older resource versions. Used for offline runs
 * and, with the `test-util` feature, for injecting failures and token expiry.
 */
use super::{ListPage, Object, ResourceSource, SourceEvent, WatchStream, plural_of};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Failure mode injected into a [`MemorySource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFailure {
    Unreachable,
    Forbidden,
}

type WatchSender<K> = mpsc::UnboundedSender<Result<SourceEvent<K>>>;

struct Inner<K> {
    objects: BTreeMap<String, K>,
    revision: u64,
    log: Vec<(u64, SourceEvent<K>)>,
    compacted_at: u64,
    watchers: Vec<WatchSender<K>>,
    failure: Option<SourceFailure>,
    list_delay: Option<Duration>,
    direct_reads: bool,
}

pub struct MemorySource<K> {
    inner: Mutex<Inner<K>>,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl<K: Object> Default for MemorySource<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn object_key<K: Object>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

impl<K: Object> MemorySource<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                revision: 0,
                log: Vec::new(),
                compacted_at: 0,
                watchers: Vec::new(),
                failure: None,
                list_delay: None,
                direct_reads: true,
            }),
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let source = Self::new();
        for obj in objects {
            source.apply(obj);
        }
        source
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn broadcast(inner: &mut Inner<K>, event: &SourceEvent<K>) {
        inner
            .watchers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    /// Create or replace an object, keeping its uid stable across updates.
    /// Returns the stored object with its new resource version.
    pub fn apply(&self, mut obj: K) -> K {
        let mut inner = self.lock();
        let key = object_key(&obj);
        let uid = inner
            .objects
            .get(&key)
            .and_then(ResourceExt::uid)
            .or_else(|| obj.uid())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        inner.revision += 1;
        let revision = inner.revision;
        obj.meta_mut().uid = Some(uid);
        obj.meta_mut().resource_version = Some(revision.to_string());

        inner.objects.insert(key, obj.clone());
        let event = SourceEvent::Applied(obj.clone());
        Self::broadcast(&mut inner, &event);
        inner.log.push((revision, event));
        obj
    }

    /// Remove an object. Returns `false` if it did not exist.
    pub fn remove(&self, name: &str, namespace: Option<&str>) -> bool {
        let mut inner = self.lock();
        let key = format!("{}/{name}", namespace.unwrap_or_default());
        let Some(mut obj) = inner.objects.remove(&key) else {
            return false;
        };

        inner.revision += 1;
        let revision = inner.revision;
        obj.meta_mut().resource_version = Some(revision.to_string());
        let event = SourceEvent::Deleted(obj);
        Self::broadcast(&mut inner, &event);
        inner.log.push((revision, event));
        true
    }

    #[cfg(any(test, feature = "test-util"))]
    /// Start failing: open watches end with the matching error and every call
    /// fails until [`Self::recover`].
    pub fn fail(&self, failure: SourceFailure) {
        let mut inner = self.lock();
        inner.failure = Some(failure);
        for tx in inner.watchers.drain(..) {
            let _ = tx.send(Err(Self::failure_error(failure)));
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn recover(&self) {
        self.lock().failure = None;
    }

    #[cfg(any(test, feature = "test-util"))]
    /// Drop the change log: open watches receive `Expired` and any watch from
    /// an older resource version expires immediately.
    pub fn expire_watches(&self) {
        let mut inner = self.lock();
        inner.log.clear();
        inner.compacted_at = inner.revision;
        for tx in inner.watchers.drain(..) {
            let _ = tx.send(Ok(SourceEvent::Expired));
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    /// Delay every subsequent list call
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.lock().list_delay = delay;
    }

    /// Toggle support for direct reads; when off, `get` reports `Unsupported`
    pub fn set_direct_reads(&self, enabled: bool) {
        self.lock().direct_reads = enabled;
    }

    /// Number of watch streams currently held open by consumers
    pub fn active_watches(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|tx| !tx.is_closed());
        inner.watchers.len()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn failure_error(failure: SourceFailure) -> Error {
        match failure {
            SourceFailure::Unreachable => Error::Connection {
                target: plural_of::<K>(),
                message: "connection refused".to_string(),
            },
            SourceFailure::Forbidden => Error::Permission {
                verb: "list".to_string(),
                resource: plural_of::<K>(),
                message: "forbidden".to_string(),
            },
        }
    }

    fn check(&self) -> Result<()> {
        self.lock().failure.map_or(Ok(()), |f| Err(Self::failure_error(f)))
    }
}

#[async_trait]
impl<K: Object> ResourceSource<K> for MemorySource<K> {
    async fn list(&self) -> Result<ListPage<K>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.lock().list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;

        let inner = self.lock();
        Ok(ListPage {
            items: inner.objects.values().cloned().collect(),
            resource_version: inner.revision.to_string(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;

        let from: u64 = resource_version.parse().unwrap_or(0);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if from < inner.compacted_at {
            let _ = tx.send(Ok(SourceEvent::Expired));
        } else {
            for (_, event) in inner.log.iter().filter(|(rev, _)| *rev > from) {
                let _ = tx.send(Ok(event.clone()));
            }
            inner.watchers.push(tx);
        }
        drop(inner);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<K> {
        self.check()?;
        let inner = self.lock();
        if !inner.direct_reads {
            return Err(Error::Unsupported(format!("direct get of {}", plural_of::<K>())));
        }
        let key = format!("{}/{name}", namespace.unwrap_or_default());
        inner.objects.get(&key).cloned().ok_or_else(|| Error::NotFound {
            resource: plural_of::<K>(),
            name: name.to_string(),
        })
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        self.check()?;
        if self.remove(name, namespace) {
            Ok(())
        } else {
            Err(Error::NotFound {
                resource: plural_of::<K>(),
                name: name.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;

    fn ns(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_watch_replays_changes_after_list() {
        let source = MemorySource::with_objects([ns("a")]);
        let page = source.list().await.unwrap();
        assert_eq!(page.items.len(), 1);

        source.apply(ns("b"));
        let mut stream = source.watch(&page.resource_version).await.unwrap();
        match stream.next().await {
            Some(Ok(SourceEvent::Applied(obj))) => assert_eq!(obj.name_any(), "b"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(source.active_watches(), 1);
        drop(stream);
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_uid_is_stable_across_updates() {
        let source = MemorySource::new();
        let first = source.apply(ns("a"));
        let second = source.apply(ns("a"));
        assert_eq!(first.uid(), second.uid());
        assert_ne!(first.resource_version(), second.resource_version());
    }

    #[tokio::test]
    async fn test_compaction_expires_old_versions() {
        let source = MemorySource::with_objects([ns("a")]);
        source.expire_watches();
        let mut stream = source.watch("0").await.unwrap();
        assert!(matches!(stream.next().await, Some(Ok(SourceEvent::Expired))));
    }

    #[tokio::test]
    async fn test_failure_reaches_open_watches() {
        let source: MemorySource<Namespace> = MemorySource::new();
        let mut stream = source.watch("0").await.unwrap();
        source.fail(SourceFailure::Forbidden);

        match stream.next().await {
            Some(Err(e)) => assert!(e.is_permission()),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(source.list().await.is_err());
        source.recover();
        assert!(source.list().await.is_ok());
    }
}
