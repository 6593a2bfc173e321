#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Event, Namespace, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::serde_json::{self, Value};
use kube::api::ObjectMeta;
use kubecast::error::{Error, Result};
use kubecast::k8s::cache::{CacheConfig, SummaryView};
use kubecast::k8s::context::StreamContext;
use kubecast::k8s::controller::ResourceController;
use kubecast::k8s::registry::{ConnectionKey, Connector};
use kubecast::k8s::source::{MemorySource, Object, ResourceSource, SourceBinder, WatchScope};
use kubecast::k8s::stream::Subscriber;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(3);

/// Hands out the connection key itself as the "client"
#[derive(Default)]
pub struct TestConnector {
    connects: AtomicUsize,
    refused: Mutex<HashSet<String>>,
}

impl TestConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, profile_id: &str) {
        self.refused.lock().unwrap().insert(profile_id.to_string());
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Client = ConnectionKey;

    async fn connect(&self, key: &ConnectionKey) -> Result<ConnectionKey> {
        if self.refused.lock().unwrap().contains(&key.profile_id) {
            return Err(Error::Connection {
                target: key.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(key.clone())
    }
}

pub fn config() -> CacheConfig {
    CacheConfig::default()
        .with_default_flush_period(Duration::from_millis(20))
        .with_flush_period("Pod", Duration::from_millis(20))
        .with_flush_period("Event", Duration::from_millis(20))
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .with_sync_timeout(Duration::from_secs(2))
}

pub fn context_with(config: CacheConfig) -> (Arc<TestConnector>, Arc<StreamContext<ConnectionKey>>) {
    let connector = Arc::new(TestConnector::default());
    let ctx = StreamContext::new(
        Arc::clone(&connector) as Arc<dyn Connector<Client = ConnectionKey>>,
        config,
    );
    (connector, ctx)
}

pub fn context() -> (Arc<TestConnector>, Arc<StreamContext<ConnectionKey>>) {
    context_with(config())
}

pub fn key() -> ConnectionKey {
    ConnectionKey::new("dev", "kind")
}

/// Every connection and scope reads the same in-memory source
pub fn binder<K: Object>(source: &Arc<MemorySource<K>>) -> Arc<dyn SourceBinder<ConnectionKey, K>> {
    let source = Arc::clone(source);
    Arc::new(move |_: &ConnectionKey, _: &WatchScope| {
        Arc::clone(&source) as Arc<dyn ResourceSource<K>>
    })
}

pub fn controller<K: Object>(
    ctx: &Arc<StreamContext<ConnectionKey>>,
    source: &Arc<MemorySource<K>>,
) -> ResourceController<ConnectionKey, K> {
    ResourceController::new(Arc::clone(ctx), binder(source), Arc::new(SummaryView))
}

fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: meta(None, name),
        ..Default::default()
    }
}

pub fn pod(ns: &str, name: &str) -> Pod {
    Pod {
        metadata: meta(Some(ns), name),
        ..Default::default()
    }
}

pub fn owned_pod(ns: &str, name: &str, owner: &ReplicaSet) -> Pod {
    let mut pod = pod(ns, name);
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "ReplicaSet".to_string(),
        name: owner.metadata.name.clone().unwrap_or_default(),
        uid: owner.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        ..Default::default()
    }]);
    pod
}

pub fn replicaset(ns: &str, name: &str) -> ReplicaSet {
    ReplicaSet {
        metadata: meta(Some(ns), name),
        ..Default::default()
    }
}

pub fn event(ns: &str, name: &str, kind: &str, involved: &str) -> Event {
    Event {
        metadata: meta(Some(ns), name),
        involved_object: ObjectReference {
            kind: Some(kind.to_string()),
            name: Some(involved.to_string()),
            namespace: Some(ns.to_string()),
            ..Default::default()
        },
        reason: Some("Scheduled".to_string()),
        ..Default::default()
    }
}

/// `name` column of every row in a snapshot payload
pub fn names(payload: &[u8]) -> Vec<String> {
    let rows: Vec<Value> = serde_json::from_slice(payload).unwrap();
    rows.iter()
        .map(|row| row["name"].as_str().unwrap().to_string())
        .collect()
}

pub async fn next_payload(subscriber: &mut Subscriber) -> Bytes {
    timeout(WAIT, subscriber.next_frame())
        .await
        .expect("timed out waiting for a frame")
        .expect("subscriber failed")
        .expect("stream closed")
        .payload
}

/// Read frames until one lists exactly `expected`
pub async fn payload_with(subscriber: &mut Subscriber, expected: &[&str]) -> Bytes {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let payload = timeout(remaining, next_payload(subscriber))
            .await
            .unwrap_or_else(|_| panic!("never saw {expected:?}"));
        if names(&payload) == expected {
            return payload;
        }
    }
}
