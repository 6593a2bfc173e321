/// Readiness, failure and invalidation of watch caches behind controllers
mod common;

use common::{context, context_with, controller, event, names, next_payload, payload_with, pod};
use k8s_openapi::api::core::v1::Event;
use kubecast::error::Error;
use kubecast::k8s::cache::CacheState;
use kubecast::k8s::registry::ConnectionKey;
use kubecast::k8s::source::{MemorySource, SourceFailure};
use kubecast::k8s::stream::StreamQuery;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn test_list_is_bounded_by_sync_timeout() {
    let config = common::config().with_sync_timeout(Duration::from_millis(100));
    let (_, ctx) = context_with(config);
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    source.set_list_delay(Some(Duration::from_secs(10)));
    let pods = controller(&ctx, &source);

    let started = Instant::now();
    let err = pods.list(&common::key(), None).await.unwrap_err();
    assert!(err.is_sync_timeout(), "unexpected error {err}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        pods.state(&common::key()).await.unwrap(),
        CacheState::WaitingForSync
    );
}

#[tokio::test]
async fn test_forbidden_kind_reports_permission_error() {
    let (_, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    source.fail(SourceFailure::Forbidden);
    let pods = controller(&ctx, &source);

    let err = pods.list(&common::key(), None).await.unwrap_err();
    assert!(err.is_permission(), "unexpected error {err}");

    // broken entries fail new subscriptions immediately
    let err = pods
        .subscribe(&StreamQuery::new(common::key()))
        .await
        .unwrap_err();
    assert!(err.is_permission(), "unexpected error {err}");
}

#[tokio::test]
async fn test_broken_entry_recovers_without_resubscribing() {
    let (_, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &source);

    let mut subscriber = pods.subscribe(&StreamQuery::new(common::key())).await.unwrap();
    payload_with(&mut subscriber, &["web"]).await;

    source.fail(SourceFailure::Unreachable);
    let cache = pods.cache(&common::key()).await.unwrap();
    let mut states = cache.watch_state();
    states.wait_for(CacheState::is_broken).await.unwrap();

    source.recover();
    source.apply(pod("default", "api"));
    payload_with(&mut subscriber, &["api", "web"]).await;
    assert!(cache.state().is_ready());
}

#[tokio::test]
async fn test_unreachable_cluster_is_a_connection_error() {
    let (connector, ctx) = context();
    connector.refuse("offline");
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &source);

    let offline = ConnectionKey::new("offline", "kind");
    let err = pods.list(&offline, None).await.unwrap_err();
    assert!(err.is_connection(), "unexpected error {err}");
    assert!(!ctx.registry().has_client(&offline).await);
    assert_eq!(source.list_calls(), 0);
}

#[tokio::test]
async fn test_invalidation_ends_streams_and_rebuilds_on_demand() {
    let (connector, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &source);

    let dev = common::key();
    let prod = ConnectionKey::new("prod", "kind");
    let mut dev_stream = pods.subscribe(&StreamQuery::new(dev.clone())).await.unwrap();
    let mut prod_stream = pods.subscribe(&StreamQuery::new(prod.clone())).await.unwrap();
    next_payload(&mut dev_stream).await;
    next_payload(&mut prod_stream).await;
    let old_cache = pods.cache(&dev).await.unwrap();

    assert_eq!(ctx.invalidate("dev").await, 1);

    let end = timeout(Duration::from_secs(1), dev_stream.next_frame())
        .await
        .unwrap()
        .unwrap();
    assert!(end.is_none(), "expected end of stream");
    assert!(old_cache.is_stopped());
    assert!(matches!(
        old_cache.wait_for_sync(Duration::from_secs(1)).await,
        Err(Error::Invalidated(_))
    ));

    // other profiles keep streaming
    assert_eq!(pods.state(&prod).await.unwrap(), CacheState::Ready);
    source.apply(pod("default", "api"));
    payload_with(&mut prod_stream, &["api", "web"]).await;

    // the next request for the invalidated profile builds everything afresh
    let payload = pods.list(&dev, None).await.unwrap();
    assert_eq!(names(&payload), vec!["api", "web"]);
    assert_eq!(connector.connects(), 3);
    assert!(!Arc::ptr_eq(&old_cache, &pods.cache(&dev).await.unwrap()));
}

#[tokio::test]
async fn test_dropping_subscribers_releases_topics() {
    let (_, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &source);

    let query = StreamQuery::new(common::key()).namespace("default");
    let first = pods.subscribe(&query).await.unwrap();
    let second = pods.subscribe(&query).await.unwrap();
    let topic = first.topic().clone();
    assert_eq!(ctx.broker().subscriber_count(&topic), 2);

    drop(first);
    assert_eq!(ctx.broker().subscriber_count(&topic), 1);
    drop(second);
    assert!(!ctx.broker().has_subscribers(&topic));
    assert_eq!(ctx.broker().topic_count(), 0);
}

#[tokio::test]
async fn test_expiry_with_failing_relists_breaks_then_recovers() {
    let (_, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &source);
    let mut subscriber = pods.subscribe(&StreamQuery::new(common::key())).await.unwrap();
    payload_with(&mut subscriber, &["web"]).await;

    let cache = pods.cache(&common::key()).await.unwrap();
    let mut states = cache.watch_state();
    source.expire_watches();
    source.fail(SourceFailure::Unreachable);

    states.wait_for(CacheState::is_broken).await.unwrap();
    let err = pods.list(&common::key(), None).await.unwrap_err();
    assert!(err.is_connection(), "unexpected error {err}");

    source.recover();
    source.apply(pod("default", "api"));
    payload_with(&mut subscriber, &["api", "web"]).await;
    assert!(cache.state().is_ready());
}

#[tokio::test]
async fn test_released_streams_drop_their_flush_targets() {
    let (_, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &source);

    for i in 0..200 {
        let query = StreamQuery::new(common::key())
            .namespace("default")
            .name(format!("web-{i}"));
        drop(pods.subscribe(&query).await.unwrap());
    }

    let cache = pods.cache(&common::key()).await.unwrap();
    for _ in 0..100 {
        if cache.coalescer().target_count() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ctx.broker().topic_count(), 0);
    assert_eq!(cache.coalescer().target_count(), 0);

    // the cache itself keeps serving
    let mut subscriber = pods.subscribe(&StreamQuery::new(common::key())).await.unwrap();
    payload_with(&mut subscriber, &["web"]).await;
    assert_eq!(source.watch_calls(), 1);
}

#[tokio::test]
async fn test_events_watch_closes_with_its_last_subscriber() {
    let (_, ctx) = context();
    let event_source = Arc::new(MemorySource::with_objects([event("default", "web.1", "Pod", "web")]));
    let events = Arc::new(controller::<Event>(&ctx, &event_source));
    let pod_source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &pod_source).with_events(events);

    let mut subscriber = pods.events(&common::key(), "web", Some("default")).await.unwrap();
    payload_with(&mut subscriber, &["web.1"]).await;
    assert_eq!(event_source.active_watches(), 1);

    drop(subscriber);
    for _ in 0..100 {
        if event_source.active_watches() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(event_source.active_watches(), 0);

    // reopening builds a fresh narrow watch
    let mut again = pods.events(&common::key(), "web", Some("default")).await.unwrap();
    payload_with(&mut again, &["web.1"]).await;
    assert_eq!(event_source.watch_calls(), 2);
}

