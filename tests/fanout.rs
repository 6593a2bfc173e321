/// One upstream watch per kind shared by any number of subscribers
mod common;

use common::{context, context_with, controller, key, names, next_payload, payload_with, pod};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kubecast::error::Error;
use kubecast::k8s::source::MemorySource;
use kubecast::k8s::stream::StreamQuery;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_list_without_subscribers_opens_one_watch() {
    let (_, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &source);

    let payload = pods.list(&key(), None).await.unwrap();
    assert_eq!(names(&payload), vec!["web"]);
    pods.list(&key(), Some("default")).await.unwrap();
    assert_eq!(source.list_calls(), 1);
    assert_eq!(source.watch_calls(), 1);
    assert_eq!(ctx.broker().topic_count(), 0);
}

#[tokio::test]
async fn test_single_subscriber_opens_one_watch() {
    let (_, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "web")]));
    let pods = controller(&ctx, &source);

    let mut subscriber = pods.subscribe(&StreamQuery::new(key())).await.unwrap();
    payload_with(&mut subscriber, &["web"]).await;
    assert_eq!(source.list_calls(), 1);
    assert_eq!(source.watch_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_cold_subscribers_share_one_list_and_watch() {
    let (connector, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([
        pod("default", "api"),
        pod("default", "web"),
    ]));
    source.set_list_delay(Some(Duration::from_millis(100)));
    let pods = Arc::new(controller(&ctx, &source));

    let subscribers = join_all((0..50).map(|_| {
        let pods = Arc::clone(&pods);
        tokio::spawn(async move {
            let mut subscriber = pods.subscribe(&StreamQuery::new(key())).await.unwrap();
            next_payload(&mut subscriber).await
        })
    }))
    .await;

    for payload in subscribers {
        assert_eq!(names(&payload.unwrap()), vec!["api", "web"]);
    }
    assert_eq!(source.list_calls(), 1);
    assert_eq!(source.watch_calls(), 1);
    assert_eq!(connector.connects(), 1);
    assert_eq!(pods.caches().len().await, 1);
}

#[tokio::test]
async fn test_slow_subscriber_does_not_hold_back_others() {
    let config = common::config()
        .with_flush_period("Pod", Duration::ZERO)
        .with_subscriber_buffer(2)
        .with_max_lag_events(1);
    let (_, ctx) = context_with(config);
    let source = Arc::new(MemorySource::<Pod>::new());
    let pods = controller(&ctx, &source);
    pods.list(&key(), None).await.unwrap();

    let mut fast = pods.subscribe(&StreamQuery::new(key())).await.unwrap();
    let mut slow = pods.subscribe(&StreamQuery::new(key())).await.unwrap();
    next_payload(&mut fast).await;
    next_payload(&mut slow).await;

    let mut expected = Vec::new();
    for i in 0..20 {
        let name = format!("p{i:02}");
        source.apply(pod("default", &name));
        expected.push(name);
        // keep the fast reader caught up on every flush
        let seen = names(&next_payload(&mut fast).await);
        assert!(!seen.is_empty());
    }
    let expected: Vec<&str> = expected.iter().map(String::as_str).collect();
    payload_with(&mut fast, &expected).await;

    // the slow reader either resyncs with a stale frame or is dropped
    match timeout(Duration::from_secs(1), slow.next_frame()).await.unwrap() {
        Ok(Some(frame)) => assert!(frame.stale || slow.skipped() == 0),
        Err(Error::SlowConsumer { skipped, .. }) => assert!(skipped > 0),
        Ok(None) => panic!("slow subscriber saw end of stream"),
        Err(e) => panic!("unexpected error {e}"),
    }
}

#[tokio::test]
async fn test_final_snapshot_matches_upstream() {
    let (_, ctx) = context();
    let source = Arc::new(MemorySource::with_objects([pod("default", "keep")]));
    let pods = controller(&ctx, &source);
    let mut subscriber = pods
        .subscribe(&StreamQuery::new(key()).namespace("default"))
        .await
        .unwrap();

    for round in 0..5 {
        for i in 0..10 {
            source.apply(pod("default", &format!("churn-{i}")));
            source.apply(pod("other", &format!("elsewhere-{round}-{i}")));
        }
        for i in (0..10).step_by(2) {
            source.remove(&format!("churn-{i}"), Some("default"));
        }
    }

    payload_with(
        &mut subscriber,
        &["churn-1", "churn-3", "churn-5", "churn-7", "churn-9", "keep"],
    )
    .await;
}
