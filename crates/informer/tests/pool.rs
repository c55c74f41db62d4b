use std::sync::Arc;
use std::time::Duration;

use ksync_core::{ConnectionPhase, EventType, InformerKey, PoolEvent, WatchOptions};
use ksync_informer::{InformerPool, PoolConfig};
use ksync_kubehub::mock::MockWatchProvider;
use ksync_kubehub::WatchEvent;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

fn fast() -> PoolConfig {
    PoolConfig { backoff_base: Duration::from_millis(20), backoff_max: Duration::from_millis(40) }
}

fn pod(uid: &str, name: &str, phase: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "uid": uid, "name": name, "namespace": "default" },
        "status": { "phase": phase }
    })
}

fn setup() -> (MockWatchProvider, InformerPool, InformerKey) {
    let mock = MockWatchProvider::new();
    let pool = InformerPool::new(Arc::new(mock.clone()), fast());
    (mock, pool, InformerKey::new("dev", "Pod"))
}

async fn next_event(rx: &mut UnboundedReceiver<PoolEvent>) -> PoolEvent {
    timeout(Duration::from_secs(2), rx.recv()).await.expect("event in time").expect("channel open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_is_idempotent() {
    let (mock, pool, key) = setup();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(mock.sessions(), 1);
    assert_eq!(mock.starts(&key), 1);
    let stats = pool.get_statistics();
    assert_eq!(stats.total_informers, 1);
    assert_eq!(stats.running_informers, 1);

    let st = pool.get_informer_state("dev", "Pod").unwrap();
    assert!(st.running);
    assert!(st.connected);
    assert_eq!(st.connection, ConnectionPhase::Connected);
    assert_eq!(st.resource_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_update_cache_and_fan_out() {
    let (mock, pool, key) = setup();
    let (_id, mut rx) = pool.subscribe();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();

    mock.send(&key, WatchEvent::Added(pod("u2", "b", "Pending")));
    mock.send(&key, WatchEvent::Added(pod("u1", "a", "Pending")));
    mock.send(&key, WatchEvent::Updated(pod("u2", "b", "Running")));
    mock.send(&key, WatchEvent::Deleted(pod("u1", "a", "Pending")));

    let mut seen = Vec::new();
    for _ in 0..4 {
        match next_event(&mut rx).await {
            PoolEvent::Resource(ev) => {
                assert_eq!(ev.context_name, "dev");
                seen.push((ev.event_type, ev.resource.uid().unwrap().to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(
        seen,
        vec![
            (EventType::Added, "u2".to_string()),
            (EventType::Added, "u1".to_string()),
            (EventType::Modified, "u2".to_string()),
            (EventType::Deleted, "u1".to_string()),
        ]
    );

    let res = pool.get_resources("dev", "Pod");
    assert_eq!(res.len(), 1);
    assert_eq!(res[0].raw["status"]["phase"], "Running");
    assert!(pool.get_resource("dev", "Pod", "u2").is_some());
    assert!(pool.get_resource("dev", "Pod", "u1").is_none());
    let st = pool.get_informer_state("dev", "Pod").unwrap();
    assert_eq!(st.resource_count, 1);
    assert!(st.last_sync_time.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn objects_without_uid_are_ignored() {
    let (mock, pool, key) = setup();
    let (_id, mut rx) = pool.subscribe();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();

    mock.send(&key, WatchEvent::Added(json!({ "kind": "Pod", "metadata": { "name": "nouid" } })));
    mock.send(&key, WatchEvent::Added(json!({ "kind": "Pod" })));
    mock.send(&key, WatchEvent::Deleted(json!(42)));
    mock.send(&key, WatchEvent::Added(pod("u1", "a", "Running")));

    match next_event(&mut rx).await {
        PoolEvent::Resource(ev) => assert_eq!(ev.resource.uid(), Some("u1")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(pool.get_resources("dev", "Pod").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reading_unknown_keys_is_empty() {
    let (_mock, pool, _key) = setup();
    assert!(pool.get_resources("nope", "Pod").is_empty());
    assert!(pool.get_resource("nope", "Pod", "u1").is_none());
    assert!(pool.get_informer_state("nope", "Pod").is_none());
    assert!(!pool.stop_informer("nope", "Pod"));
    assert_eq!(pool.get_statistics().total_informers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn errors_are_recorded_and_reconnect_follows_disconnect() {
    let (mock, pool, key) = setup();
    let (_id, mut rx) = pool.subscribe();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    sleep(Duration::from_millis(30)).await;

    mock.send(&key, WatchEvent::Error("watch expired".into()));
    match next_event(&mut rx).await {
        PoolEvent::Error(e) => {
            assert_eq!(e.context_name, "dev");
            assert_eq!(e.resource_type, "Pod");
            assert_eq!(e.message, "watch expired");
        }
        other => panic!("unexpected {:?}", other),
    }
    let st = pool.get_informer_state("dev", "Pod").unwrap();
    assert_eq!(st.error_count, 1);
    assert_eq!(st.last_error.as_deref(), Some("watch expired"));
    assert!(st.running);

    mock.disconnect(&key);
    sleep(Duration::from_millis(200)).await;
    assert!(mock.starts(&key) >= 2);
    assert!(mock.is_connected(&key));
    let st = pool.get_informer_state("dev", "Pod").unwrap();
    assert!(st.running);
    assert!(st.connected);
    assert!(st.reconnect_attempts >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_starts_keep_retrying_while_running() {
    let (mock, pool, key) = setup();
    mock.fail_next_starts(&key, 3);
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    sleep(Duration::from_millis(400)).await;

    assert_eq!(mock.starts(&key), 4);
    let st = pool.get_informer_state("dev", "Pod").unwrap();
    assert_eq!(st.error_count, 3);
    assert!(st.connected);
    assert_eq!(pool.get_statistics().total_errors, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_never_revives() {
    let (mock, pool, key) = setup();
    let other = InformerKey::new("dev", "Node");
    mock.fail_next_starts(&key, 100);
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    pool.start_informer("Node", WatchOptions::for_context("dev")).await.unwrap();
    sleep(Duration::from_millis(30)).await;
    mock.disconnect(&other);

    assert_eq!(pool.stop_all(), 2);
    let starts_at_stop = mock.starts(&key);
    sleep(Duration::from_millis(200)).await;

    assert_eq!(pool.get_statistics().total_informers, 0);
    assert!(pool.get_informer_state("dev", "Pod").is_none());
    assert!(pool.get_informer_state("dev", "Node").is_none());
    assert_eq!(mock.starts(&key), starts_at_stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_context_only_touches_that_context() {
    let (_mock, pool, _key) = setup();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    pool.start_informer("Node", WatchOptions::for_context("dev")).await.unwrap();
    pool.start_informer("Pod", WatchOptions::for_context("prod")).await.unwrap();

    assert_eq!(pool.stop_context_informers("dev"), 2);
    let states = pool.get_all_states();
    assert_eq!(states.len(), 1);
    assert!(states.contains_key(&InformerKey::new("prod", "Pod")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_informer_emits_nothing() {
    let (mock, pool, key) = setup();
    let (_id, mut rx) = pool.subscribe();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    sleep(Duration::from_millis(30)).await;
    assert!(pool.stop_informer("dev", "Pod"));

    mock.send(&key, WatchEvent::Added(pod("u1", "a", "Running")));
    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert!(pool.get_resources("dev", "Pod").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nothing_is_published_after_stop_returns() {
    let (mock, pool, key) = setup();
    let (_id, mut rx) = pool.subscribe();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    sleep(Duration::from_millis(30)).await;

    let feeder = {
        let mock = mock.clone();
        let key = key.clone();
        tokio::spawn(async move {
            for i in 0..5_000 {
                mock.send(&key, WatchEvent::Updated(pod("u1", "a", &format!("p{}", i))));
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };
    sleep(Duration::from_millis(5)).await;
    assert!(pool.stop_informer("dev", "Pod"));

    // Whatever was queued before stop returned is drained; after that the channel stays quiet.
    while rx.try_recv().is_ok() {}
    feeder.await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relist_reports_vanished_objects() {
    let (mock, pool, key) = setup();
    let (_id, mut rx) = pool.subscribe();
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();

    mock.send(&key, WatchEvent::Added(pod("u1", "a", "Running")));
    mock.send(&key, WatchEvent::Added(pod("u2", "b", "Running")));
    for _ in 0..2 {
        next_event(&mut rx).await;
    }

    mock.send(&key, WatchEvent::Relisted(vec![pod("u2", "b", "Running"), pod("u3", "c", "Pending")]));
    let mut seen = Vec::new();
    for _ in 0..3 {
        if let PoolEvent::Resource(ev) = next_event(&mut rx).await {
            seen.push((ev.event_type, ev.resource.uid().unwrap().to_string()));
        }
    }
    assert_eq!(
        seen,
        vec![
            (EventType::Modified, "u2".to_string()),
            (EventType::Added, "u3".to_string()),
            (EventType::Deleted, "u1".to_string()),
        ]
    );
    let names: Vec<String> = pool.get_resources("dev", "Pod").iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_context_fails_start() {
    let (mock, pool, _key) = setup();
    mock.reject_context("ghost");
    let err = pool.start_informer("Pod", WatchOptions::for_context("ghost")).await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
    assert_eq!(pool.get_statistics().total_informers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribed_receiver_gets_nothing() {
    let (mock, pool, key) = setup();
    let (id, mut rx) = pool.subscribe();
    assert_eq!(pool.subscriber_count(), 1);
    assert!(pool.unsubscribe(id));
    assert!(!pool.unsubscribe(id));
    pool.start_informer("Pod", WatchOptions::for_context("dev")).await.unwrap();
    mock.send(&key, WatchEvent::Added(pod("u1", "a", "Running")));
    sleep(Duration::from_millis(50)).await;
    assert!(rx.recv().await.is_none());
}
