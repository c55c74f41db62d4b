use std::sync::Arc;
use std::time::Duration;

use ksync_api::{Manager, ManagerError};
use ksync_core::{InformerKey, WatchOptions};
use ksync_informer::{InformerPool, PoolConfig};
use ksync_kubehub::mock::{MockConfigLoader, MockWatchProvider};
use ksync_kubehub::WatchEvent;
use serde_json::json;
use tokio::time::sleep;

fn manager() -> (MockWatchProvider, Manager) {
    let mock = MockWatchProvider::new();
    let pool = Arc::new(InformerPool::new(Arc::new(mock.clone()), PoolConfig::default()));
    let loader = MockConfigLoader::new(&["dev", "prod", "broken"], Some("dev")).unreachable("broken");
    (mock, Manager::new(Arc::new(loader), pool))
}

#[tokio::test]
async fn initialize_and_switch() {
    let (_mock, m) = manager();
    let contexts = m.initialize().unwrap();
    assert_eq!(contexts.len(), 3);
    assert_eq!(m.get_current_context().as_deref(), Some("dev"));
    assert!(m.get_contexts().iter().any(|c| c.name == "dev" && c.is_current));

    m.switch_context("prod").unwrap();
    assert_eq!(m.get_current_context().as_deref(), Some("prod"));
    let current: Vec<String> = m.get_contexts().into_iter().filter(|c| c.is_current).map(|c| c.name).collect();
    assert_eq!(current, vec!["prod"]);

    assert_eq!(m.switch_context("nope"), Err(ManagerError::UnknownContext("nope".into())));
    assert_eq!(m.get_current_context().as_deref(), Some("prod"));

    let reloaded = m.reload().unwrap();
    assert!(reloaded.iter().any(|c| c.name == "prod" && c.is_current));
    assert_eq!(m.get_context_detail("dev").unwrap().cluster, "dev-cluster");
}

#[tokio::test]
async fn validate_delegates_to_loader() {
    let (_mock, m) = manager();
    assert!(m.validate_context("dev").await);
    assert!(!m.validate_context("broken").await);
    assert!(!m.validate_context("missing").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_watching_reports_per_type() {
    let (mock, m) = manager();
    mock.reject_context("prod");

    let report = m.start_watching("dev", &["Pod", "Node"], None).await;
    assert_eq!(report.started, vec!["Pod", "Node"]);
    assert!(report.is_complete());

    let report = m.start_watching("prod", &["Pod"], Some(WatchOptions::for_context("ignored"))).await;
    assert!(report.started.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "Pod");

    let stats = m.get_informer_statistics();
    assert_eq!(stats.total_informers, 2);
    assert!(m.get_informer_states().contains_key(&InformerKey::new("dev", "Node")));

    let pod = json!({ "kind": "Pod", "metadata": { "uid": "u1", "name": "a" } });
    mock.send(&InformerKey::new("dev", "Pod"), WatchEvent::Added(pod));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(m.get_resources("dev", "Pod").len(), 1);

    assert_eq!(m.stop_watching("dev"), 2);
    assert_eq!(m.get_informer_statistics().total_informers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_forgets_everything() {
    let (_mock, m) = manager();
    m.initialize().unwrap();
    let _ = m.start_watching("dev", &["Pod".to_string()], None).await;
    m.cleanup();
    assert!(m.get_contexts().is_empty());
    assert!(m.get_current_context().is_none());
    assert_eq!(m.get_informer_statistics().total_informers, 0);
}
