//! Action execution ordering and the persisted audit trail

mod common;

use common::RecordingRunner;
use remedy_common::{
    config::{ExecutorConfig, StorageBackend, StorageConfig},
    ActionKind, ActionOutcome, ActionQuery, Parameters, Target,
};
use remedyd::executor::{ActionExecutor, ActionRequest};
use remedyd::store::{self, HistoryStore, MemoryStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn executor(runner: Arc<RecordingRunner>, store: Arc<dyn HistoryStore>) -> Arc<ActionExecutor> {
    executor_with_limit(runner, store, 4)
}

fn executor_with_limit(
    runner: Arc<RecordingRunner>,
    store: Arc<dyn HistoryStore>,
    max_concurrency: usize,
) -> Arc<ActionExecutor> {
    let config = ExecutorConfig {
        max_concurrency,
        ..ExecutorConfig::default()
    };
    Arc::new(ActionExecutor::new(runner, store, &config))
}

// ============================================================================
// Serialization
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_same_target_never_overlaps() {
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(200)));
    let store = Arc::new(MemoryStore::default());
    let executor = executor(runner.clone(), store.clone());
    let c1 = Target::container("c1");
    let c2 = Target::container("c2");

    let mut handles = Vec::new();
    for i in 0..5 {
        let executor = Arc::clone(&executor);
        let kind = if i % 2 == 0 {
            ActionKind::Restart
        } else {
            ActionKind::UpdateMemoryLimit { memory_mb: 512 }
        };
        let request = ActionRequest::new(kind, c1.clone());
        handles.push(tokio::spawn(async move { executor.execute(request, None).await }));
    }
    let other = {
        let executor = Arc::clone(&executor);
        let request = ActionRequest::new(ActionKind::Restart, c2.clone());
        tokio::spawn(async move { executor.execute(request, None).await })
    };

    for handle in handles {
        assert_eq!(handle.await.unwrap().result, ActionOutcome::Success);
    }
    other.await.unwrap();

    assert_eq!(runner.overlaps(), 0);
    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 6);

    // Runs on c1 are strictly back to back
    let mut on_c1: Vec<_> = invocations.iter().filter(|i| i.target == c1).collect();
    on_c1.sort_by_key(|i| i.started);
    for pair in on_c1.windows(2) {
        assert!(pair[0].finished.unwrap() <= pair[1].started);
    }

    // c2 did not wait for the c1 queue
    let c2_start = invocations.iter().find(|i| i.target == c2).unwrap().started;
    assert!(c2_start < on_c1.last().unwrap().started);

    assert_eq!(store.recent_actions(&ActionQuery::default()).unwrap().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_bounds_runs_across_targets() {
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(200)));
    let store = Arc::new(MemoryStore::default());
    let executor = executor_with_limit(runner.clone(), store.clone(), 2);

    let start = tokio::time::Instant::now();
    let mut handles = Vec::new();
    for i in 0..4 {
        let executor = Arc::clone(&executor);
        let request = ActionRequest::new(ActionKind::Restart, Target::container(format!("c{}", i)));
        handles.push(tokio::spawn(async move { executor.execute(request, None).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().result, ActionOutcome::Success);
    }

    // Distinct targets share the two permits: two at a time, never more
    assert_eq!(runner.peak(), 2);
    assert_eq!(runner.overlaps(), 0);
    assert_eq!(runner.invocations().len(), 4);
    assert!(start.elapsed() >= Duration::from_millis(400));
    assert!(start.elapsed() < Duration::from_millis(800));
    assert_eq!(store.recent_actions(&ActionQuery::default()).unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_custom_action_is_not_retried() {
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(10)));
    runner.set_failing(true);
    let executor = executor(runner.clone(), Arc::new(MemoryStore::default()));

    let mut params = Parameters::new();
    params.insert("command".to_string(), "docker system prune -f".to_string());
    let request = ActionRequest::parse("custom", &params, Target::host("arog")).unwrap();
    let record = executor.execute(request, None).await;

    assert_eq!(record.result, ActionOutcome::Failure);
    assert_eq!(record.attempts, 1);
    assert_eq!(runner.invocations().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_runner_times_out_with_one_record() {
    let runner = Arc::new(RecordingRunner::new(Duration::from_secs(120)));
    let store = Arc::new(MemoryStore::default());
    let executor = executor(runner, store.clone());

    let request = ActionRequest::new(ActionKind::Restart, Target::service("nginx.service"))
        .with_timeout(Duration::from_secs(5));
    let record = executor.execute(request, None).await;

    assert_eq!(record.result, ActionOutcome::Timeout);
    let history = store.recent_actions(&ActionQuery::default()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, record.id);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_action_record_round_trips_through_sqlite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.db");
    let runner = Arc::new(RecordingRunner::new(Duration::from_millis(1)));

    let record = {
        let store: Arc<dyn HistoryStore> = Arc::new(SqliteStore::open_at(&path).unwrap());
        let executor = executor(runner, store);
        let request = ActionRequest::new(
            ActionKind::UpdateMemoryLimit { memory_mb: 2048 },
            Target::container("c2"),
        );
        executor.execute(request, None).await
    };

    // Fresh connection through the configured backend
    let config = StorageConfig {
        backend: StorageBackend::Sqlite,
        path: path.to_string_lossy().to_string(),
        ..StorageConfig::default()
    };
    let reopened = store::open(&config).unwrap();
    let read_back = reopened.action(record.id).unwrap().unwrap();

    assert_eq!(read_back.action_type, "update_memory_limit");
    assert_eq!(read_back.target(), Target::container("c2"));
    assert_eq!(read_back.parameters.get("memory_mb").unwrap(), "2048");
    assert_eq!(read_back.result, ActionOutcome::Success);
    assert_eq!(read_back, record);
}
