//! Tests for the store lifecycle on a dataset file.
//!
//! This test suite validates:
//! - Data and schema version persist across reopen
//! - A second writer cannot open a dataset held by the owner
//! - A dataset from a newer build is refused at initialize
//! - purge_db starts from an empty dataset
//! - Registered exporters see every committed event

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use taskroot_db::{
    create_pool_with_config, DatabaseConfig, Error, EventStore, MetricsExporter, PoolConfig,
    SqliteStore, TaskEvent, TaskState, TaskStats, WorkerEvent, WorkerEventKind,
    CURRENT_SCHEMA_VERSION,
};

#[tokio::test]
async fn test_reopen_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("taskroot.db");

    {
        let store = SqliteStore::open_path(&path).await.unwrap();
        store.initialize().await.unwrap();
        store
            .store_task_event(TaskEvent::new("t1", TaskState::Started, Utc::now()))
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = SqliteStore::open_path(&path).await.unwrap();
    store.initialize().await.unwrap();
    assert_eq!(
        store.get_schema_version().await.unwrap(),
        CURRENT_SCHEMA_VERSION
    );
    assert!(store.get_task("t1").await.unwrap().is_some());
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_second_writer_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskroot.db");

    let owner = SqliteStore::open_path(&path).await.unwrap();
    owner.initialize().await.unwrap();

    let pool = create_pool_with_config(
        Some(&path),
        PoolConfig::new().busy_timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    let intruder = SqliteStore::new(pool);
    let err = intruder.initialize().await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)), "got {:?}", err);

    owner.close().await.unwrap();
}

#[tokio::test]
async fn test_newer_dataset_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskroot.db");

    {
        let store = SqliteStore::open_path(&path).await.unwrap();
        store.initialize().await.unwrap();
        sqlx::query("UPDATE schema_meta SET value = '7' WHERE key = 'version'")
            .execute(store.pool())
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = SqliteStore::open_path(&path).await.unwrap();
    let err = store.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        Error::SchemaVersion {
            found: 7,
            expected: CURRENT_SCHEMA_VERSION
        }
    ));
}

#[tokio::test]
async fn test_purge_db_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::default().with_db_path(dir.path().join("taskroot.db"));

    {
        let store = SqliteStore::open(&config).await.unwrap();
        store.initialize().await.unwrap();
        store
            .store_task_event(TaskEvent::new("t1", TaskState::Started, Utc::now()))
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let purging = DatabaseConfig {
        purge_db: true,
        ..config
    };
    let store = SqliteStore::open(&purging).await.unwrap();
    store.initialize().await.unwrap();
    assert!(store.get_task("t1").await.unwrap().is_none());
}

#[derive(Default)]
struct CountingExporter {
    tasks: AtomicUsize,
    workers: AtomicUsize,
}

#[async_trait]
impl MetricsExporter for CountingExporter {
    fn name(&self) -> &str {
        "counting"
    }

    fn on_task_event(&self, _event: &TaskEvent) {
        self.tasks.fetch_add(1, Ordering::SeqCst);
    }

    fn on_worker_event(&self, _event: &WorkerEvent) {
        self.workers.fetch_add(1, Ordering::SeqCst);
    }

    fn update_stats(&self, _stats: &TaskStats) {}

    async fn serve(&self) -> taskroot_db::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> taskroot_db::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_exporter_sees_committed_events() {
    let exporter = Arc::new(CountingExporter::default());
    let store = SqliteStore::open_in_memory()
        .await
        .unwrap()
        .with_exporter(exporter.clone());
    store.initialize().await.unwrap();

    store
        .store_task_event(TaskEvent::new("t1", TaskState::Started, Utc::now()))
        .await
        .unwrap();
    store
        .store_worker_event(WorkerEvent::new("w1", WorkerEventKind::Online, Utc::now()))
        .await
        .unwrap();
    // rejected events are not reported
    let _ = store
        .store_task_event(TaskEvent::new("", TaskState::Started, Utc::now()))
        .await;

    assert_eq!(exporter.tasks.load(Ordering::SeqCst), 1);
    assert_eq!(exporter.workers.load(Ordering::SeqCst), 1);
}
