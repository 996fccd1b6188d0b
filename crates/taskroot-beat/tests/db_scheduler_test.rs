//! Integration tests for the database scheduler and controller.
//!
//! This test suite validates:
//! - A scheduler loads only enabled schedules of its own app
//! - Write-back after firing touches only the scheduler's own rows
//! - Sync is an upsert and only writes entries that changed
//! - A failed dispatch is neither recorded nor written back
//! - Refresh keeps unsynced run state and picks up added/removed rows
//! - The controller stamps its app and never touches other apps' rows
//! - The run loop stops on the shutdown signal after a final sync

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;

use taskroot_beat::{BeatController, DatabaseScheduler, TaskDispatcher};
use taskroot_core::{BeatConfig, Error, EventStore, Result, Schedule, ScheduleExpr};
use taskroot_db::SqliteStore;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
}

async fn store() -> Arc<dyn EventStore> {
    let store = SqliteStore::open_in_memory()
        .await
        .expect("Failed to open store");
    store.initialize().await.expect("Failed to initialize store");
    Arc::new(store)
}

fn interval(id: &str, app: &str, every: f64) -> Schedule {
    Schedule::new(id, format!("tasks.{}", id), ScheduleExpr::interval(every)).with_app(app)
}

async fn find(store: &Arc<dyn EventStore>, id: &str, app: &str) -> Schedule {
    store
        .get_schedules()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.schedule_id == id && s.app.as_deref() == Some(app))
        .unwrap_or_else(|| panic!("schedule {}/{} missing", app, id))
}

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, schedule: &Schedule) -> Result<()> {
        self.sent.lock().unwrap().push(schedule.schedule_id.clone());
        Ok(())
    }
}

struct FailingDispatcher;

#[async_trait]
impl TaskDispatcher for FailingDispatcher {
    async fn dispatch(&self, _schedule: &Schedule) -> Result<()> {
        Err(Error::ConnectionClosed("broker unavailable".into()))
    }
}

#[tokio::test]
async fn test_loads_only_enabled_rows_of_own_app() {
    let store = store().await;
    store.store_schedule(interval("a1", "A", 60.0)).await.unwrap();
    store.store_schedule(interval("b1", "B", 60.0)).await.unwrap();
    let mut disabled = interval("a2", "A", 60.0);
    disabled.enabled = false;
    store.store_schedule(disabled).await.unwrap();
    store
        .store_schedule(Schedule::new("orphan", "tasks.orphan", ScheduleExpr::interval(60.0)))
        .await
        .unwrap();

    let mut scheduler = DatabaseScheduler::new(store.clone(), BeatConfig::new("A"));
    assert_eq!(scheduler.setup_schedule().await.unwrap(), 1);
    let ids: Vec<&str> = scheduler.entries().map(|e| e.schedule_id()).collect();
    assert_eq!(ids, vec!["a1"]);
}

#[tokio::test]
async fn test_write_back_touches_only_own_schedule() {
    let store = store().await;
    let last_run = t0() - chrono::Duration::hours(1);
    for app in ["A", "B"] {
        let mut schedule = interval(&format!("{}-job", app.to_lowercase()), app, 60.0);
        schedule.last_run_at = Some(last_run);
        store.store_schedule(schedule).await.unwrap();
    }

    let mut scheduler = DatabaseScheduler::new(store.clone(), BeatConfig::new("A"));
    scheduler.setup_schedule().await.unwrap();

    let dispatcher = RecordingDispatcher::default();
    let fired = scheduler.fire_due(t0(), &dispatcher).await.unwrap();
    assert_eq!(fired, vec!["a-job".to_string()]);
    assert_eq!(dispatcher.sent(), vec!["a-job".to_string()]);

    assert_eq!(scheduler.sync().await.unwrap(), 1);

    let a = find(&store, "a-job", "A").await;
    assert_eq!(a.total_run_count, 1);
    assert_eq!(a.last_run_at, Some(t0()));

    let b = find(&store, "b-job", "B").await;
    assert_eq!(b.total_run_count, 0);
    assert_eq!(b.last_run_at, Some(last_run));

    // nothing changed since the last write
    assert_eq!(scheduler.sync().await.unwrap(), 0);
    assert_eq!(store.get_schedules().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_repeated_sync_keeps_one_row() {
    let store = store().await;
    let mut schedule = interval("tick", "A", 10.0);
    schedule.last_run_at = Some(t0() - chrono::Duration::minutes(5));
    store.store_schedule(schedule).await.unwrap();

    let mut scheduler = DatabaseScheduler::new(store.clone(), BeatConfig::new("A"));
    scheduler.setup_schedule().await.unwrap();
    let dispatcher = RecordingDispatcher::default();

    for step in 0..3 {
        let now = t0() + chrono::Duration::seconds(step * 10);
        scheduler.fire_due(now, &dispatcher).await.unwrap();
        scheduler.sync().await.unwrap();
    }

    let rows = store.get_schedules().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].total_run_count, 3);
    assert_eq!(rows[0].last_run_at, Some(t0() + chrono::Duration::seconds(20)));
}

#[tokio::test]
async fn test_failed_dispatch_is_not_recorded() {
    let store = store().await;
    let mut schedule = interval("flaky", "A", 60.0);
    schedule.last_run_at = Some(t0() - chrono::Duration::hours(1));
    store.store_schedule(schedule).await.unwrap();

    let mut scheduler = DatabaseScheduler::new(store.clone(), BeatConfig::new("A"));
    scheduler.setup_schedule().await.unwrap();

    let fired = scheduler.fire_due(t0(), &FailingDispatcher).await.unwrap();
    assert!(fired.is_empty());
    assert!(!scheduler.entry("flaky").unwrap().is_dirty());
    assert_eq!(scheduler.sync().await.unwrap(), 0);
    // still due on the next tick
    assert_eq!(scheduler.due(t0()), vec!["flaky".to_string()]);
}

#[tokio::test]
async fn test_record_run_on_unknown_schedule() {
    let store = store().await;
    let mut scheduler = DatabaseScheduler::new(store, BeatConfig::new("A"));
    scheduler.setup_schedule().await.unwrap();
    let err = scheduler.record_run("missing", t0()).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_refresh_keeps_unsynced_run_state() {
    let store = store().await;
    let mut schedule = interval("keep", "A", 60.0);
    schedule.last_run_at = Some(t0() - chrono::Duration::hours(1));
    store.store_schedule(schedule).await.unwrap();
    store.store_schedule(interval("gone", "A", 60.0)).await.unwrap();

    let mut scheduler = DatabaseScheduler::new(store.clone(), BeatConfig::new("A"));
    scheduler.setup_schedule().await.unwrap();
    scheduler.record_run("keep", t0()).unwrap();

    store.delete_schedule("gone", Some("A")).await.unwrap();
    store.store_schedule(interval("new", "A", 30.0)).await.unwrap();
    scheduler.refresh().await.unwrap();

    let mut ids: Vec<&str> = scheduler.entries().map(|e| e.schedule_id()).collect();
    ids.sort();
    assert_eq!(ids, vec!["keep", "new"]);

    let keep = scheduler.entry("keep").unwrap();
    assert!(keep.is_dirty());
    assert_eq!(keep.schedule.last_run_at, Some(t0()));
    assert_eq!(keep.schedule.total_run_count, 1);

    assert_eq!(scheduler.sync().await.unwrap(), 1);
    assert_eq!(find(&store, "keep", "A").await.last_run_at, Some(t0()));
}

#[tokio::test]
async fn test_refresh_drops_disabled_rows() {
    let store = store().await;
    store.store_schedule(interval("toggle", "A", 60.0)).await.unwrap();

    let mut scheduler = DatabaseScheduler::new(store.clone(), BeatConfig::new("A"));
    scheduler.setup_schedule().await.unwrap();
    assert!(scheduler.entry("toggle").is_some());

    let controller = BeatController::new(store.clone(), "A");
    controller.set_enabled("toggle", false).await.unwrap();
    scheduler.refresh().await.unwrap();
    assert!(scheduler.entry("toggle").is_none());
}

#[tokio::test]
async fn test_controller_stamps_app_and_stays_in_its_lane() {
    let store = store().await;
    store.store_schedule(interval("shared", "B", 60.0)).await.unwrap();

    let controller = BeatController::new(store.clone(), "A");
    let saved = controller
        .save_schedule(Schedule::new(
            "shared",
            "tasks.mine",
            ScheduleExpr::parse("*/5 * * * *").unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(saved.app.as_deref(), Some("A"));
    assert_eq!(saved.name, "shared");

    let listed = controller.list_schedules().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].task, "tasks.mine");

    controller.delete_schedule("shared").await.unwrap();
    assert!(controller.list_schedules().await.unwrap().is_empty());

    let other = find(&store, "shared", "B").await;
    assert_eq!(other.task, "tasks.shared");
}

#[tokio::test]
async fn test_controller_rejects_invalid_schedules() {
    let store = store().await;
    let controller = BeatController::new(store.clone(), "A");

    let bad_cron = Schedule::new(
        "bad",
        "tasks.bad",
        ScheduleExpr::Crontab(taskroot_core::CrontabSpec::parse("61 * * * *").unwrap()),
    );
    assert!(matches!(
        controller.save_schedule(bad_cron).await.unwrap_err(),
        Error::InvalidInput(_)
    ));

    let no_task = Schedule::new("empty", " ", ScheduleExpr::interval(5.0));
    assert!(matches!(
        controller.save_schedule(no_task).await.unwrap_err(),
        Error::InvalidInput(_)
    ));

    assert!(matches!(
        controller.set_enabled("missing", true).await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(store.get_schedules().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_loop_fires_and_syncs_on_shutdown() {
    let store = store().await;
    store.store_schedule(interval("fast", "A", 0.01)).await.unwrap();

    let mut config = BeatConfig::new("A");
    // only the final sync writes
    config.sync_every_seconds = 3600.0;
    let scheduler = DatabaseScheduler::new(store.clone(), config);
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(scheduler.run(
        dispatcher.clone() as Arc<dyn TaskDispatcher>,
        Duration::from_millis(20),
        rx,
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(find(&store, "fast", "A").await.total_run_count, 0);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .expect("scheduler task panicked")
        .expect("scheduler returned an error");

    let sent = dispatcher.sent().len();
    assert!(sent >= 1, "expected at least one dispatch");
    let row = find(&store, "fast", "A").await;
    assert_eq!(row.total_run_count, sent as i64);
    assert!(row.last_run_at.is_some());
}
