//! Tests for schedule storage.
//!
//! This test suite validates:
//! - Storing the same schedule id twice keeps exactly one row with the
//!   latest definition
//! - The same id under different apps is two schedules
//! - Deletion is scoped to the app
//! - Run state and args survive a round trip through the dataset

use chrono::{TimeZone, Utc};
use serde_json::json;
use taskroot_db::{EventStore, Schedule, ScheduleExpr, SqliteStore};

async fn store() -> SqliteStore {
    let store = SqliteStore::open_in_memory()
        .await
        .expect("Failed to open store");
    store.initialize().await.expect("Failed to initialize store");
    store
}

#[tokio::test]
async fn test_upsert_keeps_one_row_with_latest_expression() {
    let store = store().await;
    let first = Schedule::new(
        "cleanup",
        "tasks.cleanup",
        ScheduleExpr::parse("*/5 * * * *").unwrap(),
    );
    let second = Schedule {
        schedule: ScheduleExpr::interval(30.0),
        ..first.clone()
    };

    store.store_schedule(first).await.unwrap();
    store.store_schedule(second).await.unwrap();

    let schedules = store.get_schedules().await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].schedule, ScheduleExpr::interval(30.0));
}

#[tokio::test]
async fn test_same_id_under_two_apps() {
    let store = store().await;
    let expr = ScheduleExpr::interval(10.0);
    store
        .store_schedule(Schedule::new("s1", "tasks.a", expr.clone()).with_app("A"))
        .await
        .unwrap();
    store
        .store_schedule(Schedule::new("s1", "tasks.b", expr).with_app("B"))
        .await
        .unwrap();
    assert_eq!(store.get_schedules().await.unwrap().len(), 2);

    store.delete_schedule("s1", Some("A")).await.unwrap();
    let remaining = store.get_schedules().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].app.as_deref(), Some("B"));
    assert_eq!(remaining[0].task, "tasks.b");

    // deleting something absent is a no-op
    store.delete_schedule("s1", Some("A")).await.unwrap();
    store.delete_schedule("s1", None).await.unwrap();
    assert_eq!(store.get_schedules().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_round_trip_preserves_fields() {
    let store = store().await;
    let last_run = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
    let mut schedule = Schedule::new(
        "report",
        "tasks.report",
        ScheduleExpr::parse("0 1 * * 1-5").unwrap(),
    );
    schedule.name = "Nightly report".to_string();
    schedule.args = vec![json!(1), json!("two")];
    schedule.kwargs = json!({"fmt": "pdf"}).as_object().cloned().unwrap();
    schedule.enabled = false;
    schedule.last_run_at = Some(last_run);
    schedule.total_run_count = 12;

    store.store_schedule(schedule.clone()).await.unwrap();

    let loaded = store.get_schedules().await.unwrap().remove(0);
    assert_eq!(loaded, schedule);
    assert_eq!(loaded.app, None);
}

#[tokio::test]
async fn test_empty_id_is_rejected() {
    let store = store().await;
    let err = store
        .store_schedule(Schedule::new("", "tasks.a", ScheduleExpr::interval(1.0)))
        .await
        .unwrap_err();
    assert!(matches!(err, taskroot_db::Error::InvalidInput(_)));
}
