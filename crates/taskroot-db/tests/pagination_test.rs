//! Tests for bounded task pagination.
//!
//! This test suite validates:
//! - Pages never exceed the requested limit and always report the full
//!   match count
//! - Walking every page in order reproduces the unpaginated result exactly
//! - Ties on the sort column are broken by task id
//! - Limits are clamped into the supported range

use std::collections::HashSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use taskroot_db::{
    EventStore, SortDir, SqliteStore, TaskEvent, TaskFilter, TaskPageRequest, TaskSortKey,
    TaskState, TimeRange,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

/// 37 tasks; names cycle over three values so sorting by name produces ties.
async fn seeded_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory()
        .await
        .expect("Failed to open store");
    store.initialize().await.expect("Failed to initialize store");

    let names = ["tasks.add", "tasks.mul", "tasks.sub"];
    for i in 0..37 {
        let state = if i % 4 == 0 {
            TaskState::Failure
        } else {
            TaskState::Success
        };
        let event = TaskEvent::new(format!("task-{:03}", i), state, t0() + Duration::seconds(i / 2))
            .with_name(names[(i % 3) as usize])
            .with_worker(if i % 2 == 0 { "w1" } else { "w2" })
            .with_args(format!("[{}]", i), "{}")
            .with_runtime(f64::from(i as i32 % 5));
        store.store_task_event(event).await.unwrap();
    }
    store
}

async fn walk_pages(
    store: &SqliteStore,
    filter: TaskFilter,
    sort_key: TaskSortKey,
    sort_dir: SortDir,
    limit: i64,
) -> (Vec<String>, i64) {
    let mut ids = Vec::new();
    let mut offset = 0;
    let mut total = -1;
    loop {
        let page = store
            .get_tasks_page(TaskPageRequest {
                filter: filter.clone(),
                sort_key,
                sort_dir,
                limit,
                offset,
            })
            .await
            .unwrap();
        assert!(page.tasks.len() as i64 <= limit);
        if total >= 0 {
            assert_eq!(page.total, total, "total must not change between pages");
        }
        total = page.total;
        if page.tasks.is_empty() {
            break;
        }
        offset += page.tasks.len() as i64;
        ids.extend(page.tasks.into_iter().map(|t| t.task_id));
    }
    (ids, total)
}

#[tokio::test]
async fn test_union_of_pages_equals_full_result() {
    let store = seeded_store().await;
    let full = store.get_tasks(TaskFilter::new()).await.unwrap();
    let full_ids: HashSet<String> = full.iter().map(|t| t.task_id.clone()).collect();

    for sort_key in [
        TaskSortKey::LastUpdated,
        TaskSortKey::Name,
        TaskSortKey::State,
        TaskSortKey::Worker,
        TaskSortKey::Runtime,
        TaskSortKey::TaskId,
    ] {
        for sort_dir in [SortDir::Asc, SortDir::Desc] {
            for limit in [1, 5, 10, 37, 100] {
                let (ids, total) =
                    walk_pages(&store, TaskFilter::new(), sort_key, sort_dir, limit).await;
                assert_eq!(total, 37);
                assert_eq!(ids.len(), 37, "{:?} {:?} limit {}", sort_key, sort_dir, limit);
                let unique: HashSet<String> = ids.iter().cloned().collect();
                assert_eq!(unique, full_ids, "{:?} {:?} limit {}", sort_key, sort_dir, limit);
            }
        }
    }
}

#[tokio::test]
async fn test_total_reflects_filter() {
    let store = seeded_store().await;
    let filter = TaskFilter::new().state(TaskState::Failure).worker("w1");
    let (ids, total) = walk_pages(&store, filter.clone(), TaskSortKey::Name, SortDir::Asc, 3).await;

    let expected = store.get_tasks(filter).await.unwrap();
    assert_eq!(total, expected.len() as i64);
    assert_eq!(ids.len(), expected.len());
    // failures are every 4th task, all even so all on w1
    assert_eq!(total, 10);
}

#[tokio::test]
async fn test_ties_are_broken_by_task_id() {
    let store = seeded_store().await;
    let page = store
        .get_tasks_page(TaskPageRequest {
            filter: TaskFilter::new().name("tasks.add"),
            sort_key: TaskSortKey::Name,
            sort_dir: SortDir::Desc,
            limit: 100,
            offset: 0,
        })
        .await
        .unwrap();

    let ids: Vec<&str> = page.tasks.iter().map(|t| t.task_id.as_str()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[tokio::test]
async fn test_search_and_time_range() {
    let store = seeded_store().await;

    let by_args = store
        .get_tasks(TaskFilter::new().search("[12]"))
        .await
        .unwrap();
    assert_eq!(by_args.len(), 1);
    assert_eq!(by_args[0].task_id, "task-012");

    let literal_percent = store.get_tasks(TaskFilter::new().search("%")).await.unwrap();
    assert!(literal_percent.is_empty());

    let range = TimeRange::between(t0(), t0() + Duration::seconds(2));
    let early = store
        .get_tasks(TaskFilter::new().time_range(range))
        .await
        .unwrap();
    // seconds 0 and 1 hold tasks 0..=3
    assert_eq!(early.len(), 4);
}

#[tokio::test]
async fn test_limit_is_clamped() {
    let store = seeded_store().await;

    let zero = store
        .get_tasks_page(TaskPageRequest {
            limit: 0,
            ..TaskPageRequest::default()
        })
        .await
        .unwrap();
    assert!(zero.tasks.is_empty());
    assert_eq!(zero.total, 37);

    let negative = store
        .get_tasks_page(TaskPageRequest {
            limit: -5,
            offset: 3,
            ..TaskPageRequest::default()
        })
        .await
        .unwrap();
    assert!(negative.tasks.is_empty());
    assert_eq!(negative.total, 37);

    for limit in [1, 2, 7, 36, 37, 38] {
        let page = store
            .get_tasks_page(TaskPageRequest {
                limit,
                ..TaskPageRequest::default()
            })
            .await
            .unwrap();
        assert!(page.tasks.len() as i64 <= limit);
        assert_eq!(page.tasks.len() as i64, limit.min(37));
        assert_eq!(page.total, 37);
    }

    let huge = store
        .get_tasks_page(TaskPageRequest {
            limit: 1_000_000,
            ..TaskPageRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(huge.tasks.len(), 37);

    let negative_offset = store
        .get_tasks_page(TaskPageRequest {
            limit: 5,
            offset: -10,
            ..TaskPageRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(negative_offset.tasks.len(), 5);
}

#[tokio::test]
async fn test_page_past_end_is_empty() {
    let store = seeded_store().await;
    let page = store
        .get_tasks_page(TaskPageRequest {
            limit: 10,
            offset: 500,
            ..TaskPageRequest::default()
        })
        .await
        .unwrap();
    assert!(page.tasks.is_empty());
    assert_eq!(page.total, 37);
}
