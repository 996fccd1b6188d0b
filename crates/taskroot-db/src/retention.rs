//! Retention cleanup of raw events and the views they leave behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskroot_core::{Error, EventStore, Result};

use crate::to_epoch;

/// SQLite implementation of retention cleanup.
pub struct SqliteRetention {
    pool: SqlitePool,
}

impl SqliteRetention {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete every event strictly older than `now - older_than_days`, then
    /// tasks, workers and current broker rows with no remaining event and
    /// relations whose root task is gone. Returns the number of raw events
    /// deleted.
    pub async fn cleanup(&self, older_than_days: u32, now: DateTime<Utc>) -> Result<u64> {
        let start = Instant::now();
        let cutoff = to_epoch(now - chrono::Duration::days(i64::from(older_than_days)));

        let mut tx = self.pool.begin().await.map_err(Error::Storage)?;

        let mut deleted = 0u64;
        for statement in [
            "DELETE FROM task_events WHERE ts < ?",
            "DELETE FROM worker_events WHERE ts < ?",
            "DELETE FROM broker_queue_events WHERE ts < ?",
        ] {
            deleted += sqlx::query(statement)
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .map_err(Error::Storage)?
                .rows_affected();
        }

        let mut orphans = 0u64;
        for statement in [
            "DELETE FROM tasks WHERE NOT EXISTS
                (SELECT 1 FROM task_events e WHERE e.task_id = tasks.task_id)",
            "DELETE FROM workers WHERE NOT EXISTS
                (SELECT 1 FROM worker_events e WHERE e.hostname = workers.hostname)",
            "DELETE FROM broker_queue_current WHERE NOT EXISTS
                (SELECT 1 FROM broker_queue_events e
                 WHERE e.broker_url = broker_queue_current.broker_url
                   AND e.queue_name = broker_queue_current.queue_name)",
            "DELETE FROM task_relations WHERE NOT EXISTS
                (SELECT 1 FROM tasks t WHERE t.task_id = task_relations.root_id)",
        ] {
            orphans += sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(Error::Storage)?
                .rows_affected();
        }

        tx.commit().await.map_err(Error::Storage)?;

        info!(
            subsystem = "db",
            op = "cleanup",
            older_than_days,
            deleted_count = deleted,
            orphan_count = orphans,
            duration_ms = start.elapsed().as_millis() as u64,
            "Retention cleanup complete"
        );
        Ok(deleted)
    }
}

/// Run `cleanup(retention_days)` every `interval` until `shutdown` flips to
/// true. Failures are logged and retried on the next tick.
pub async fn run_retention_loop(
    store: Arc<dyn EventStore>,
    retention_days: u32,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.cleanup(retention_days).await {
                    Ok(deleted) => debug!(
                        subsystem = "db",
                        op = "retention_tick",
                        deleted_count = deleted,
                        "Retention tick"
                    ),
                    Err(e) => warn!(
                        subsystem = "db",
                        op = "retention_tick",
                        error = %e,
                        "Retention cleanup failed"
                    ),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(subsystem = "db", op = "retention_loop", "Retention loop stopping");
                    break;
                }
            }
        }
    }
}
