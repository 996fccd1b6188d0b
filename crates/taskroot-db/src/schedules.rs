//! Schedule repository.
//!
//! Rows are keyed by `(app, schedule_id)`; a schedule without an app is
//! stored under the empty app.

use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use taskroot_core::{Error, Result, Schedule, ScheduleExpr};

use crate::{from_epoch, to_epoch};

/// SQLite implementation of schedule storage.
pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_schedule_row(row: &SqliteRow) -> Schedule {
        let app: String = row.get("app");
        let expr: String = row.get("schedule");
        let args: String = row.get("args");
        let kwargs: String = row.get("kwargs");
        let enabled: i64 = row.get("enabled");
        Schedule {
            schedule_id: row.get("schedule_id"),
            name: row.get("name"),
            task: row.get("task"),
            schedule: ScheduleExpr::parse_lenient(&expr),
            args: serde_json::from_str::<Vec<JsonValue>>(&args).unwrap_or_default(),
            kwargs: serde_json::from_str(&kwargs).unwrap_or_default(),
            enabled: enabled != 0,
            last_run_at: row.get::<Option<f64>, _>("last_run_at").map(from_epoch),
            total_run_count: row.get("total_run_count"),
            app: Some(app).filter(|a| !a.is_empty()),
        }
    }

    /// Every schedule, by app then id.
    pub async fn list(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY app, schedule_id")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Storage)?;
        Ok(rows.iter().map(Self::parse_schedule_row).collect())
    }

    /// Schedules owned by `app`.
    pub async fn list_for_app(&self, app: &str) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE app = ? ORDER BY schedule_id")
            .bind(app)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Storage)?;
        Ok(rows.iter().map(Self::parse_schedule_row).collect())
    }

    /// Insert or replace the row for `(app, schedule_id)`.
    pub async fn upsert(&self, schedule: &Schedule) -> Result<()> {
        if schedule.schedule_id.is_empty() {
            return Err(Error::InvalidInput("schedule_id must not be empty".into()));
        }
        let args = serde_json::to_string(&schedule.args)?;
        let kwargs = serde_json::to_string(&schedule.kwargs)?;

        let mut tx = self.pool.begin().await.map_err(Error::Storage)?;
        sqlx::query(
            r#"
            INSERT INTO schedules
                (app, schedule_id, name, task, schedule, args, kwargs, enabled,
                 last_run_at, total_run_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (app, schedule_id) DO UPDATE SET
                name = excluded.name,
                task = excluded.task,
                schedule = excluded.schedule,
                args = excluded.args,
                kwargs = excluded.kwargs,
                enabled = excluded.enabled,
                last_run_at = excluded.last_run_at,
                total_run_count = excluded.total_run_count
            "#,
        )
        .bind(schedule.app.as_deref().unwrap_or(""))
        .bind(&schedule.schedule_id)
        .bind(&schedule.name)
        .bind(&schedule.task)
        .bind(schedule.schedule.to_string())
        .bind(&args)
        .bind(&kwargs)
        .bind(schedule.enabled as i64)
        .bind(schedule.last_run_at.map(to_epoch))
        .bind(schedule.total_run_count)
        .execute(&mut *tx)
        .await
        .map_err(Error::Storage)?;
        tx.commit().await.map_err(Error::Storage)?;

        debug!(
            subsystem = "db",
            op = "store_schedule",
            schedule_id = %schedule.schedule_id,
            app = schedule.app.as_deref().unwrap_or(""),
            "Schedule stored"
        );
        Ok(())
    }

    /// Delete `schedule_id` within `app`. Deleting a missing row is a no-op.
    pub async fn delete(&self, schedule_id: &str, app: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Storage)?;
        let result = sqlx::query("DELETE FROM schedules WHERE app = ? AND schedule_id = ?")
            .bind(app.unwrap_or(""))
            .bind(schedule_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Storage)?;
        tx.commit().await.map_err(Error::Storage)?;

        debug!(
            subsystem = "db",
            op = "delete_schedule",
            schedule_id,
            deleted_count = result.rows_affected(),
            "Schedule deleted"
        );
        Ok(())
    }
}
