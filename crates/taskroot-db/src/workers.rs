//! Worker event repository.

use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use taskroot_core::{
    Error, Result, Worker, WorkerEvent, WorkerEventKind, WorkerStats, WorkerStatus,
};

use crate::{from_epoch, quantize, to_epoch};

fn info_int(info: &Option<JsonValue>, key: &str) -> Option<i64> {
    info.as_ref()?.get(key)?.as_i64()
}

/// Fold one worker event into the current view of its host, using the same
/// last-writer-wins rule as tasks.
pub fn fold_worker_event(existing: Option<Worker>, event: &WorkerEvent) -> Worker {
    let ts = quantize(event.timestamp);
    let (mut worker, wins) = match existing {
        Some(worker) => {
            let wins = ts >= worker.last_updated;
            (worker, wins)
        }
        None => (
            Worker {
                hostname: event.hostname.clone(),
                status: WorkerStatus::from_event(&event.event),
                last_heartbeat: None,
                last_updated: ts,
                info: None,
                pid: None,
                active: None,
                processed: None,
            },
            true,
        ),
    };

    if wins {
        worker.status = WorkerStatus::from_event(&event.event);
        worker.last_updated = ts;
    }
    if event.info.is_some() && (wins || worker.info.is_none()) {
        worker.info = event.info.clone();
        worker.pid = info_int(&event.info, "pid").or(worker.pid);
        worker.active = info_int(&event.info, "active").or(worker.active);
        worker.processed = info_int(&event.info, "processed").or(worker.processed);
    }
    if matches!(event.event, WorkerEventKind::Heartbeat | WorkerEventKind::Online) {
        worker.last_heartbeat = Some(worker.last_heartbeat.map_or(ts, |t| t.max(ts)));
    }
    worker
}

/// SQLite implementation of worker storage.
pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_info(text: Option<String>) -> Option<JsonValue> {
        text.and_then(|t| serde_json::from_str(&t).ok())
    }

    fn parse_worker_row(row: &SqliteRow) -> Worker {
        let status: String = row.get("status");
        Worker {
            hostname: row.get("hostname"),
            status: status.parse().unwrap_or(WorkerStatus::Offline),
            last_heartbeat: row.get::<Option<f64>, _>("last_heartbeat").map(from_epoch),
            last_updated: from_epoch(row.get("last_updated")),
            info: Self::parse_info(row.get("info")),
            pid: row.get("pid"),
            active: row.get("active"),
            processed: row.get("processed"),
        }
    }

    fn parse_event_row(row: &SqliteRow) -> WorkerEvent {
        let event: String = row.get("event");
        WorkerEvent {
            hostname: row.get("hostname"),
            event: WorkerEventKind::from(event),
            timestamp: from_epoch(row.get("ts")),
            info: Self::parse_info(row.get("info")),
        }
    }

    /// Append the raw event and fold it into the worker view.
    pub async fn store_event(&self, event: &WorkerEvent) -> Result<i64> {
        if event.hostname.is_empty() {
            return Err(Error::InvalidInput("hostname must not be empty".into()));
        }
        let info_text = event
            .info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await.map_err(Error::Storage)?;

        let seq = sqlx::query(
            "INSERT INTO worker_events (hostname, event, ts, info) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.hostname)
        .bind(event.event.as_str())
        .bind(to_epoch(event.timestamp))
        .bind(&info_text)
        .execute(&mut *tx)
        .await
        .map_err(Error::Storage)?
        .last_insert_rowid();

        let existing = sqlx::query("SELECT * FROM workers WHERE hostname = ?")
            .bind(&event.hostname)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Storage)?
            .map(|row| Self::parse_worker_row(&row));

        let worker = fold_worker_event(existing, event);
        let worker_info = worker
            .info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO workers
                (hostname, status, last_heartbeat, last_updated, info, pid, active, processed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (hostname) DO UPDATE SET
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                last_updated = excluded.last_updated,
                info = excluded.info,
                pid = excluded.pid,
                active = excluded.active,
                processed = excluded.processed
            "#,
        )
        .bind(&worker.hostname)
        .bind(worker.status.as_str())
        .bind(worker.last_heartbeat.map(to_epoch))
        .bind(to_epoch(worker.last_updated))
        .bind(&worker_info)
        .bind(worker.pid)
        .bind(worker.active)
        .bind(worker.processed)
        .execute(&mut *tx)
        .await
        .map_err(Error::Storage)?;

        tx.commit().await.map_err(Error::Storage)?;
        Ok(seq)
    }

    /// All worker views, by hostname.
    pub async fn list(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY hostname")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Storage)?;
        Ok(rows.iter().map(Self::parse_worker_row).collect())
    }

    pub async fn get(&self, hostname: &str) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE hostname = ?")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Storage)?;
        Ok(row.map(|r| Self::parse_worker_row(&r)))
    }

    /// Latest raw event by `(timestamp, sequence)`.
    pub async fn latest_event(&self, hostname: &str) -> Result<Option<WorkerEvent>> {
        let row = sqlx::query(
            r#"
            SELECT hostname, event, ts, info FROM worker_events
            WHERE hostname = ?
            ORDER BY ts DESC, seq DESC
            LIMIT 1
            "#,
        )
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Storage)?;
        Ok(row.map(|r| Self::parse_event_row(&r)))
    }

    /// Online/offline counts over worker views.
    pub async fn stats(&self) -> Result<WorkerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'online' THEN 1 ELSE 0 END), 0) AS online
            FROM workers
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Storage)?;

        let total: i64 = row.get("total");
        let online: i64 = row.get("online");
        Ok(WorkerStats {
            total,
            online,
            offline: total - online,
        })
    }
}
