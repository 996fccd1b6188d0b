//! Aggregate queries over the task view: runtime stats, throughput buckets,
//! state distribution and the weekday/hour heatmap.

use chrono::Duration;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use taskroot_core::{
    summarize_runtimes, Error, Heatmap, Result, StateDistribution, TaskState, TaskStats,
    ThroughputBucket, TimeRange,
};

use crate::to_epoch;

/// Upper bound on the buckets one throughput query may produce.
const MAX_THROUGHPUT_BUCKETS: usize = 100_000;

/// Append `finished_at` bounds for an optional range.
fn push_finished_range(qb: &mut QueryBuilder<'_, Sqlite>, range: Option<&TimeRange>) {
    if let Some(range) = range {
        if let Some(start) = range.start {
            qb.push(" AND finished_at >= ").push_bind(to_epoch(start));
        }
        if let Some(end) = range.end {
            qb.push(" AND finished_at < ").push_bind(to_epoch(end));
        }
    }
}

/// SQLite implementation of task analytics.
pub struct SqliteAnalytics {
    pool: SqlitePool,
}

impl SqliteAnalytics {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runtime statistics over successful tasks with a recorded runtime,
    /// optionally restricted to one task name and a `finished_at` window.
    pub async fn task_stats(
        &self,
        task_name: Option<&str>,
        time_range: Option<TimeRange>,
    ) -> Result<TaskStats> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT runtime FROM tasks WHERE state = 'success' AND runtime IS NOT NULL",
        );
        if let Some(name) = task_name {
            qb.push(" AND name = ").push_bind(name.to_string());
        }
        push_finished_range(&mut qb, time_range.as_ref());

        let runtimes: Vec<f64> = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Storage)?
            .iter()
            .map(|row| row.get::<f64, _>("runtime"))
            .collect();

        debug!(
            subsystem = "db",
            op = "get_task_stats",
            result_count = runtimes.len(),
            "Computed task stats"
        );
        Ok(summarize_runtimes(runtimes))
    }

    /// Completion counts in `bucket_seconds`-wide buckets from `range.start`
    /// up to `range.end`, empty buckets included.
    pub async fn throughput(
        &self,
        range: TimeRange,
        bucket_seconds: i64,
    ) -> Result<Vec<ThroughputBucket>> {
        if bucket_seconds <= 0 {
            return Err(Error::InvalidInput(format!(
                "bucket_seconds must be > 0, got {}",
                bucket_seconds
            )));
        }
        let (start, end) = match (range.start, range.end) {
            (Some(start), Some(end)) if start < end => (start, end),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidInput(
                    "throughput range start must be before end".into(),
                ))
            }
            _ => {
                return Err(Error::InvalidInput(
                    "throughput requires a bounded time range".into(),
                ))
            }
        };

        // widened so a bucket wider than the whole range cannot overflow
        let span = i128::from((end - start).num_microseconds().unwrap_or(i64::MAX));
        let width = i128::from(bucket_seconds) * 1_000_000;
        let bucket_count = (span + width - 1) / width;
        if bucket_count > MAX_THROUGHPUT_BUCKETS as i128 {
            return Err(Error::InvalidInput(format!(
                "throughput would produce {} buckets",
                bucket_count
            )));
        }
        let bucket_starts = (0..bucket_count as i64)
            .map(|i| {
                bucket_seconds
                    .checked_mul(i)
                    .and_then(Duration::try_seconds)
                    .and_then(|offset| start.checked_add_signed(offset))
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "throughput bucket {} of {}s is out of range",
                            i, bucket_seconds
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let rows = sqlx::query(
            r#"
            SELECT CAST((finished_at - ?) / ? AS INTEGER) AS bucket, COUNT(*) AS count
            FROM tasks
            WHERE finished_at IS NOT NULL AND finished_at >= ? AND finished_at < ?
            GROUP BY bucket
            "#,
        )
        .bind(to_epoch(start))
        .bind(bucket_seconds as f64)
        .bind(to_epoch(start))
        .bind(to_epoch(end))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Storage)?;

        let mut buckets: Vec<ThroughputBucket> = bucket_starts
            .into_iter()
            .map(|bucket_start| ThroughputBucket {
                bucket_start,
                count: 0,
            })
            .collect();
        for row in rows {
            let index: i64 = row.get("bucket");
            let count: i64 = row.get("count");
            if let Some(bucket) = usize::try_from(index).ok().and_then(|i| buckets.get_mut(i)) {
                bucket.count += count;
            }
        }
        Ok(buckets)
    }

    /// Task counts per state. Every known state is present, possibly zero.
    pub async fn state_distribution(&self) -> Result<StateDistribution> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM tasks GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Storage)?;

        let mut distribution: StateDistribution = TaskState::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for row in rows {
            let state: String = row.get("state");
            let count: i64 = row.get("count");
            *distribution.entry(state).or_insert(0) += count;
        }
        Ok(distribution)
    }

    /// Completions by UTC weekday (rows, Monday first) and hour (columns).
    pub async fn heatmap(&self, time_range: Option<TimeRange>) -> Result<Heatmap> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT
                CAST(strftime('%w', finished_at, 'unixepoch') AS INTEGER) AS dow,
                CAST(strftime('%H', finished_at, 'unixepoch') AS INTEGER) AS hour,
                COUNT(*) AS count
            FROM tasks
            WHERE finished_at IS NOT NULL
            "#,
        );
        push_finished_range(&mut qb, time_range.as_ref());
        qb.push(" GROUP BY dow, hour");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Storage)?;

        let mut heatmap: Heatmap = vec![vec![0; 24]; 7];
        for row in rows {
            let dow: i64 = row.get("dow");
            let hour: i64 = row.get("hour");
            let count: i64 = row.get("count");
            // strftime('%w') counts from Sunday = 0.
            let weekday = ((dow + 6) % 7) as usize;
            if let Some(cell) = heatmap
                .get_mut(weekday)
                .and_then(|r| r.get_mut(hour as usize))
            {
                *cell += count;
            }
        }
        Ok(heatmap)
    }
}
