//! Broker queue snapshot repository.

use sqlx::{Row, SqlitePool};

use taskroot_core::{BrokerQueueEvent, Error, Result};

use crate::{from_epoch, to_epoch};

/// SQLite implementation of broker queue storage.
pub struct SqliteBrokerRepository {
    pool: SqlitePool,
}

impl SqliteBrokerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append the snapshot and replace the current row for its queue unless
    /// a newer snapshot is already current.
    pub async fn store_event(&self, event: &BrokerQueueEvent) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Storage)?;

        let seq = sqlx::query(
            r#"
            INSERT INTO broker_queue_events (broker_url, queue_name, depth, consumers, ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.broker_url)
        .bind(&event.queue_name)
        .bind(event.depth)
        .bind(event.consumers)
        .bind(to_epoch(event.timestamp))
        .execute(&mut *tx)
        .await
        .map_err(Error::Storage)?
        .last_insert_rowid();

        sqlx::query(
            r#"
            INSERT INTO broker_queue_current (broker_url, queue_name, depth, consumers, ts, seq)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (broker_url, queue_name) DO UPDATE SET
                depth = excluded.depth,
                consumers = excluded.consumers,
                ts = excluded.ts,
                seq = excluded.seq
            WHERE excluded.ts >= broker_queue_current.ts
            "#,
        )
        .bind(&event.broker_url)
        .bind(&event.queue_name)
        .bind(event.depth)
        .bind(event.consumers)
        .bind(to_epoch(event.timestamp))
        .bind(seq)
        .execute(&mut *tx)
        .await
        .map_err(Error::Storage)?;

        tx.commit().await.map_err(Error::Storage)?;
        Ok(())
    }

    /// Current snapshot of every queue on `broker_url`, by queue name.
    pub async fn snapshot(&self, broker_url: &str) -> Result<Vec<BrokerQueueEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT broker_url, queue_name, depth, consumers, ts
            FROM broker_queue_current
            WHERE broker_url = ?
            ORDER BY queue_name
            "#,
        )
        .bind(broker_url)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Storage)?;

        Ok(rows
            .iter()
            .map(|row| BrokerQueueEvent {
                broker_url: row.get("broker_url"),
                queue_name: row.get("queue_name"),
                depth: row.get("depth"),
                consumers: row.get("consumers"),
                timestamp: from_epoch(row.get("ts")),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_keeps_newest_per_queue() {
        let pool = crate::create_pool(None).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let repo = SqliteBrokerRepository::new(pool);
        let url = "redis://localhost:6379/0";

        repo.store_event(&BrokerQueueEvent::new(url, "default", 5, at(10)))
            .await
            .unwrap();
        repo.store_event(&BrokerQueueEvent::new(url, "default", 9, at(5)))
            .await
            .unwrap();
        repo.store_event(&BrokerQueueEvent::new(url, "alpha", 1, at(1)))
            .await
            .unwrap();
        repo.store_event(&BrokerQueueEvent::new("amqp://other", "default", 7, at(20)))
            .await
            .unwrap();

        let snapshot = repo.snapshot(url).await.unwrap();
        let queues: Vec<(&str, i64)> = snapshot
            .iter()
            .map(|e| (e.queue_name.as_str(), e.depth))
            .collect();
        assert_eq!(queues, vec![("alpha", 1), ("default", 5)]);
        assert_eq!(snapshot[1].timestamp, at(10));
    }
}
