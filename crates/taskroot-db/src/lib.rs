//! # taskroot-db
//!
//! SQLite event store and query engine for the taskroot control plane.
//!
//! This crate provides:
//! - Single-writer connection pool management
//! - Versioned schema with stepwise migrations
//! - Task, worker and broker event ingestion folded into materialized views
//! - Bounded pagination, relation graph expansion and runtime analytics
//! - Schedule storage and retention cleanup
//!
//! ## Example
//!
//! ```rust,ignore
//! use taskroot_db::{SqliteStore, EventStore, TaskEvent, TaskState};
//!
//! #[tokio::main]
//! async fn main() -> taskroot_core::Result<()> {
//!     let store = SqliteStore::open_in_memory().await?;
//!     store.initialize().await?;
//!
//!     store
//!         .store_task_event(TaskEvent::new("t1", TaskState::Started, chrono::Utc::now()))
//!         .await?;
//!     println!("{:?}", store.get_task("t1").await?);
//!     Ok(())
//! }
//! ```

pub mod analytics;
pub mod brokers;
pub mod pool;
pub mod relations;
pub mod retention;
pub mod schedules;
pub mod schema;
pub mod tasks;
pub mod workers;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, trace};

// Re-export core types
pub use taskroot_core::*;

pub use analytics::SqliteAnalytics;
pub use brokers::SqliteBrokerRepository;
pub use pool::{create_pool, create_pool_with_config, purge_dataset, PoolConfig};
pub use relations::SqliteRelationRepository;
pub use retention::{run_retention_loop, SqliteRetention};
pub use schedules::SqliteScheduleRepository;
pub use schema::CURRENT_SCHEMA_VERSION;
pub use tasks::{fold_event, SqliteTaskRepository};
pub use workers::{fold_worker_event, SqliteWorkerRepository};

/// Escape LIKE wildcard characters (`%`, `_`, `\`) in user input.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Timestamps are stored as REAL seconds since the epoch, microsecond precision.
pub(crate) fn to_epoch(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

pub(crate) fn from_epoch(seconds: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Round a timestamp to what the dataset can represent.
pub(crate) fn quantize(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_epoch(to_epoch(ts))
}

/// The owning process's event store: every repository over one
/// single-connection pool.
pub struct SqliteStore {
    /// The underlying connection pool.
    pub pool: SqlitePool,
    /// Task events and the task view.
    pub tasks: SqliteTaskRepository,
    /// Workflow edges.
    pub relations: SqliteRelationRepository,
    /// Worker events and the worker view.
    pub workers: SqliteWorkerRepository,
    /// Broker queue snapshots.
    pub brokers: SqliteBrokerRepository,
    /// Periodic task schedules.
    pub schedules: SqliteScheduleRepository,
    /// Stats, throughput, distribution and heatmap queries.
    pub analytics: SqliteAnalytics,
    /// Retention cleanup.
    pub retention: SqliteRetention,
    exporters: Vec<Arc<dyn MetricsExporter>>,
}

impl SqliteStore {
    /// Create a store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            tasks: SqliteTaskRepository::new(pool.clone()),
            relations: SqliteRelationRepository::new(pool.clone()),
            workers: SqliteWorkerRepository::new(pool.clone()),
            brokers: SqliteBrokerRepository::new(pool.clone()),
            schedules: SqliteScheduleRepository::new(pool.clone()),
            analytics: SqliteAnalytics::new(pool.clone()),
            retention: SqliteRetention::new(pool.clone()),
            exporters: Vec::new(),
            pool,
        }
    }

    /// Open the dataset described by `config`, purging it first when asked.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let path = config.db_path.as_deref();
        if let (true, Some(path)) = (config.purge_db, path) {
            info!(
                subsystem = "db",
                op = "purge",
                db_path = %path.display(),
                "Purging dataset before open"
            );
            purge_dataset(path).await?;
        }
        let pool = create_pool(path).await?;
        Ok(Self::new(pool))
    }

    /// Open a dataset file with default pool settings.
    pub async fn open_path(path: &Path) -> Result<Self> {
        Ok(Self::new(create_pool(Some(path)).await?))
    }

    /// Open a private in-memory dataset.
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(create_pool(None).await?))
    }

    /// Register an exporter notified after every committed task or worker event.
    pub fn with_exporter(mut self, exporter: Arc<dyn MetricsExporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        self.ensure_schema().await?;
        schema::touch_opened_at(&self.pool, to_epoch(Utc::now())).await?;
        info!(
            subsystem = "db",
            op = "initialize",
            version = CURRENT_SCHEMA_VERSION,
            "Event store ready"
        );
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        schema::ensure_schema(&self.pool).await
    }

    async fn get_schema_version(&self) -> Result<i64> {
        schema::get_schema_version(&self.pool).await
    }

    async fn migrate(&self, from_version: i64, to_version: i64) -> Result<()> {
        schema::migrate(&self.pool, from_version, to_version).await
    }

    async fn close(&self) -> Result<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            debug!(subsystem = "db", op = "close", "Event store closed");
        }
        Ok(())
    }

    async fn store_task_event(&self, event: TaskEvent) -> Result<()> {
        let seq = self.tasks.store_event(&event).await?;
        trace!(
            subsystem = "db",
            op = "store_task_event",
            task_id = %event.task_id,
            state = %event.state,
            seq,
            "Task event stored"
        );
        for exporter in &self.exporters {
            exporter.on_task_event(&event);
        }
        Ok(())
    }

    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.tasks.list(&filter).await
    }

    async fn get_tasks_page(&self, request: TaskPageRequest) -> Result<TaskPage> {
        self.tasks.page(&request).await
    }

    async fn list_task_names(&self) -> Result<Vec<String>> {
        self.tasks.list_names().await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.tasks.get(task_id).await
    }

    async fn store_task_relation(&self, relation: TaskRelation) -> Result<()> {
        self.relations.store(&relation).await
    }

    async fn get_task_relations(&self, root_id: &str) -> Result<Vec<TaskRelation>> {
        self.relations
            .expand(root_id, defaults::RELATION_MAX_DEPTH, defaults::RELATION_MAX_NODES)
            .await
    }

    async fn store_worker_event(&self, event: WorkerEvent) -> Result<()> {
        self.workers.store_event(&event).await?;
        trace!(
            subsystem = "db",
            op = "store_worker_event",
            hostname = %event.hostname,
            event = %event.event,
            "Worker event stored"
        );
        for exporter in &self.exporters {
            exporter.on_worker_event(&event);
        }
        Ok(())
    }

    async fn get_workers(&self) -> Result<Vec<Worker>> {
        self.workers.list().await
    }

    async fn get_worker(&self, hostname: &str) -> Result<Option<Worker>> {
        self.workers.get(hostname).await
    }

    async fn get_worker_event_snapshot(&self, hostname: &str) -> Result<Option<WorkerEvent>> {
        self.workers.latest_event(hostname).await
    }

    async fn get_worker_stats(&self) -> Result<WorkerStats> {
        self.workers.stats().await
    }

    async fn store_broker_queue_event(&self, event: BrokerQueueEvent) -> Result<()> {
        self.brokers.store_event(&event).await
    }

    async fn get_broker_queue_snapshot(&self, broker_url: &str) -> Result<Vec<BrokerQueueEvent>> {
        self.brokers.snapshot(broker_url).await
    }

    async fn get_task_stats(
        &self,
        task_name: Option<&str>,
        time_range: Option<TimeRange>,
    ) -> Result<TaskStats> {
        self.analytics.task_stats(task_name, time_range).await
    }

    async fn get_throughput(
        &self,
        time_range: TimeRange,
        bucket_seconds: i64,
    ) -> Result<Vec<ThroughputBucket>> {
        self.analytics.throughput(time_range, bucket_seconds).await
    }

    async fn get_state_distribution(&self) -> Result<StateDistribution> {
        self.analytics.state_distribution().await
    }

    async fn get_heatmap(&self, time_range: Option<TimeRange>) -> Result<Heatmap> {
        self.analytics.heatmap(time_range).await
    }

    async fn get_schedules(&self) -> Result<Vec<Schedule>> {
        self.schedules.list().await
    }

    async fn store_schedule(&self, schedule: Schedule) -> Result<()> {
        self.schedules.upsert(&schedule).await
    }

    async fn delete_schedule(&self, schedule_id: &str, app: Option<&str>) -> Result<()> {
        self.schedules.delete(schedule_id, app).await
    }

    async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        self.retention.cleanup(older_than_days, Utc::now()).await
    }
}
