//! Capability traits shared across taskroot crates.
//!
//! [`EventStore`] is implemented by the owning process's SQLite store and by
//! the RPC client that siblings use; consumers cannot tell them apart.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// EVENT STORE
// =============================================================================

/// The full set of event-store operations.
#[async_trait]
pub trait EventStore: Send + Sync {
    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Prepare the dataset for use. Safe on every startup.
    async fn initialize(&self) -> Result<()>;

    /// Create any missing structures. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Version recorded in the dataset.
    async fn get_schema_version(&self) -> Result<i64>;

    /// Apply every migration step in `(from, to]`. A missing step or a
    /// downgrade fails with `SchemaVersion`.
    async fn migrate(&self, from_version: i64, to_version: i64) -> Result<()>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<()>;

    // ─── Tasks ─────────────────────────────────────────────────────────────

    /// Append a task event and fold it into the task view.
    async fn store_task_event(&self, event: TaskEvent) -> Result<()>;

    /// All tasks matching `filter`, most recently updated first.
    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>>;

    /// One bounded page of matching tasks plus the total match count.
    async fn get_tasks_page(&self, request: TaskPageRequest) -> Result<TaskPage>;

    /// Distinct task names, sorted.
    async fn list_task_names(&self) -> Result<Vec<String>>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Store a workflow edge. Storing an existing edge is a no-op.
    async fn store_task_relation(&self, relation: TaskRelation) -> Result<()>;

    /// Edges reachable from `root_id`, breadth first, without duplicates.
    async fn get_task_relations(&self, root_id: &str) -> Result<Vec<TaskRelation>>;

    // ─── Workers ───────────────────────────────────────────────────────────

    async fn store_worker_event(&self, event: WorkerEvent) -> Result<()>;

    async fn get_workers(&self) -> Result<Vec<Worker>>;

    async fn get_worker(&self, hostname: &str) -> Result<Option<Worker>>;

    /// Most recent raw event reported by `hostname`.
    async fn get_worker_event_snapshot(&self, hostname: &str) -> Result<Option<WorkerEvent>>;

    async fn get_worker_stats(&self) -> Result<WorkerStats>;

    // ─── Broker ────────────────────────────────────────────────────────────

    async fn store_broker_queue_event(&self, event: BrokerQueueEvent) -> Result<()>;

    /// Current snapshot per queue of `broker_url`, ordered by queue name.
    async fn get_broker_queue_snapshot(&self, broker_url: &str) -> Result<Vec<BrokerQueueEvent>>;

    // ─── Analytics ─────────────────────────────────────────────────────────

    /// Runtime statistics over successfully completed tasks.
    async fn get_task_stats(
        &self,
        task_name: Option<&str>,
        time_range: Option<TimeRange>,
    ) -> Result<TaskStats>;

    /// Completion counts in fixed buckets covering a bounded range.
    async fn get_throughput(
        &self,
        time_range: TimeRange,
        bucket_seconds: i64,
    ) -> Result<Vec<ThroughputBucket>>;

    async fn get_state_distribution(&self) -> Result<StateDistribution>;

    /// Completions by weekday and hour.
    async fn get_heatmap(&self, time_range: Option<TimeRange>) -> Result<Heatmap>;

    // ─── Schedules ─────────────────────────────────────────────────────────

    async fn get_schedules(&self) -> Result<Vec<Schedule>>;

    /// Upsert on `(app, schedule_id)`.
    async fn store_schedule(&self, schedule: Schedule) -> Result<()>;

    async fn delete_schedule(&self, schedule_id: &str, app: Option<&str>) -> Result<()>;

    // ─── Retention ─────────────────────────────────────────────────────────

    /// Delete raw events older than `older_than_days` and the views they
    /// leave orphaned. Returns the number of raw events removed.
    async fn cleanup(&self, older_than_days: u32) -> Result<u64>;
}

// =============================================================================
// METRICS
// =============================================================================

/// Push-style metrics sink.
///
/// Notification methods are called inline after a write commits and must not
/// block.
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    fn name(&self) -> &str;

    fn on_task_event(&self, event: &TaskEvent);

    fn on_worker_event(&self, event: &WorkerEvent);

    fn update_stats(&self, stats: &TaskStats);

    /// Start serving metrics. Returns once the exporter is ready.
    async fn serve(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}
