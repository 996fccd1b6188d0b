//! Canonical events, materialized views, and derived query results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::schedule::ScheduleExpr;

// =============================================================================
// TASKS
// =============================================================================

/// Lifecycle state of a task as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Received,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
    Rejected,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        Self::Pending,
        Self::Received,
        Self::Started,
        Self::Retry,
        Self::Success,
        Self::Failure,
        Self::Revoked,
        Self::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Received => "received",
            Self::Started => "started",
            Self::Retry => "retry",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Revoked => "revoked",
            Self::Rejected => "rejected",
        }
    }

    /// Whether no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Revoked | Self::Rejected
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Accept both state names and the cluster's `task-<event>` spellings.
        let lowered = s.trim().to_lowercase();
        let name = lowered.strip_prefix("task-").unwrap_or(&lowered);
        match name {
            "pending" | "sent" => Ok(Self::Pending),
            "received" => Ok(Self::Received),
            "started" => Ok(Self::Started),
            "retry" | "retried" | "retrying" => Ok(Self::Retry),
            "success" | "succeeded" => Ok(Self::Success),
            "failure" | "failed" => Ok(Self::Failure),
            "revoked" => Ok(Self::Revoked),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid task state: {}", s)),
        }
    }
}

/// Immutable lifecycle fact for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub name: Option<String>,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
    pub worker: Option<String>,
    pub args: Option<String>,
    pub kwargs: Option<String>,
    pub result: Option<String>,
    pub runtime: Option<f64>,
    #[serde(default)]
    pub retries: Option<i64>,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub root_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl TaskEvent {
    pub fn new(task_id: impl Into<String>, state: TaskState, timestamp: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            name: None,
            state,
            timestamp,
            worker: None,
            args: None,
            kwargs: None,
            result: None,
            runtime: None,
            retries: None,
            exception: None,
            traceback: None,
            root_id: None,
            parent_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_args(mut self, args: impl Into<String>, kwargs: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self.kwargs = Some(kwargs.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_runtime(mut self, runtime: f64) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_exception(
        mut self,
        exception: impl Into<String>,
        traceback: Option<String>,
    ) -> Self {
        self.exception = Some(exception.into());
        self.traceback = traceback;
        self
    }

    /// Attach workflow lineage. Ingesting the event also records the
    /// `parent -> task` relation under `root_id`.
    pub fn with_lineage(mut self, root_id: impl Into<String>, parent_id: Option<String>) -> Self {
        self.root_id = Some(root_id.into());
        self.parent_id = parent_id;
        self
    }
}

/// Materialized per-task view folded from its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub name: Option<String>,
    pub state: TaskState,
    pub worker: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Timestamp of the event currently owning `state`.
    pub last_updated: DateTime<Utc>,
    pub runtime: Option<f64>,
    pub args: Option<String>,
    pub kwargs: Option<String>,
    pub result: Option<String>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub retries: Option<i64>,
    pub root_id: Option<String>,
    pub parent_id: Option<String>,
}

/// Kind of edge between two tasks of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Chain,
    Group,
    Chord,
    Callback,
    #[default]
    Child,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chain => "chain",
            Self::Group => "group",
            Self::Chord => "chord",
            Self::Callback => "callback",
            Self::Child => "child",
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chain" => Ok(Self::Chain),
            "group" => Ok(Self::Group),
            "chord" => Ok(Self::Chord),
            "callback" => Ok(Self::Callback),
            "child" => Ok(Self::Child),
            _ => Err(format!("Invalid relation kind: {}", s)),
        }
    }
}

/// Directed workflow edge. Storing the same edge twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRelation {
    pub root_id: String,
    pub parent_id: Option<String>,
    pub child_id: String,
    #[serde(default)]
    pub relation: RelationKind,
}

impl TaskRelation {
    pub fn new(
        root_id: impl Into<String>,
        parent_id: Option<String>,
        child_id: impl Into<String>,
    ) -> Self {
        Self {
            root_id: root_id.into(),
            parent_id,
            child_id: child_id.into(),
            relation: RelationKind::Child,
        }
    }

    pub fn with_kind(mut self, relation: RelationKind) -> Self {
        self.relation = relation;
        self
    }
}

// =============================================================================
// WORKERS
// =============================================================================

/// Kind of worker lifecycle event. Unknown kinds are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkerEventKind {
    Online,
    Offline,
    Heartbeat,
    Other(String),
}

impl WorkerEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Heartbeat => "heartbeat",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for WorkerEventKind {
    fn from(s: String) -> Self {
        let lowered = s.trim().to_lowercase();
        match lowered.strip_prefix("worker-").unwrap_or(&lowered) {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "heartbeat" => Self::Heartbeat,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for WorkerEventKind {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<WorkerEventKind> for String {
    fn from(kind: WorkerEventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for WorkerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable lifecycle fact for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub hostname: String,
    pub event: WorkerEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub info: Option<JsonValue>,
}

impl WorkerEvent {
    pub fn new(
        hostname: impl Into<String>,
        event: impl Into<WorkerEventKind>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            event: event.into(),
            timestamp,
            info: None,
        }
    }

    pub fn with_info(mut self, info: JsonValue) -> Self {
        self.info = Some(info);
        self
    }
}

/// Liveness of a worker as folded from its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    /// Status implied by an event kind. Anything but `offline` means the
    /// worker was alive to emit it.
    pub fn from_event(kind: &WorkerEventKind) -> Self {
        match kind {
            WorkerEventKind::Offline => Self::Offline,
            _ => Self::Online,
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("Invalid worker status: {}", s)),
        }
    }
}

/// Materialized per-hostname view folded from worker events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub hostname: String,
    pub status: WorkerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub info: Option<JsonValue>,
    pub pid: Option<i64>,
    pub active: Option<i64>,
    pub processed: Option<i64>,
}

/// Fleet summary over materialized workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub total: i64,
    pub online: i64,
    pub offline: i64,
}

// =============================================================================
// BROKER
// =============================================================================

/// Periodic queue-depth snapshot taken from a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerQueueEvent {
    pub broker_url: String,
    pub queue_name: String,
    pub depth: i64,
    #[serde(default)]
    pub consumers: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl BrokerQueueEvent {
    pub fn new(
        broker_url: impl Into<String>,
        queue_name: impl Into<String>,
        depth: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            broker_url: broker_url.into(),
            queue_name: queue_name.into(),
            depth,
            consumers: None,
            timestamp,
        }
    }
}

// =============================================================================
// SCHEDULES
// =============================================================================

/// Stored definition of a periodically fired task, owned by one app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub name: String,
    pub task: String,
    pub schedule: ScheduleExpr,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, JsonValue>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_run_count: i64,
    #[serde(default)]
    pub app: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Schedule {
    pub fn new(
        schedule_id: impl Into<String>,
        task: impl Into<String>,
        schedule: ScheduleExpr,
    ) -> Self {
        let schedule_id = schedule_id.into();
        Self {
            name: schedule_id.clone(),
            schedule_id,
            task: task.into(),
            schedule,
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            enabled: true,
            last_run_at: None,
            total_run_count: 0,
            app: None,
        }
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Parse positional args from user-edited JSON text. A single value is
    /// wrapped; empty or invalid text yields no args.
    pub fn parse_args(text: &str) -> Vec<JsonValue> {
        match serde_json::from_str::<JsonValue>(text.trim()) {
            Ok(JsonValue::Array(items)) => items,
            Ok(JsonValue::Null) | Err(_) => Vec::new(),
            Ok(other) => vec![other],
        }
    }

    /// Parse keyword args from user-edited JSON text. Anything but an
    /// object yields no kwargs.
    pub fn parse_kwargs(text: &str) -> serde_json::Map<String, JsonValue> {
        match serde_json::from_str::<JsonValue>(text.trim()) {
            Ok(JsonValue::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

// =============================================================================
// QUERIES
// =============================================================================

/// Half-open time window `[start, end)`; either side may be unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }
}

/// Filter over materialized tasks. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub name: Option<String>,
    pub state: Option<TaskState>,
    pub worker: Option<String>,
    /// Substring match on task id, name, args and kwargs.
    pub search: Option<String>,
    /// Window applied to `last_updated`.
    pub time_range: Option<TimeRange>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }
}

/// Column a task page is ordered by. `task_id` is always appended as the
/// final tie-breaker so page boundaries are stable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSortKey {
    #[default]
    LastUpdated,
    Name,
    State,
    Worker,
    Runtime,
    ReceivedAt,
    TaskId,
}

impl std::str::FromStr for TaskSortKey {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "last_updated" | "timestamp" => Ok(Self::LastUpdated),
            "name" => Ok(Self::Name),
            "state" => Ok(Self::State),
            "worker" => Ok(Self::Worker),
            "runtime" => Ok(Self::Runtime),
            "received_at" | "received" => Ok(Self::ReceivedAt),
            "task_id" | "id" => Ok(Self::TaskId),
            _ => Err(format!("Invalid sort key: {}", s)),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    #[default]
    Desc,
}

impl std::str::FromStr for SortDir {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(format!("Invalid sort direction: {}", s)),
        }
    }
}

/// Request for one bounded page of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPageRequest {
    #[serde(default)]
    pub filter: TaskFilter,
    #[serde(default)]
    pub sort_key: TaskSortKey,
    #[serde(default)]
    pub sort_dir: SortDir,
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl Default for TaskPageRequest {
    fn default() -> Self {
        Self {
            filter: TaskFilter::default(),
            sort_key: TaskSortKey::default(),
            sort_dir: SortDir::default(),
            limit: crate::defaults::PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// One page of tasks plus the full match count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: i64,
}

/// Runtime statistics over completed tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub count: i64,
    pub min_runtime: Option<f64>,
    pub max_runtime: Option<f64>,
    pub avg_runtime: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Completed-task count for one fixed-width slice of a time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputBucket {
    pub bucket_start: DateTime<Utc>,
    pub count: i64,
}

/// Task counts keyed by state name.
pub type StateDistribution = BTreeMap<String, i64>;

/// Completion counts, 7 rows (Monday..Sunday) by 24 columns (UTC hour).
pub type Heatmap = Vec<Vec<i64>>;
