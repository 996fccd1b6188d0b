//! Wire messages and server-side dispatch.
//!
//! A request names one [`EventStore`] operation and its arguments:
//!
//! ```json
//! {"id": 7, "token": "s3cret", "call": {"op": "get_task", "args": {"task_id": "t1"}}}
//! ```
//!
//! and the response echoes the id with either a reply or an error:
//!
//! ```json
//! {"id": 7, "outcome": {"ok": {"type": "task", "value": null}}}
//! {"id": 7, "outcome": {"err": {"kind": "auth_failed", "message": "Authentication failed"}}}
//! ```
//!
//! Id `0` is reserved for connection-level errors that cannot be attributed
//! to a request, such as a frame that was refused before its body was read.

use serde::{Deserialize, Serialize};

use taskroot_core::{
    BrokerQueueEvent, Error, ErrorKind, EventStore, Heatmap, Result, Schedule, StateDistribution,
    Task, TaskEvent, TaskFilter, TaskPage, TaskPageRequest, TaskRelation, TaskStats,
    ThroughputBucket, TimeRange, Worker, WorkerEvent, WorkerStats,
};

/// Request id used for errors not tied to any request.
pub const CONNECTION_ERROR_ID: u64 = 0;

/// One event-store operation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum StoreCall {
    Initialize,
    EnsureSchema,
    GetSchemaVersion,
    Migrate {
        from_version: i64,
        to_version: i64,
    },
    StoreTaskEvent {
        event: TaskEvent,
    },
    GetTasks {
        #[serde(default)]
        filter: TaskFilter,
    },
    GetTasksPage {
        request: TaskPageRequest,
    },
    ListTaskNames,
    GetTask {
        task_id: String,
    },
    StoreTaskRelation {
        relation: TaskRelation,
    },
    GetTaskRelations {
        root_id: String,
    },
    StoreWorkerEvent {
        event: WorkerEvent,
    },
    GetWorkers,
    GetWorker {
        hostname: String,
    },
    GetWorkerEventSnapshot {
        hostname: String,
    },
    GetWorkerStats,
    StoreBrokerQueueEvent {
        event: BrokerQueueEvent,
    },
    GetBrokerQueueSnapshot {
        broker_url: String,
    },
    GetTaskStats {
        #[serde(default)]
        task_name: Option<String>,
        #[serde(default)]
        time_range: Option<TimeRange>,
    },
    GetThroughput {
        time_range: TimeRange,
        bucket_seconds: i64,
    },
    GetStateDistribution,
    GetHeatmap {
        #[serde(default)]
        time_range: Option<TimeRange>,
    },
    GetSchedules,
    StoreSchedule {
        schedule: Schedule,
    },
    DeleteSchedule {
        schedule_id: String,
        #[serde(default)]
        app: Option<String>,
    },
    Cleanup {
        older_than_days: u32,
    },
}

impl StoreCall {
    /// Operation name as it appears on the wire.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::EnsureSchema => "ensure_schema",
            Self::GetSchemaVersion => "get_schema_version",
            Self::Migrate { .. } => "migrate",
            Self::StoreTaskEvent { .. } => "store_task_event",
            Self::GetTasks { .. } => "get_tasks",
            Self::GetTasksPage { .. } => "get_tasks_page",
            Self::ListTaskNames => "list_task_names",
            Self::GetTask { .. } => "get_task",
            Self::StoreTaskRelation { .. } => "store_task_relation",
            Self::GetTaskRelations { .. } => "get_task_relations",
            Self::StoreWorkerEvent { .. } => "store_worker_event",
            Self::GetWorkers => "get_workers",
            Self::GetWorker { .. } => "get_worker",
            Self::GetWorkerEventSnapshot { .. } => "get_worker_event_snapshot",
            Self::GetWorkerStats => "get_worker_stats",
            Self::StoreBrokerQueueEvent { .. } => "store_broker_queue_event",
            Self::GetBrokerQueueSnapshot { .. } => "get_broker_queue_snapshot",
            Self::GetTaskStats { .. } => "get_task_stats",
            Self::GetThroughput { .. } => "get_throughput",
            Self::GetStateDistribution => "get_state_distribution",
            Self::GetHeatmap { .. } => "get_heatmap",
            Self::GetSchedules => "get_schedules",
            Self::StoreSchedule { .. } => "store_schedule",
            Self::DeleteSchedule { .. } => "delete_schedule",
            Self::Cleanup { .. } => "cleanup",
        }
    }
}

/// Successful result of a [`StoreCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoreReply {
    Unit,
    Version(i64),
    Tasks(Vec<Task>),
    TaskPage(TaskPage),
    Names(Vec<String>),
    Task(Option<Task>),
    Relations(Vec<TaskRelation>),
    Workers(Vec<Worker>),
    Worker(Option<Worker>),
    WorkerEvent(Option<WorkerEvent>),
    WorkerStats(WorkerStats),
    BrokerQueues(Vec<BrokerQueueEvent>),
    TaskStats(TaskStats),
    Throughput(Vec<ThroughputBucket>),
    StateDistribution(StateDistribution),
    Heatmap(Heatmap),
    Schedules(Vec<Schedule>),
    Deleted(u64),
}

impl StoreReply {
    /// Variant name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Version(_) => "version",
            Self::Tasks(_) => "tasks",
            Self::TaskPage(_) => "task_page",
            Self::Names(_) => "names",
            Self::Task(_) => "task",
            Self::Relations(_) => "relations",
            Self::Workers(_) => "workers",
            Self::Worker(_) => "worker",
            Self::WorkerEvent(_) => "worker_event",
            Self::WorkerStats(_) => "worker_stats",
            Self::BrokerQueues(_) => "broker_queues",
            Self::TaskStats(_) => "task_stats",
            Self::Throughput(_) => "throughput",
            Self::StateDistribution(_) => "state_distribution",
            Self::Heatmap(_) => "heatmap",
            Self::Schedules(_) => "schedules",
            Self::Deleted(_) => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub call: StoreCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub outcome: Outcome,
}

impl RpcResponse {
    pub fn ok(id: u64, reply: StoreReply) -> Self {
        Self {
            id,
            outcome: Outcome::Ok(reply),
        }
    }

    pub fn err(id: u64, error: &Error) -> Self {
        Self {
            id,
            outcome: Outcome::Err(RemoteError::from_error(error)),
        }
    }

    pub fn from_result(id: u64, result: Result<StoreReply>) -> Self {
        match result {
            Ok(reply) => Self::ok(id, reply),
            Err(e) => Self::err(id, &e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(StoreReply),
    Err(RemoteError),
}

impl Outcome {
    pub fn into_result(self) -> Result<StoreReply> {
        match self {
            Self::Ok(reply) => Ok(reply),
            Self::Err(remote) => Err(remote.into_error()),
        }
    }
}

/// Error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
}

impl RemoteError {
    pub fn from_error(error: &Error) -> Self {
        let (size, max) = match error {
            Error::FrameTooLarge { size, max } => (Some(*size), Some(*max)),
            _ => (None, None),
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            size,
            max,
        }
    }

    /// Rebuild a local error. Transport errors the caller branches on keep
    /// their own variants; everything else arrives as [`Error::Remote`].
    pub fn into_error(self) -> Error {
        match (self.kind, self.size, self.max) {
            (ErrorKind::AuthFailed, _, _) => Error::AuthFailed,
            (ErrorKind::FrameTooLarge, Some(size), Some(max)) => Error::FrameTooLarge { size, max },
            (kind, _, _) => Error::Remote {
                kind,
                message: self.message,
            },
        }
    }
}

/// Run one call against the store.
pub async fn dispatch(store: &dyn EventStore, call: StoreCall) -> Result<StoreReply> {
    let reply = match call {
        StoreCall::Initialize => {
            store.initialize().await?;
            StoreReply::Unit
        }
        StoreCall::EnsureSchema => {
            store.ensure_schema().await?;
            StoreReply::Unit
        }
        StoreCall::GetSchemaVersion => StoreReply::Version(store.get_schema_version().await?),
        StoreCall::Migrate {
            from_version,
            to_version,
        } => {
            store.migrate(from_version, to_version).await?;
            StoreReply::Unit
        }
        StoreCall::StoreTaskEvent { event } => {
            store.store_task_event(event).await?;
            StoreReply::Unit
        }
        StoreCall::GetTasks { filter } => StoreReply::Tasks(store.get_tasks(filter).await?),
        StoreCall::GetTasksPage { request } => {
            StoreReply::TaskPage(store.get_tasks_page(request).await?)
        }
        StoreCall::ListTaskNames => StoreReply::Names(store.list_task_names().await?),
        StoreCall::GetTask { task_id } => StoreReply::Task(store.get_task(&task_id).await?),
        StoreCall::StoreTaskRelation { relation } => {
            store.store_task_relation(relation).await?;
            StoreReply::Unit
        }
        StoreCall::GetTaskRelations { root_id } => {
            StoreReply::Relations(store.get_task_relations(&root_id).await?)
        }
        StoreCall::StoreWorkerEvent { event } => {
            store.store_worker_event(event).await?;
            StoreReply::Unit
        }
        StoreCall::GetWorkers => StoreReply::Workers(store.get_workers().await?),
        StoreCall::GetWorker { hostname } => StoreReply::Worker(store.get_worker(&hostname).await?),
        StoreCall::GetWorkerEventSnapshot { hostname } => {
            StoreReply::WorkerEvent(store.get_worker_event_snapshot(&hostname).await?)
        }
        StoreCall::GetWorkerStats => StoreReply::WorkerStats(store.get_worker_stats().await?),
        StoreCall::StoreBrokerQueueEvent { event } => {
            store.store_broker_queue_event(event).await?;
            StoreReply::Unit
        }
        StoreCall::GetBrokerQueueSnapshot { broker_url } => {
            StoreReply::BrokerQueues(store.get_broker_queue_snapshot(&broker_url).await?)
        }
        StoreCall::GetTaskStats {
            task_name,
            time_range,
        } => StoreReply::TaskStats(
            store
                .get_task_stats(task_name.as_deref(), time_range)
                .await?,
        ),
        StoreCall::GetThroughput {
            time_range,
            bucket_seconds,
        } => StoreReply::Throughput(store.get_throughput(time_range, bucket_seconds).await?),
        StoreCall::GetStateDistribution => {
            StoreReply::StateDistribution(store.get_state_distribution().await?)
        }
        StoreCall::GetHeatmap { time_range } => {
            StoreReply::Heatmap(store.get_heatmap(time_range).await?)
        }
        StoreCall::GetSchedules => StoreReply::Schedules(store.get_schedules().await?),
        StoreCall::StoreSchedule { schedule } => {
            store.store_schedule(schedule).await?;
            StoreReply::Unit
        }
        StoreCall::DeleteSchedule { schedule_id, app } => {
            store.delete_schedule(&schedule_id, app.as_deref()).await?;
            StoreReply::Unit
        }
        StoreCall::Cleanup { older_than_days } => {
            StoreReply::Deleted(store.cleanup(older_than_days).await?)
        }
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_shape() {
        let request = RpcRequest {
            id: 3,
            token: None,
            call: StoreCall::GetTask {
                task_id: "t1".to_string(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"id": 3, "call": {"op": "get_task", "args": {"task_id": "t1"}}})
        );
        assert_eq!(request.call.op_name(), "get_task");
    }

    #[test]
    fn test_unit_call_has_no_args() {
        let value = serde_json::to_value(StoreCall::ListTaskNames).unwrap();
        assert_eq!(value, json!({"op": "list_task_names"}));
        let back: StoreCall = serde_json::from_value(value).unwrap();
        assert_eq!(back, StoreCall::ListTaskNames);
    }

    #[test]
    fn test_optional_args_may_be_omitted() {
        let call: StoreCall =
            serde_json::from_value(json!({"op": "get_task_stats", "args": {}})).unwrap();
        assert_eq!(
            call,
            StoreCall::GetTaskStats {
                task_name: None,
                time_range: None
            }
        );
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let result: std::result::Result<StoreCall, _> =
            serde_json::from_value(json!({"op": "drop_everything"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_error_outcome_wire_shape() {
        let response = RpcResponse::err(9, &Error::FrameTooLarge { size: 10, max: 4 });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], 9);
        assert_eq!(value["outcome"]["err"]["kind"], "frame_too_large");
        assert_eq!(value["outcome"]["err"]["size"], 10);
    }

    #[test]
    fn test_remote_error_restores_transport_variants() {
        let auth = RemoteError::from_error(&Error::AuthFailed).into_error();
        assert!(matches!(auth, Error::AuthFailed));

        let frame = RemoteError::from_error(&Error::FrameTooLarge { size: 10, max: 4 }).into_error();
        assert!(matches!(frame, Error::FrameTooLarge { size: 10, max: 4 }));

        let other = RemoteError::from_error(&Error::InvalidInput("bad".into())).into_error();
        match other {
            Error::Remote { kind, message } => {
                assert_eq!(kind, ErrorKind::InvalidInput);
                assert!(message.contains("bad"));
            }
            e => panic!("Expected Remote error, got {:?}", e),
        }
    }
}
