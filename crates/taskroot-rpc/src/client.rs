//! RPC client implementing [`EventStore`] over one multiplexed connection.
//!
//! Calls may be issued concurrently from any number of tasks. A writer task
//! owns the write half; a reader task routes each response to its waiting
//! caller by request id. A call that exceeds the configured timeout stops
//! waiting and reports [`Error::Timeout`]; the server still completes it and
//! the late response is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use taskroot_core::{
    BrokerQueueEvent, Error, EventStore, Heatmap, Result, RpcConfig, RpcEndpoint, Schedule,
    StateDistribution, Task, TaskEvent, TaskFilter, TaskPage, TaskPageRequest, TaskRelation,
    TaskStats, ThroughputBucket, TimeRange, Worker, WorkerEvent, WorkerStats,
};

use crate::frame;
use crate::protocol::{RpcRequest, RpcResponse, StoreCall, StoreReply, CONNECTION_ERROR_ID};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<StoreReply>>>>>;

/// Event store reached over RPC.
pub struct RpcClient {
    endpoint: RpcEndpoint,
    token: Option<String>,
    timeout: Duration,
    max_message_bytes: usize,
    next_id: AtomicU64,
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcClient {
    /// Connect to the endpoint described by `config`.
    pub async fn connect(config: &RpcConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        Self::connect_to(endpoint, config).await
    }

    /// Connect to an explicit endpoint, taking limits and auth from `config`.
    pub async fn connect_to(endpoint: RpcEndpoint, config: &RpcConfig) -> Result<Self> {
        let timeout = config.timeout();
        let connecting = async {
            match &endpoint {
                RpcEndpoint::Tcp { host, port } => {
                    let stream = TcpStream::connect((host.as_str(), *port)).await?;
                    let _ = stream.set_nodelay(true);
                    Ok::<_, Error>(Self::start(stream, &endpoint, config))
                }
                #[cfg(unix)]
                RpcEndpoint::Unix(path) => {
                    let stream = UnixStream::connect(path).await?;
                    Ok(Self::start(stream, &endpoint, config))
                }
                #[cfg(not(unix))]
                RpcEndpoint::Unix(_) => Err(Error::Config(
                    "unix socket transport is not available on this platform".into(),
                )),
            }
        };
        let client = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        debug!(subsystem = "rpc", component = "client", endpoint = %endpoint, "Connected");
        Ok(client)
    }

    fn start<S>(stream: S, endpoint: &RpcEndpoint, config: &RpcConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::channel(config.max_inflight.max(1));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_requests(
            write_half,
            outgoing_rx,
            config.max_message_bytes,
        ));
        let reader = tokio::spawn(read_responses(
            read_half,
            pending.clone(),
            closed.clone(),
            config.max_message_bytes,
        ));

        Self {
            endpoint: endpoint.clone(),
            token: config.auth_token().map(str::to_string),
            timeout: config.timeout(),
            max_message_bytes: config.max_message_bytes,
            next_id: AtomicU64::new(CONNECTION_ERROR_ID + 1),
            outgoing,
            pending,
            closed,
            reader,
            writer,
        }
    }

    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue one call and wait for its reply.
    pub async fn call(&self, call: StoreCall) -> Result<StoreReply> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(format!(
                "connection to {} is closed",
                self.endpoint
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let op = call.op_name();
        let request = RpcRequest {
            id,
            token: self.token.clone(),
            call,
        };
        let payload = serde_json::to_vec(&request)?;
        if payload.len() > self.max_message_bytes {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                max: self.max_message_bytes,
            });
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let exchange = async {
            self.outgoing
                .send(payload)
                .await
                .map_err(|_| Error::ConnectionClosed("request writer stopped".to_string()))?;
            rx.await
                .map_err(|_| Error::ConnectionClosed("connection closed before reply".to_string()))?
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => {
                trace!(subsystem = "rpc", component = "client", op, request_id = id, "Call returned");
                result
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                debug!(
                    subsystem = "rpc",
                    component = "client",
                    op,
                    request_id = id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Call timed out"
                );
                Err(Error::Timeout(self.timeout))
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn write_requests<S>(
    mut writer: WriteHalf<S>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    max_message_bytes: usize,
) where
    S: AsyncRead + AsyncWrite,
{
    while let Some(payload) = rx.recv().await {
        if let Err(e) = frame::write_frame(&mut writer, &payload, max_message_bytes).await {
            debug!(subsystem = "rpc", component = "client", error = %e, "Connection write failed");
            break;
        }
    }
}

async fn read_responses<S>(
    mut reader: ReadHalf<S>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    max_message_bytes: usize,
) where
    S: AsyncRead + AsyncWrite,
{
    let reason = loop {
        let body = match frame::read_frame(&mut reader, max_message_bytes).await {
            Ok(Some(body)) => body,
            Ok(None) => break Error::ConnectionClosed("server closed the connection".to_string()),
            Err(e) => break e,
        };
        let response: RpcResponse = match serde_json::from_slice(&body) {
            Ok(response) => response,
            Err(e) => break Error::from(e),
        };

        if response.id == CONNECTION_ERROR_ID {
            let err = response.outcome.into_result().err().unwrap_or_else(|| {
                Error::Internal("connection-level reply without an error".to_string())
            });
            warn!(subsystem = "rpc", component = "client", error = %err, "Connection rejected by server");
            break err;
        }

        match pending.lock().await.remove(&response.id) {
            Some(waiter) => {
                let _ = waiter.send(response.outcome.into_result());
            }
            None => {
                trace!(
                    subsystem = "rpc",
                    component = "client",
                    request_id = response.id,
                    "Discarding reply for abandoned call"
                );
            }
        }
    };

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending, &reason).await;
}

/// Resolve every waiting call with a copy of `reason`.
async fn fail_pending(pending: &Pending, reason: &Error) {
    let waiters: Vec<_> = pending.lock().await.drain().collect();
    for (_, waiter) in waiters {
        let err = match reason {
            Error::FrameTooLarge { size, max } => Error::FrameTooLarge {
                size: *size,
                max: *max,
            },
            Error::AuthFailed => Error::AuthFailed,
            other => Error::ConnectionClosed(other.to_string()),
        };
        let _ = waiter.send(Err(err));
    }
}

fn unexpected(op: &str, reply: StoreReply) -> Error {
    Error::Internal(format!(
        "unexpected '{}' reply to {}",
        reply.type_name(),
        op
    ))
}

macro_rules! expect_reply {
    ($reply:expr, $op:literal, StoreReply::Unit) => {
        match $reply {
            StoreReply::Unit => Ok(()),
            other => Err(unexpected($op, other)),
        }
    };
    ($reply:expr, $op:literal, $variant:path) => {
        match $reply {
            $variant(value) => Ok(value),
            other => Err(unexpected($op, other)),
        }
    };
}

#[async_trait]
impl EventStore for RpcClient {
    async fn initialize(&self) -> Result<()> {
        let reply = self.call(StoreCall::Initialize).await?;
        expect_reply!(reply, "initialize", StoreReply::Unit)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let reply = self.call(StoreCall::EnsureSchema).await?;
        expect_reply!(reply, "ensure_schema", StoreReply::Unit)
    }

    async fn get_schema_version(&self) -> Result<i64> {
        let reply = self.call(StoreCall::GetSchemaVersion).await?;
        expect_reply!(reply, "get_schema_version", StoreReply::Version)
    }

    async fn migrate(&self, from_version: i64, to_version: i64) -> Result<()> {
        let reply = self
            .call(StoreCall::Migrate {
                from_version,
                to_version,
            })
            .await?;
        expect_reply!(reply, "migrate", StoreReply::Unit)
    }

    /// Closes this client's connection only. The owning process decides
    /// when the store itself closes.
    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.writer.abort();
            self.reader.abort();
            fail_pending(
                &self.pending,
                &Error::ConnectionClosed("client closed".to_string()),
            )
            .await;
            debug!(subsystem = "rpc", component = "client", endpoint = %self.endpoint, "Closed");
        }
        Ok(())
    }

    async fn store_task_event(&self, event: TaskEvent) -> Result<()> {
        let reply = self.call(StoreCall::StoreTaskEvent { event }).await?;
        expect_reply!(reply, "store_task_event", StoreReply::Unit)
    }

    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let reply = self.call(StoreCall::GetTasks { filter }).await?;
        expect_reply!(reply, "get_tasks", StoreReply::Tasks)
    }

    async fn get_tasks_page(&self, request: TaskPageRequest) -> Result<TaskPage> {
        let reply = self.call(StoreCall::GetTasksPage { request }).await?;
        expect_reply!(reply, "get_tasks_page", StoreReply::TaskPage)
    }

    async fn list_task_names(&self) -> Result<Vec<String>> {
        let reply = self.call(StoreCall::ListTaskNames).await?;
        expect_reply!(reply, "list_task_names", StoreReply::Names)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let reply = self
            .call(StoreCall::GetTask {
                task_id: task_id.to_string(),
            })
            .await?;
        expect_reply!(reply, "get_task", StoreReply::Task)
    }

    async fn store_task_relation(&self, relation: TaskRelation) -> Result<()> {
        let reply = self.call(StoreCall::StoreTaskRelation { relation }).await?;
        expect_reply!(reply, "store_task_relation", StoreReply::Unit)
    }

    async fn get_task_relations(&self, root_id: &str) -> Result<Vec<TaskRelation>> {
        let reply = self
            .call(StoreCall::GetTaskRelations {
                root_id: root_id.to_string(),
            })
            .await?;
        expect_reply!(reply, "get_task_relations", StoreReply::Relations)
    }

    async fn store_worker_event(&self, event: WorkerEvent) -> Result<()> {
        let reply = self.call(StoreCall::StoreWorkerEvent { event }).await?;
        expect_reply!(reply, "store_worker_event", StoreReply::Unit)
    }

    async fn get_workers(&self) -> Result<Vec<Worker>> {
        let reply = self.call(StoreCall::GetWorkers).await?;
        expect_reply!(reply, "get_workers", StoreReply::Workers)
    }

    async fn get_worker(&self, hostname: &str) -> Result<Option<Worker>> {
        let reply = self
            .call(StoreCall::GetWorker {
                hostname: hostname.to_string(),
            })
            .await?;
        expect_reply!(reply, "get_worker", StoreReply::Worker)
    }

    async fn get_worker_event_snapshot(&self, hostname: &str) -> Result<Option<WorkerEvent>> {
        let reply = self
            .call(StoreCall::GetWorkerEventSnapshot {
                hostname: hostname.to_string(),
            })
            .await?;
        expect_reply!(reply, "get_worker_event_snapshot", StoreReply::WorkerEvent)
    }

    async fn get_worker_stats(&self) -> Result<WorkerStats> {
        let reply = self.call(StoreCall::GetWorkerStats).await?;
        expect_reply!(reply, "get_worker_stats", StoreReply::WorkerStats)
    }

    async fn store_broker_queue_event(&self, event: BrokerQueueEvent) -> Result<()> {
        let reply = self.call(StoreCall::StoreBrokerQueueEvent { event }).await?;
        expect_reply!(reply, "store_broker_queue_event", StoreReply::Unit)
    }

    async fn get_broker_queue_snapshot(&self, broker_url: &str) -> Result<Vec<BrokerQueueEvent>> {
        let reply = self
            .call(StoreCall::GetBrokerQueueSnapshot {
                broker_url: broker_url.to_string(),
            })
            .await?;
        expect_reply!(reply, "get_broker_queue_snapshot", StoreReply::BrokerQueues)
    }

    async fn get_task_stats(
        &self,
        task_name: Option<&str>,
        time_range: Option<TimeRange>,
    ) -> Result<TaskStats> {
        let reply = self
            .call(StoreCall::GetTaskStats {
                task_name: task_name.map(str::to_string),
                time_range,
            })
            .await?;
        expect_reply!(reply, "get_task_stats", StoreReply::TaskStats)
    }

    async fn get_throughput(
        &self,
        time_range: TimeRange,
        bucket_seconds: i64,
    ) -> Result<Vec<ThroughputBucket>> {
        let reply = self
            .call(StoreCall::GetThroughput {
                time_range,
                bucket_seconds,
            })
            .await?;
        expect_reply!(reply, "get_throughput", StoreReply::Throughput)
    }

    async fn get_state_distribution(&self) -> Result<StateDistribution> {
        let reply = self.call(StoreCall::GetStateDistribution).await?;
        expect_reply!(reply, "get_state_distribution", StoreReply::StateDistribution)
    }

    async fn get_heatmap(&self, time_range: Option<TimeRange>) -> Result<Heatmap> {
        let reply = self.call(StoreCall::GetHeatmap { time_range }).await?;
        expect_reply!(reply, "get_heatmap", StoreReply::Heatmap)
    }

    async fn get_schedules(&self) -> Result<Vec<Schedule>> {
        let reply = self.call(StoreCall::GetSchedules).await?;
        expect_reply!(reply, "get_schedules", StoreReply::Schedules)
    }

    async fn store_schedule(&self, schedule: Schedule) -> Result<()> {
        let reply = self.call(StoreCall::StoreSchedule { schedule }).await?;
        expect_reply!(reply, "store_schedule", StoreReply::Unit)
    }

    async fn delete_schedule(&self, schedule_id: &str, app: Option<&str>) -> Result<()> {
        let reply = self
            .call(StoreCall::DeleteSchedule {
                schedule_id: schedule_id.to_string(),
                app: app.map(str::to_string),
            })
            .await?;
        expect_reply!(reply, "delete_schedule", StoreReply::Unit)
    }

    async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        let reply = self.call(StoreCall::Cleanup { older_than_days }).await?;
        expect_reply!(reply, "cleanup", StoreReply::Deleted)
    }
}
