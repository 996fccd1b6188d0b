//! Tests for the RPC server's admission rules and the client's contract.
//!
//! This test suite validates:
//! - Oversized frames are refused before the store sees them, both when the
//!   client refuses locally and when only the server's limit is exceeded
//! - Requests beyond the in-flight limit are delayed, never failed
//! - Bad or missing tokens are rejected when an auth key is configured
//! - Client timeouts abandon the wait but not the server-side work
//! - Store operations behave the same over the wire as in process
//! - A store call that panics still answers with an internal error

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use taskroot_core::{
    BrokerQueueEvent, Error, ErrorKind, EventStore, Heatmap, Result, RpcConfig, RpcEndpoint,
    Schedule, ScheduleExpr, StateDistribution, Task, TaskEvent, TaskFilter, TaskPage,
    TaskPageRequest, TaskRelation, TaskState, TaskStats, ThroughputBucket, TimeRange, Worker,
    WorkerEvent, WorkerStats,
};
use taskroot_db::{SqliteStore, CURRENT_SCHEMA_VERSION};
use taskroot_rpc::{read_frame, Outcome, RpcClient, RpcResponse, RpcServer, RpcServerHandle};

/// Retention value on which [`InstrumentedStore::cleanup`] panics.
const PANICKING_RETENTION: u32 = u32::MAX;

/// Store wrapper that counts dispatched calls, tracks concurrency and can
/// slow every call down.
struct InstrumentedStore {
    inner: SqliteStore,
    delay: Duration,
    calls: AtomicUsize,
    inflight: AtomicUsize,
    peak: AtomicUsize,
}

impl InstrumentedStore {
    async fn new(delay: Duration) -> Self {
        let inner = SqliteStore::open_in_memory()
            .await
            .expect("Failed to open store");
        inner.initialize().await.expect("Failed to initialize store");
        Self {
            inner,
            delay,
            calls: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    async fn track<T>(&self, fut: impl Future<Output = T>) -> T {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = fut.await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for InstrumentedStore {
    async fn initialize(&self) -> Result<()> {
        self.track(self.inner.initialize()).await
    }
    async fn ensure_schema(&self) -> Result<()> {
        self.track(self.inner.ensure_schema()).await
    }
    async fn get_schema_version(&self) -> Result<i64> {
        self.track(self.inner.get_schema_version()).await
    }
    async fn migrate(&self, from_version: i64, to_version: i64) -> Result<()> {
        self.track(self.inner.migrate(from_version, to_version)).await
    }
    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
    async fn store_task_event(&self, event: TaskEvent) -> Result<()> {
        self.track(self.inner.store_task_event(event)).await
    }
    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.track(self.inner.get_tasks(filter)).await
    }
    async fn get_tasks_page(&self, request: TaskPageRequest) -> Result<TaskPage> {
        self.track(self.inner.get_tasks_page(request)).await
    }
    async fn list_task_names(&self) -> Result<Vec<String>> {
        self.track(self.inner.list_task_names()).await
    }
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.track(self.inner.get_task(task_id)).await
    }
    async fn store_task_relation(&self, relation: TaskRelation) -> Result<()> {
        self.track(self.inner.store_task_relation(relation)).await
    }
    async fn get_task_relations(&self, root_id: &str) -> Result<Vec<TaskRelation>> {
        self.track(self.inner.get_task_relations(root_id)).await
    }
    async fn store_worker_event(&self, event: WorkerEvent) -> Result<()> {
        self.track(self.inner.store_worker_event(event)).await
    }
    async fn get_workers(&self) -> Result<Vec<Worker>> {
        self.track(self.inner.get_workers()).await
    }
    async fn get_worker(&self, hostname: &str) -> Result<Option<Worker>> {
        self.track(self.inner.get_worker(hostname)).await
    }
    async fn get_worker_event_snapshot(&self, hostname: &str) -> Result<Option<WorkerEvent>> {
        self.track(self.inner.get_worker_event_snapshot(hostname)).await
    }
    async fn get_worker_stats(&self) -> Result<WorkerStats> {
        self.track(self.inner.get_worker_stats()).await
    }
    async fn store_broker_queue_event(&self, event: BrokerQueueEvent) -> Result<()> {
        self.track(self.inner.store_broker_queue_event(event)).await
    }
    async fn get_broker_queue_snapshot(&self, broker_url: &str) -> Result<Vec<BrokerQueueEvent>> {
        self.track(self.inner.get_broker_queue_snapshot(broker_url)).await
    }
    async fn get_task_stats(
        &self,
        task_name: Option<&str>,
        time_range: Option<TimeRange>,
    ) -> Result<TaskStats> {
        self.track(self.inner.get_task_stats(task_name, time_range)).await
    }
    async fn get_throughput(
        &self,
        time_range: TimeRange,
        bucket_seconds: i64,
    ) -> Result<Vec<ThroughputBucket>> {
        self.track(self.inner.get_throughput(time_range, bucket_seconds))
            .await
    }
    async fn get_state_distribution(&self) -> Result<StateDistribution> {
        self.track(self.inner.get_state_distribution()).await
    }
    async fn get_heatmap(&self, time_range: Option<TimeRange>) -> Result<Heatmap> {
        self.track(self.inner.get_heatmap(time_range)).await
    }
    async fn get_schedules(&self) -> Result<Vec<Schedule>> {
        self.track(self.inner.get_schedules()).await
    }
    async fn store_schedule(&self, schedule: Schedule) -> Result<()> {
        self.track(self.inner.store_schedule(schedule)).await
    }
    async fn delete_schedule(&self, schedule_id: &str, app: Option<&str>) -> Result<()> {
        self.track(self.inner.delete_schedule(schedule_id, app)).await
    }
    async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        if older_than_days == PANICKING_RETENTION {
            panic!("store failure");
        }
        self.track(self.inner.cleanup(older_than_days)).await
    }
}

async fn serve(store: Arc<InstrumentedStore>, config: RpcConfig) -> RpcServerHandle {
    RpcServer::new(store, config)
        .serve()
        .await
        .expect("Failed to start RPC server")
}

/// Client settings pointing at a running TCP server.
fn client_config(handle: &RpcServerHandle) -> RpcConfig {
    match handle.endpoint() {
        RpcEndpoint::Tcp { host, port } => RpcConfig::tcp(host.clone(), *port),
        RpcEndpoint::Unix(path) => RpcConfig::unix(path.clone()),
    }
}

fn local_tcp() -> RpcConfig {
    RpcConfig::tcp("127.0.0.1", 0)
}

fn port_of(handle: &RpcServerHandle) -> u16 {
    match handle.endpoint() {
        RpcEndpoint::Tcp { port, .. } => *port,
        other => panic!("Expected TCP endpoint, got {}", other),
    }
}

#[tokio::test]
async fn test_oversized_frame_is_rejected_before_dispatch() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO).await);
    let handle = serve(store.clone(), local_tcp().with_max_message_bytes(1024)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port_of(&handle)))
        .await
        .unwrap();
    // Header only; the server must answer without waiting for a body.
    stream.write_all(&1025u32.to_be_bytes()).await.unwrap();

    let body = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream, 1 << 20))
        .await
        .expect("no reply to oversized frame")
        .unwrap()
        .expect("connection closed without a reply");
    let response: RpcResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.id, 0);
    match response.outcome {
        Outcome::Err(e) => {
            assert_eq!(e.kind, ErrorKind::FrameTooLarge);
            assert_eq!(e.size, Some(1025));
            assert_eq!(e.max, Some(1024));
        }
        other => panic!("Expected error outcome, got {:?}", other),
    }

    // and then the connection is closed
    let next = read_frame(&mut stream, 1 << 20).await.unwrap();
    assert!(next.is_none());
    assert_eq!(store.calls(), 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_request_through_client() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO).await);
    let handle = serve(store.clone(), local_tcp().with_max_message_bytes(2048)).await;
    let big = TaskEvent::new("big", TaskState::Received, Utc::now()).with_args("x".repeat(10_000), "{}");

    // server limit below the client's
    let client = RpcClient::connect(&client_config(&handle)).await.unwrap();
    let err = client.store_task_event(big.clone()).await.unwrap_err();
    assert!(
        matches!(err, Error::FrameTooLarge { max: 2048, .. }),
        "got {:?}",
        err
    );

    // client limit refuses locally
    let strict = RpcClient::connect(&client_config(&handle).with_max_message_bytes(1024))
        .await
        .unwrap();
    let err = strict.store_task_event(big).await.unwrap_err();
    assert!(
        matches!(err, Error::FrameTooLarge { max: 1024, .. }),
        "got {:?}",
        err
    );

    assert_eq!(store.calls(), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backpressure_delays_rather_than_fails() {
    let delay = Duration::from_millis(100);
    let store = Arc::new(InstrumentedStore::new(delay).await);
    let handle = serve(store.clone(), local_tcp().with_max_inflight(1)).await;

    let config = client_config(&handle).with_timeout_seconds(10.0);
    let first = RpcClient::connect(&config).await.unwrap();
    let second = RpcClient::connect(&config).await.unwrap();

    let start = Instant::now();
    let (a, b, c, d) = tokio::join!(
        first.list_task_names(),
        first.list_task_names(),
        second.get_workers(),
        second.get_schedules(),
    );
    let elapsed = start.elapsed();

    assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
    assert_eq!(store.calls(), 4);
    assert_eq!(store.peak.load(Ordering::SeqCst), 1);
    // four calls of 100 ms each, one at a time
    assert!(elapsed >= Duration::from_millis(380), "elapsed {:?}", elapsed);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_auth_token_is_checked() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO).await);
    let handle = serve(store.clone(), local_tcp().with_auth_key("s3cret")).await;

    let anonymous = RpcClient::connect(&client_config(&handle)).await.unwrap();
    let err = anonymous.list_task_names().await.unwrap_err();
    assert!(matches!(err, Error::AuthFailed));

    let wrong = RpcClient::connect(&client_config(&handle).with_auth_key("guess"))
        .await
        .unwrap();
    assert!(matches!(
        wrong.list_task_names().await.unwrap_err(),
        Error::AuthFailed
    ));
    // the connection survives a rejected request
    assert!(matches!(
        wrong.get_workers().await.unwrap_err(),
        Error::AuthFailed
    ));
    assert_eq!(store.calls(), 0);

    let trusted = RpcClient::connect(&client_config(&handle).with_auth_key("s3cret"))
        .await
        .unwrap();
    assert!(trusted.list_task_names().await.unwrap().is_empty());
    assert_eq!(store.calls(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_abandons_only_the_wait() {
    let store = Arc::new(InstrumentedStore::new(Duration::from_millis(300)).await);
    let handle = serve(store.clone(), local_tcp()).await;

    let client = RpcClient::connect(&client_config(&handle).with_timeout_seconds(0.05))
        .await
        .unwrap();
    let err = client
        .store_task_event(TaskEvent::new("slow", TaskState::Started, Utc::now()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(err.is_transient());

    // the server finishes the write anyway
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(store.inner.get_task("slow").await.unwrap().is_some());

    // the timed-out client's connection stays usable
    assert!(!client.is_closed());
    let patient = RpcClient::connect(&client_config(&handle).with_timeout_seconds(5.0))
        .await
        .unwrap();
    assert!(patient.get_task("slow").await.unwrap().is_some());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_request_closes_connection() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO).await);
    let handle = serve(store.clone(), local_tcp()).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port_of(&handle)))
        .await
        .unwrap();
    taskroot_rpc::write_frame(&mut stream, b"{not json", 1024)
        .await
        .unwrap();

    let body = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
    let response: RpcResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.id, 0);
    assert!(matches!(
        response.outcome,
        Outcome::Err(ref e) if e.kind == ErrorKind::Serialization
    ));
    assert!(read_frame(&mut stream, 1 << 20).await.unwrap().is_none());
    assert_eq!(store.calls(), 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_operations_match_in_process_store() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO).await);
    let handle = serve(store.clone(), local_tcp()).await;
    let client = RpcClient::connect(&client_config(&handle)).await.unwrap();

    let now = Utc::now();
    client
        .store_task_event(
            TaskEvent::new("t1", TaskState::Started, now)
                .with_name("tasks.add")
                .with_worker("w1"),
        )
        .await
        .unwrap();
    client
        .store_task_event(TaskEvent::new("t1", TaskState::Success, now).with_runtime(2.5))
        .await
        .unwrap();
    client
        .store_schedule(Schedule::new("s1", "tasks.add", ScheduleExpr::interval(30.0)).with_app("A"))
        .await
        .unwrap();

    assert_eq!(
        client.get_task("t1").await.unwrap(),
        store.inner.get_task("t1").await.unwrap()
    );
    assert_eq!(client.get_task("missing").await.unwrap(), None);
    assert_eq!(
        client.get_schema_version().await.unwrap(),
        CURRENT_SCHEMA_VERSION
    );
    assert_eq!(
        client.get_task_stats(Some("tasks.add"), None).await.unwrap(),
        store.inner.get_task_stats(Some("tasks.add"), None).await.unwrap()
    );
    assert_eq!(
        client.get_state_distribution().await.unwrap(),
        store.inner.get_state_distribution().await.unwrap()
    );
    assert_eq!(
        client.get_schedules().await.unwrap(),
        store.inner.get_schedules().await.unwrap()
    );

    let page = client
        .get_tasks_page(TaskPageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);

    // store errors keep their kind across the wire
    let err = client
        .store_task_event(TaskEvent::new("", TaskState::Started, now))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(!err.is_transient());

    let err = client.migrate(2, 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaVersion);

    let hour = TimeRange::between(now, now + chrono::Duration::hours(1));
    let buckets = client.get_throughput(hour, i64::MAX / 2).await.unwrap();
    assert_eq!(buckets.len(), 1);

    // closing the client leaves the owner's store open
    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(matches!(
        client.list_task_names().await.unwrap_err(),
        Error::ConnectionClosed(_)
    ));
    assert!(store.inner.get_task("t1").await.unwrap().is_some());

    handle.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskroot.sock");
    // a stale file from a previous run
    std::fs::write(&path, b"").unwrap();

    let store = Arc::new(InstrumentedStore::new(Duration::ZERO).await);
    let handle = serve(store.clone(), RpcConfig::unix(&path)).await;

    let client = RpcClient::connect(&RpcConfig::unix(&path)).await.unwrap();
    client
        .store_worker_event(WorkerEvent::new(
            "w1",
            taskroot_core::WorkerEventKind::Online,
            Utc::now(),
        ))
        .await
        .unwrap();
    assert_eq!(client.get_worker_stats().await.unwrap().online, 1);

    handle.shutdown().await.unwrap();
    assert!(!path.exists());
    assert!(RpcClient::connect(&RpcConfig::unix(&path)).await.is_err());
}

#[tokio::test]
async fn test_panicking_call_answers_with_internal_error() {
    let store = Arc::new(InstrumentedStore::new(Duration::ZERO).await);
    let handle = serve(store.clone(), local_tcp()).await;
    let client = RpcClient::connect(&client_config(&handle).with_timeout_seconds(5.0))
        .await
        .unwrap();

    let err = client.cleanup(PANICKING_RETENTION).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    // the connection and the admission permits survive
    assert!(!client.is_closed());
    assert_eq!(client.cleanup(30).await.unwrap(), 0);

    handle.shutdown().await.unwrap();
}
