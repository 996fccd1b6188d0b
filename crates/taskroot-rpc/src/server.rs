//! RPC server exposing an [`EventStore`] to sibling processes.
//!
//! One accept loop runs as a dedicated task. Each connection gets a reader
//! that validates frames in order (size, then auth token, then an in-flight
//! permit) and a writer task that serializes responses as they complete, so
//! requests on one connection are pipelined and may finish out of order.
//!
//! Admission is blocking: when every permit of the server-wide semaphore is
//! taken, connection readers stop reading until one frees up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use taskroot_core::{Error, EventStore, Result, RpcConfig, RpcEndpoint};

use crate::frame;
use crate::protocol::{dispatch, RpcRequest, RpcResponse, CONNECTION_ERROR_ID};

/// How long a rejected oversized body is discarded before the socket closes,
/// so the peer reads the rejection instead of a reset.
const REJECT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

struct ServerContext {
    store: Arc<dyn EventStore>,
    auth_token: Option<String>,
    max_message_bytes: usize,
    max_inflight: usize,
    limiter: Arc<Semaphore>,
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Server bound to one endpoint, not yet accepting.
pub struct RpcServer {
    store: Arc<dyn EventStore>,
    config: RpcConfig,
}

impl RpcServer {
    pub fn new(store: Arc<dyn EventStore>, config: RpcConfig) -> Self {
        Self { store, config }
    }

    /// Bind the configured endpoint and start the accept loop.
    ///
    /// A TCP port of 0 binds an ephemeral port; the handle reports the
    /// address actually bound.
    pub async fn serve(self) -> Result<RpcServerHandle> {
        if self.config.max_inflight == 0 {
            return Err(Error::Config("rpc.max_inflight must be > 0".into()));
        }
        if self.config.max_message_bytes == 0 {
            return Err(Error::Config("rpc.max_message_bytes must be > 0".into()));
        }

        let (listener, endpoint) = bind(&self.config.endpoint()?).await?;
        let ctx = Arc::new(ServerContext {
            store: self.store,
            auth_token: self.config.auth_token().map(str::to_string),
            max_message_bytes: self.config.max_message_bytes,
            max_inflight: self.config.max_inflight,
            limiter: Arc::new(Semaphore::new(self.config.max_inflight)),
        });

        info!(
            subsystem = "rpc",
            component = "server",
            endpoint = %endpoint,
            max_inflight = ctx.max_inflight,
            max_message_bytes = ctx.max_message_bytes,
            auth = ctx.auth_token.is_some(),
            "RPC server listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, endpoint.clone(), ctx, shutdown_rx));

        Ok(RpcServerHandle {
            endpoint,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a running server.
///
/// Dropping the handle also stops the server.
pub struct RpcServerHandle {
    endpoint: RpcEndpoint,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RpcServerHandle {
    /// The address the server is bound to.
    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    /// Stop accepting, let in-flight requests finish and answer, then close
    /// every connection.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("RPC server task failed: {}", e)))?;
        info!(subsystem = "rpc", component = "server", endpoint = %self.endpoint, "RPC server stopped");
        Ok(())
    }
}

async fn bind(endpoint: &RpcEndpoint) -> Result<(Listener, RpcEndpoint)> {
    match endpoint {
        RpcEndpoint::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port)).await?;
            let local = listener.local_addr()?;
            Ok((
                Listener::Tcp(listener),
                RpcEndpoint::Tcp {
                    host: local.ip().to_string(),
                    port: local.port(),
                },
            ))
        }
        #[cfg(unix)]
        RpcEndpoint::Unix(path) => {
            if path.exists() {
                debug!(subsystem = "rpc", path = %path.display(), "Removing stale socket file");
                std::fs::remove_file(path)?;
            }
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let listener = UnixListener::bind(path)?;
            Ok((Listener::Unix(listener), endpoint.clone()))
        }
        #[cfg(not(unix))]
        RpcEndpoint::Unix(_) => Err(Error::Config(
            "unix socket transport is not available on this platform".into(),
        )),
    }
}

async fn accept_loop(
    listener: Listener,
    endpoint: RpcEndpoint,
    ctx: Arc<ServerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = accept(&listener) => match accepted {
                Ok(Accepted::Tcp(stream)) => {
                    let _ = stream.set_nodelay(true);
                    connections.spawn(handle_connection(stream, ctx.clone(), shutdown_rx.clone()));
                }
                #[cfg(unix)]
                Ok(Accepted::Unix(stream)) => {
                    connections.spawn(handle_connection(stream, ctx.clone(), shutdown_rx.clone()));
                }
                Err(e) => {
                    warn!(subsystem = "rpc", component = "server", error = %e, "Accept failed");
                }
            },
            // reap finished connections so the set does not grow unbounded
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    remove_socket_file(&endpoint);
}

fn remove_socket_file(endpoint: &RpcEndpoint) {
    if let RpcEndpoint::Unix(path) = endpoint {
        if let Err(e) = std::fs::remove_file(path) {
            debug!(subsystem = "rpc", path = %path.display(), error = %e, "Socket file not removed");
        }
    }
}

enum Accepted {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &Listener) -> std::io::Result<Accepted> {
    match listener {
        Listener::Tcp(l) => l.accept().await.map(|(s, _)| Accepted::Tcp(s)),
        #[cfg(unix)]
        Listener::Unix(l) => l.accept().await.map(|(s, _)| Accepted::Unix(s)),
    }
}

async fn handle_connection<S>(
    stream: S,
    ctx: Arc<ServerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel::<RpcResponse>(ctx.max_inflight);
    let writer_task = tokio::spawn(write_responses(writer, rx, ctx.max_message_bytes));

    trace!(subsystem = "rpc", component = "server", "Connection opened");

    let mut unread_body = 0usize;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let header = tokio::select! {
            _ = shutdown_rx.changed() => break,
            header = frame::read_header(&mut reader) => header,
        };
        let len = match header {
            Ok(Some(len)) => len,
            Ok(None) => break,
            Err(e) => {
                debug!(subsystem = "rpc", error = %e, "Connection read failed");
                break;
            }
        };

        // (a) size, checked before any of the body is read
        if len > ctx.max_message_bytes {
            warn!(
                subsystem = "rpc",
                component = "server",
                frame_len = len,
                max = ctx.max_message_bytes,
                "Rejecting oversized frame"
            );
            let err = Error::FrameTooLarge {
                size: len,
                max: ctx.max_message_bytes,
            };
            let _ = tx.send(RpcResponse::err(CONNECTION_ERROR_ID, &err)).await;
            unread_body = len;
            break;
        }

        let body = match frame::read_body(&mut reader, len).await {
            Ok(body) => body,
            Err(e) => {
                debug!(subsystem = "rpc", error = %e, "Connection read failed");
                break;
            }
        };
        let request: RpcRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!(subsystem = "rpc", component = "server", error = %e, "Malformed request");
                let _ = tx
                    .send(RpcResponse::err(CONNECTION_ERROR_ID, &Error::from(e)))
                    .await;
                break;
            }
        };

        // (b) auth
        if let Some(expected) = ctx.auth_token.as_deref() {
            if request.token.as_deref() != Some(expected) {
                warn!(
                    subsystem = "rpc",
                    component = "server",
                    request_id = request.id,
                    op = request.call.op_name(),
                    "Rejecting request with bad token"
                );
                if tx
                    .send(RpcResponse::err(request.id, &Error::AuthFailed))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        }

        // (c) admission; waits rather than rejects
        let permit = match ctx.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let store = ctx.store.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let id = request.id;
            let op = request.call.op_name();
            let call = request.call;
            // a panicking store call still owes the caller a reply
            let result = match tokio::spawn(async move { dispatch(store.as_ref(), call).await }).await
            {
                Ok(result) => result,
                Err(e) => {
                    error!(subsystem = "rpc", op, request_id = id, error = %e, "Request handler panicked");
                    Err(Error::Internal(format!("{} handler failed", op)))
                }
            };
            drop(permit);

            let duration_ms = start.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => debug!(subsystem = "rpc", op, request_id = id, duration_ms, "Request served"),
                Err(e) => debug!(
                    subsystem = "rpc",
                    op,
                    request_id = id,
                    duration_ms,
                    error = %e,
                    "Request failed"
                ),
            }
            let _ = tx.send(RpcResponse::from_result(id, result)).await;
        });
    }

    // The writer drains until every dispatched request has answered.
    drop(tx);
    if let Err(e) = writer_task.await {
        error!(subsystem = "rpc", error = %e, "Response writer panicked");
    }
    if unread_body > 0 {
        let mut rest = (&mut reader).take(unread_body as u64);
        let _ = tokio::time::timeout(
            REJECT_DRAIN_TIMEOUT,
            tokio::io::copy(&mut rest, &mut tokio::io::sink()),
        )
        .await;
    }
    trace!(subsystem = "rpc", component = "server", "Connection closed");
}

async fn write_responses<S>(
    mut writer: WriteHalf<S>,
    mut rx: mpsc::Receiver<RpcResponse>,
    max_message_bytes: usize,
) where
    S: AsyncRead + AsyncWrite,
{
    while let Some(response) = rx.recv().await {
        let payload = match encode_response(&response, max_message_bytes) {
            Ok(payload) => payload,
            Err(e) => {
                error!(subsystem = "rpc", request_id = response.id, error = %e, "Response not encodable");
                continue;
            }
        };
        if let Err(e) = frame::write_frame(&mut writer, &payload, max_message_bytes).await {
            debug!(subsystem = "rpc", error = %e, "Connection write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Encode a response, substituting a `frame_too_large` error for replies
/// that would not fit in one frame.
fn encode_response(response: &RpcResponse, max_message_bytes: usize) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(response)?;
    if payload.len() <= max_message_bytes {
        return Ok(payload);
    }
    warn!(
        subsystem = "rpc",
        request_id = response.id,
        frame_len = payload.len(),
        "Reply exceeds max_message_bytes"
    );
    let err = Error::FrameTooLarge {
        size: payload.len(),
        max: max_message_bytes,
    };
    Ok(serde_json::to_vec(&RpcResponse::err(response.id, &err))?)
}
