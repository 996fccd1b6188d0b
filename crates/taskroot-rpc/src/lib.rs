//! # taskroot-rpc
//!
//! Local RPC transport that lets processes without the dataset reach the
//! owning process's event store.
//!
//! This crate provides:
//! - `[u32 big-endian length][JSON payload]` framing
//! - A server that checks frame size, then auth token, then admits the
//!   request under a server-wide in-flight limit
//! - A multiplexed client implementing [`EventStore`], so consumers do not
//!   know which side of the socket they are on
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskroot_core::{EventStore, RpcConfig};
//! use taskroot_rpc::{RpcClient, RpcServer};
//!
//! let handle = RpcServer::new(Arc::new(store), RpcConfig::unix("/tmp/taskroot.sock"))
//!     .serve()
//!     .await?;
//! let client = RpcClient::connect(&RpcConfig::unix("/tmp/taskroot.sock")).await?;
//! let names = client.list_task_names().await?;
//! handle.shutdown().await?;
//! ```

pub mod client;
pub mod frame;
pub mod protocol;
pub mod server;

pub use taskroot_core::EventStore;

pub use client::RpcClient;
pub use frame::{read_frame, write_frame, HEADER_LEN};
pub use protocol::{
    dispatch, Outcome, RemoteError, RpcRequest, RpcResponse, StoreCall, StoreReply,
    CONNECTION_ERROR_ID,
};
pub use server::{RpcServer, RpcServerHandle};
