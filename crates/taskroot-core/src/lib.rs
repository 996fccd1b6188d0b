//! # taskroot-core
//!
//! Core types, traits, and configuration for the taskroot control plane.
//!
//! This crate provides the vocabulary every other taskroot crate speaks:
//! the canonical task/worker/broker events and their materialized views,
//! the [`EventStore`] capability set implemented both in-process and over
//! RPC, the push-style [`MetricsExporter`] interface, schedule expressions,
//! and the explicit [`ControlPlaneConfig`] value threaded through every
//! constructor.

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod schedule;
pub mod stats;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{
    default_rpc_socket_path, BeatConfig, ComponentSpec, ControlPlaneConfig, DatabaseConfig,
    ExporterConfig, RpcConfig, RpcEndpoint, RpcTransport, SupervisorConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use models::*;
pub use schedule::{parse_interval_seconds, CrontabSpec, ScheduleExpr};
pub use stats::{nearest_rank, summarize_runtimes};
pub use traits::{EventStore, MetricsExporter};
