//! Centralized default constants for the taskroot control plane.
//!
//! **This module is the single source of truth** for shared default values.
//! Organized by domain area.

// =============================================================================
// RETENTION
// =============================================================================

/// Days raw events are kept before a retention sweep may delete them.
pub const RETENTION_DAYS: u32 = 7;

/// Interval between retention sweeps in the owning process.
pub const RETENTION_SWEEP_INTERVAL_SECS: u64 = 3600;

// =============================================================================
// QUERIES
// =============================================================================

/// Default page size for task listings.
pub const PAGE_LIMIT: i64 = 50;

/// Upper bound on a single page of tasks.
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Maximum BFS depth when expanding a task relation graph.
pub const RELATION_MAX_DEPTH: usize = 32;

/// Maximum number of nodes visited when expanding a task relation graph.
pub const RELATION_MAX_NODES: usize = 2000;

// =============================================================================
// RPC
// =============================================================================

/// Default TCP host for the RPC server.
pub const RPC_HOST: &str = "127.0.0.1";

/// Default TCP port for the RPC server.
pub const RPC_PORT: u16 = 8765;

/// Maximum RPC frame payload in bytes (4 MiB).
pub const RPC_MAX_MESSAGE_BYTES: usize = 4_194_304;

/// Maximum concurrently dispatched RPC requests, server-wide.
pub const RPC_MAX_INFLIGHT: usize = 64;

/// Client-side timeout per RPC request in seconds.
pub const RPC_TIMEOUT_SECS: f64 = 5.0;

/// File name prefix of the derived Unix socket path.
pub const RPC_SOCKET_PREFIX: &str = "taskroot";

// =============================================================================
// SCHEDULER
// =============================================================================

/// Fallback interval when a user-edited interval expression cannot be parsed.
pub const DEFAULT_INTERVAL_SECONDS: f64 = 60.0;

/// How often the scheduler writes run state back to the store.
pub const BEAT_SYNC_EVERY_SECS: f64 = 180.0;

/// Tick of the scheduler loop.
pub const BEAT_TICK_SECS: f64 = 1.0;

// =============================================================================
// SUPERVISOR
// =============================================================================

/// Grace period a child gets between the stop signal and a forced kill.
pub const CHILD_GRACE_PERIOD_SECS: f64 = 10.0;

/// Capacity of the aggregated log channel.
pub const EVENT_QUEUE_MAXSIZE: usize = 32_767;

/// Interval at which the exporter component pushes fresh task stats.
pub const EXPORTER_STATS_INTERVAL_SECS: f64 = 15.0;
