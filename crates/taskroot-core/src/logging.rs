//! Structured logging schema and field name constants for taskroot.
//!
//! Every crate logs with these field names so records funneled from child
//! processes can be re-attributed and queried uniformly.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied (forced child kill, bad frame) |
//! | INFO  | Lifecycle events (startup, shutdown, component spawn), retention sweeps |
//! | DEBUG | Decision points, per-request dispatch, schedule due checks |
//! | TRACE | Per-event ingestion, per-frame traffic |
//!
//! ## Field Names
//!
//! `tracing` macros take field names as identifiers, so the schema lives
//! here as a table rather than as constants.
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `subsystem` | Originating subsystem: `db`, `rpc`, `beat`, `supervisor`, `exporter` |
//! | `component` | Supervised child a record belongs to, e.g. `beat`, `dashboard` |
//! | `op` | Logical operation, e.g. `store_task_event`, `cleanup`, `spawn` |
//! | `request_id` | RPC request id, unique per client connection |
//! | `task_id`, `hostname`, `schedule_id`, `app`, `pid` | Entity operated on |
//! | `duration_ms` | Wall-clock duration in milliseconds |
//! | `result_count` | Rows returned, or records delivered |
//! | `deleted_count` | Rows deleted by a retention sweep |
//! | `frame_len` | Declared byte length of an RPC frame |
//! | `error` | Error message when an operation fails |

// ─── Forwarded record envelope ─────────────────────────────────────────────

/// Keys emitted by the JSON formatter of `tracing-subscriber`, read back when
/// a child's stdout line is turned into a forwarded record.
pub const RECORD_LEVEL: &str = "level";
pub const RECORD_TARGET: &str = "target";
pub const RECORD_FIELDS: &str = "fields";
pub const RECORD_MESSAGE: &str = "message";
