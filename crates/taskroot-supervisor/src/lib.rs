//! # taskroot-supervisor
//!
//! Runs the taskroot control plane as a set of cooperating processes.
//!
//! This crate provides:
//! - [`ProcessSupervisor`]: spawns sibling components and stops them with a
//!   grace period, killing stragglers
//! - [`LogAggregator`]: funnels every child's log lines into one set of sinks
//! - [`StoreFactory`] / [`StoreAccess`]: in-process store for the owner, RPC
//!   access for everyone else
//! - The child runtime ([`run_component`]) and the built-in `beat` component
//! - [`ControlPlane`]: the owning process, with its metrics exporters fed by
//!   the store
//! - Subscriber setup shared by the `taskroot` and `taskroot-component`
//!   binaries

pub mod component;
pub mod exporter;
pub mod factory;
pub mod logging;
pub mod logs;
pub mod runtime;
pub mod supervisor;

pub use component::{
    run_component, run_with, stdin_eof_signal, BeatComponent, ChildEnv, Component,
    ComponentContext, ComponentRegistry, ENV_COMPONENT, ENV_CONFIG, ENV_STORE,
};
pub use exporter::{default_exporters, run_exporter, TracingExporter};
pub use factory::{StoreAccess, StoreFactory};
pub use logging::{init_child_logging, init_logging};
pub use logs::{
    sanitize_component, LogAggregator, LogLevel, LogRecord, LogSender, LogSink, LogStream,
    FileSink, MemorySink, TracingSink,
};
pub use runtime::{component_program, default_roster, ControlPlane, RunSummary};
pub use supervisor::{ProcessSupervisor, StartReport, StopReport};
