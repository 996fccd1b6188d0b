//! The owning process: store, RPC server, retention, log funnel and
//! supervised children, started and stopped in order.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use taskroot_core::defaults::RETENTION_SWEEP_INTERVAL_SECS;
use taskroot_core::{ComponentSpec, ControlPlaneConfig, EventStore, MetricsExporter, Result};
use taskroot_db::{run_retention_loop, SqliteStore};
use taskroot_rpc::RpcServer;

use crate::exporter::run_exporter;
use crate::factory::StoreFactory;
use crate::logs::{LogAggregator, LogSink};
use crate::supervisor::{ProcessSupervisor, StartReport, StopReport};

/// File name of the child binary.
pub const COMPONENT_BINARY: &str = "taskroot-component";

/// Path of the child binary installed next to the current executable.
pub fn component_program() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name(format!("{}{}", COMPONENT_BINARY, std::env::consts::EXE_SUFFIX)))
}

/// Built-in components enabled by `config`, followed by the configured
/// extra components.
pub fn default_roster(config: &ControlPlaneConfig, component_program: &Path) -> Vec<ComponentSpec> {
    let mut roster = Vec::new();
    if config.beat.is_some() {
        roster.push(ComponentSpec::new("beat", component_program));
    }
    roster.extend(config.supervisor.components.iter().cloned());
    roster
}

/// What happened during one [`ControlPlane::run`].
#[derive(Debug)]
pub struct RunSummary {
    pub start: StartReport,
    pub stop: StopReport,
    /// Child log records delivered to the sinks.
    pub log_records: u64,
}

/// The owning process: store, RPC server, retention loop, exporters, log
/// funnel and supervised children.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    roster: Vec<ComponentSpec>,
    sinks: Vec<Arc<dyn LogSink>>,
    exporters: Vec<Arc<dyn MetricsExporter>>,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self {
            config,
            roster: Vec::new(),
            sinks: Vec::new(),
            exporters: Vec::new(),
        }
    }

    pub fn with_roster(mut self, roster: Vec<ComponentSpec>) -> Self {
        self.roster = roster;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Register an exporter on the store and feed it periodic stats.
    pub fn with_exporter(mut self, exporter: Arc<dyn MetricsExporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    /// Run until `shutdown` completes.
    ///
    /// Startup order is store, RPC server, retention loop and exporters, log
    /// aggregator, children. Shutdown runs the other way round: children
    /// first, then the log funnel, the server, the background tasks and
    /// finally the store.
    pub async fn run<F>(self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let Self {
            config,
            roster,
            sinks,
            exporters,
        } = self;
        config.validate()?;

        let mut sqlite = SqliteStore::open(&config.database).await?;
        for exporter in &exporters {
            sqlite = sqlite.with_exporter(exporter.clone());
        }
        sqlite.initialize().await?;
        let store: Arc<dyn EventStore> = Arc::new(sqlite);

        let server = RpcServer::new(store.clone(), config.rpc.clone()).serve().await?;
        let access = StoreFactory::InProcess(store.clone())
            .child_access(Some((server.endpoint(), &config.rpc)))?;

        let (background_tx, background_rx) = watch::channel(false);
        let mut background = vec![tokio::spawn(run_retention_loop(
            store.clone(),
            config.database.retention_days,
            Duration::from_secs(RETENTION_SWEEP_INTERVAL_SECS),
            background_rx.clone(),
        ))];
        let stats_interval = config.exporter.clone().unwrap_or_default().stats_interval();
        for exporter in &exporters {
            let exporter = exporter.clone();
            let store = store.clone();
            let rx = background_rx.clone();
            background.push(tokio::spawn(async move {
                let name = exporter.name().to_string();
                if let Err(e) = run_exporter(exporter, store, stats_interval, rx).await {
                    warn!(subsystem = "exporter", exporter = %name, error = %e, "Exporter failed");
                }
            }));
        }

        let aggregator = LogAggregator::start(config.supervisor.event_queue_maxsize, sinks);
        let mut supervisor =
            ProcessSupervisor::new(roster, config.clone(), access, aggregator.sender());
        let start = supervisor.start();

        info!(
            subsystem = "supervisor",
            endpoint = %server.endpoint(),
            started = start.started.len(),
            failed = start.failed.len(),
            exporters = exporters.len(),
            "Control plane running"
        );

        shutdown.await;
        info!(subsystem = "supervisor", "Control plane stopping");

        let stop = supervisor.stop().await;
        drop(supervisor);
        let log_records = aggregator.shutdown().await;

        if let Err(e) = server.shutdown().await {
            warn!(subsystem = "rpc", error = %e, "RPC server shutdown failed");
        }
        let _ = background_tx.send(true);
        for task in join_all(background).await {
            if let Err(e) = task {
                warn!(subsystem = "supervisor", error = %e, "Background task failed");
            }
        }
        store.close().await?;

        info!(
            subsystem = "supervisor",
            graceful = stop.graceful.len(),
            killed = stop.killed.len(),
            result_count = log_records,
            "Control plane stopped"
        );

        Ok(RunSummary {
            start,
            stop,
            log_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskroot_core::{BeatConfig, ExporterConfig};

    #[test]
    fn test_default_roster() {
        let program = Path::new("/opt/taskroot/taskroot-component");
        let mut config = ControlPlaneConfig::default();
        assert!(default_roster(&config, program).is_empty());

        config = config
            .with_beat(BeatConfig::new("billing"))
            .with_exporter(ExporterConfig::default());
        config
            .supervisor
            .components
            .push(ComponentSpec::new("dashboard", "/opt/taskroot/dashboard"));

        let roster = default_roster(&config, program);
        let names: Vec<&str> = roster.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["beat", "dashboard"]);
        assert_eq!(roster[0].program, program);
    }
}
