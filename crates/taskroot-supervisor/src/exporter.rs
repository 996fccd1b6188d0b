//! Metrics exporters hosted by the owning process.
//!
//! The store pushes every committed task and worker event to its registered
//! exporters; [`run_exporter`] adds periodic task stats. [`TracingExporter`]
//! keeps its counters in memory and reports them through `tracing`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use taskroot_core::{
    ControlPlaneConfig, EventStore, MetricsExporter, Result, TaskEvent, TaskStats, WorkerEvent,
};

/// Exporter that logs instead of serving a wire format.
#[derive(Debug, Default)]
pub struct TracingExporter {
    task_events: AtomicU64,
    worker_events: AtomicU64,
    serving: AtomicBool,
    last_stats: Mutex<Option<TaskStats>>,
}

impl TracingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_events(&self) -> u64 {
        self.task_events.load(Ordering::Relaxed)
    }

    pub fn worker_events(&self) -> u64 {
        self.worker_events.load(Ordering::Relaxed)
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Relaxed)
    }

    pub fn last_stats(&self) -> Option<TaskStats> {
        self.last_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl MetricsExporter for TracingExporter {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_task_event(&self, event: &TaskEvent) {
        self.task_events.fetch_add(1, Ordering::Relaxed);
        trace!(
            subsystem = "exporter",
            task_id = %event.task_id,
            state = ?event.state,
            "Task event"
        );
    }

    fn on_worker_event(&self, event: &WorkerEvent) {
        self.worker_events.fetch_add(1, Ordering::Relaxed);
        trace!(
            subsystem = "exporter",
            hostname = %event.hostname,
            event = ?event.event,
            "Worker event"
        );
    }

    fn update_stats(&self, stats: &TaskStats) {
        info!(
            subsystem = "exporter",
            task_events = self.task_events(),
            worker_events = self.worker_events(),
            completed = stats.count,
            avg_runtime = stats.avg_runtime,
            p95 = stats.p95,
            p99 = stats.p99,
            "Task stats"
        );
        *self
            .last_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stats.clone());
    }

    async fn serve(&self) -> Result<()> {
        self.serving.store(true, Ordering::Relaxed);
        debug!(subsystem = "exporter", exporter = self.name(), "Exporter serving");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.serving.store(false, Ordering::Relaxed);
        debug!(subsystem = "exporter", exporter = self.name(), "Exporter stopped");
        Ok(())
    }
}

/// Serve `exporter` and push fresh stats every `interval` until `shutdown`
/// flips. A failed stats query is logged and retried on the next tick.
pub async fn run_exporter(
    exporter: Arc<dyn MetricsExporter>,
    store: Arc<dyn EventStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    exporter.serve().await?;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.get_task_stats(None, None).await {
                    Ok(stats) => exporter.update_stats(&stats),
                    Err(e) => warn!(
                        subsystem = "exporter",
                        exporter = exporter.name(),
                        error = %e,
                        "Stats query failed"
                    ),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    exporter.shutdown().await
}

/// Exporters enabled by `config`.
pub fn default_exporters(config: &ControlPlaneConfig) -> Vec<Arc<dyn MetricsExporter>> {
    match config.exporter {
        Some(_) => vec![Arc::new(TracingExporter::new()) as Arc<dyn MetricsExporter>],
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskroot_core::TaskState;
    use taskroot_db::SqliteStore;

    #[tokio::test]
    async fn test_run_exporter_pushes_stats_until_shutdown() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        let mut done = TaskEvent::new("t1", TaskState::Success, Utc::now());
        done.runtime = Some(1.5);
        store.store_task_event(done).await.unwrap();

        let exporter = Arc::new(TracingExporter::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_exporter(
            exporter.clone(),
            Arc::new(store),
            Duration::from_millis(10),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(exporter.is_serving());
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(!exporter.is_serving());
        assert_eq!(exporter.last_stats().map(|s| s.count), Some(1));
    }

    #[test]
    fn test_default_exporters_follow_config() {
        let config = ControlPlaneConfig::default();
        assert!(default_exporters(&config).is_empty());

        let config = config.with_exporter(taskroot_core::ExporterConfig::default());
        let exporters = default_exporters(&config);
        assert_eq!(exporters.len(), 1);
        assert_eq!(exporters[0].name(), "tracing");
    }

    #[test]
    fn test_counts_pushed_events() {
        let exporter = TracingExporter::new();
        exporter.on_task_event(&TaskEvent::new("t1", TaskState::Started, Utc::now()));
        exporter.on_task_event(&TaskEvent::new("t1", TaskState::Success, Utc::now()));
        assert_eq!(exporter.task_events(), 2);
        assert_eq!(exporter.worker_events(), 0);
    }
}
