//! Starting and stopping sibling processes.
//!
//! Each component in the roster runs as a separate OS process with piped
//! stdio. Its stdout and stderr feed the log aggregator; closing its stdin is
//! the request to stop. Children that outlive their grace period are killed.

use std::process::Stdio;
use std::time::Duration;

use futures::future::join_all;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskroot_core::{ComponentSpec, ControlPlaneConfig, Error, Result};

use crate::component::ChildEnv;
use crate::factory::StoreAccess;
use crate::logs::{LogSender, LogStream};

/// How long a stopped child's log forwarders may take to reach EOF. A
/// grandchild can keep the pipes open after the child itself is gone.
const FORWARDER_DRAIN: Duration = Duration::from_millis(500);

/// Outcome of [`ProcessSupervisor::start`].
#[derive(Debug, Default)]
pub struct StartReport {
    /// Component name and pid of every child spawned.
    pub started: Vec<(String, u32)>,
    /// Components whose spawn failed.
    pub failed: Vec<(String, Error)>,
}

/// Outcome of [`ProcessSupervisor::stop`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Children that exited within their grace period.
    pub graceful: Vec<String>,
    /// Children that had to be killed.
    pub killed: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.killed.is_empty()
    }
}

struct RunningChild {
    name: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    grace: Duration,
    forwarders: Vec<JoinHandle<()>>,
}

pub struct ProcessSupervisor {
    roster: Vec<ComponentSpec>,
    config: ControlPlaneConfig,
    store: StoreAccess,
    logs: LogSender,
    children: Vec<RunningChild>,
}

impl ProcessSupervisor {
    /// `store` is what children receive to reach the event store.
    pub fn new(
        roster: Vec<ComponentSpec>,
        config: ControlPlaneConfig,
        store: StoreAccess,
        logs: LogSender,
    ) -> Self {
        Self {
            roster,
            config,
            store,
            logs,
            children: Vec::new(),
        }
    }

    pub fn roster(&self) -> &[ComponentSpec] {
        &self.roster
    }

    /// Spawn every roster component not already running. One failed spawn
    /// does not keep the others from starting.
    pub fn start(&mut self) -> StartReport {
        let mut report = StartReport::default();
        let roster = self.roster.clone();
        for spec in &roster {
            if self.children.iter().any(|c| c.name == spec.name) {
                debug!(
                    subsystem = "supervisor",
                    component = %spec.name,
                    "Component already running"
                );
                continue;
            }
            match self.spawn(spec) {
                Ok(child) => {
                    info!(
                        subsystem = "supervisor",
                        op = "spawn",
                        component = %spec.name,
                        pid = child.pid,
                        program = %spec.program.display(),
                        "Component spawned"
                    );
                    report
                        .started
                        .push((spec.name.clone(), child.pid.unwrap_or_default()));
                    self.children.push(child);
                }
                Err(e) => {
                    error!(
                        subsystem = "supervisor",
                        op = "spawn",
                        component = %spec.name,
                        error = %e,
                        "Component failed to start"
                    );
                    report.failed.push((spec.name.clone(), e));
                }
            }
        }
        report
    }

    fn spawn(&self, spec: &ComponentSpec) -> Result<RunningChild> {
        let launch = ChildEnv {
            component: spec.name.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .envs(launch.vars()?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::ProcessSpawn {
            component: spec.name.clone(),
            source,
        })?;

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(self.logs.forward(&spec.name, LogStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(self.logs.forward(&spec.name, LogStream::Stderr, stderr));
        }

        let default_grace = self.config.supervisor.grace_period_seconds;
        let grace = spec
            .grace_period_seconds
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .or_else(|| Duration::try_from_secs_f64(default_grace).ok())
            .unwrap_or_default();

        Ok(RunningChild {
            name: spec.name.clone(),
            pid: child.id(),
            stdin: child.stdin.take(),
            child,
            grace,
            forwarders,
        })
    }

    /// Names of children that have not exited yet.
    pub fn running(&mut self) -> Vec<String> {
        self.children
            .iter_mut()
            .filter_map(|c| matches!(c.child.try_wait(), Ok(None)).then(|| c.name.clone()))
            .collect()
    }

    /// Component name and pid of every spawned child.
    pub fn pids(&self) -> Vec<(String, u32)> {
        self.children
            .iter()
            .filter_map(|c| c.pid.map(|pid| (c.name.clone(), pid)))
            .collect()
    }

    /// Ask every child to stop, wait out grace periods concurrently, kill
    /// stragglers and reap everything. No child is running afterwards.
    pub async fn stop(&mut self) -> StopReport {
        let children = std::mem::take(&mut self.children);
        if children.is_empty() {
            return StopReport::default();
        }
        info!(
            subsystem = "supervisor",
            op = "stop",
            result_count = children.len(),
            "Stopping components"
        );

        let outcomes = join_all(children.into_iter().map(stop_child)).await;

        let mut report = StopReport::default();
        for (name, graceful) in outcomes {
            if graceful {
                report.graceful.push(name);
            } else {
                report.killed.push(name);
            }
        }
        report
    }
}

/// Returns the child's name and whether it exited on its own.
async fn stop_child(mut running: RunningChild) -> (String, bool) {
    // EOF on stdin is the stop signal
    drop(running.stdin.take());

    let graceful = match tokio::time::timeout(running.grace, running.child.wait()).await {
        Ok(Ok(status)) => {
            info!(
                subsystem = "supervisor",
                component = %running.name,
                status = %status,
                "Component exited"
            );
            true
        }
        Ok(Err(e)) => {
            warn!(
                subsystem = "supervisor",
                component = %running.name,
                error = %e,
                "Waiting for component failed, killing it"
            );
            kill(&mut running).await;
            false
        }
        Err(_) => {
            let e = Error::ChildTerminationTimeout {
                component: running.name.clone(),
                grace: running.grace,
            };
            warn!(
                subsystem = "supervisor",
                component = %running.name,
                error = %e,
                "Component ignored stop request, killing it"
            );
            kill(&mut running).await;
            false
        }
    };

    for forwarder in running.forwarders {
        let abort = forwarder.abort_handle();
        if tokio::time::timeout(FORWARDER_DRAIN, forwarder).await.is_err() {
            debug!(
                subsystem = "supervisor",
                component = %running.name,
                "Log stream still open after exit, detaching"
            );
            abort.abort();
        }
    }

    (running.name, graceful)
}

async fn kill(running: &mut RunningChild) {
    // kill() also reaps the process
    if let Err(e) = running.child.kill().await {
        error!(
            subsystem = "supervisor",
            component = %running.name,
            error = %e,
            "Failed to kill component"
        );
    }
}
