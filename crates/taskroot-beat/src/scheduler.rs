//! Database-backed scheduler bound to one application identity.
//!
//! Schedules live in the event store. A scheduler loads only the enabled
//! rows of its own `app`, decides which entries are due, hands them to a
//! [`TaskDispatcher`] and periodically writes run state back. Several
//! schedulers with different apps can share one store without seeing each
//! other's rows.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskroot_core::{BeatConfig, Error, EventStore, Result, Schedule, ScheduleExpr};

use crate::cron::CronMatcher;

/// Sends a due schedule's task to the task queue.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, schedule: &Schedule) -> Result<()>;
}

/// Dispatcher that only records the send in the log.
#[derive(Debug, Default, Clone)]
pub struct TracingDispatcher;

#[async_trait]
impl TaskDispatcher for TracingDispatcher {
    async fn dispatch(&self, schedule: &Schedule) -> Result<()> {
        info!(
            subsystem = "beat",
            schedule_id = %schedule.schedule_id,
            task = %schedule.task,
            args = %serde_json::Value::Array(schedule.args.clone()),
            "Dispatching scheduled task"
        );
        Ok(())
    }
}

/// One loaded schedule plus the in-memory state needed to decide when it
/// fires next.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub schedule: Schedule,
    cron: Option<CronMatcher>,
    /// Reference point for interval schedules that have never run.
    loaded_at: DateTime<Utc>,
    dirty: bool,
}

impl ScheduleEntry {
    fn new(schedule: Schedule, loaded_at: DateTime<Utc>) -> Self {
        let cron = match &schedule.schedule {
            ScheduleExpr::Crontab(spec) => match CronMatcher::from_spec(spec) {
                Ok(cron) => Some(cron),
                Err(e) => {
                    warn!(
                        subsystem = "beat",
                        schedule_id = %schedule.schedule_id,
                        error = %e,
                        "Crontab expression never matches"
                    );
                    None
                }
            },
            ScheduleExpr::Interval { .. } => None,
        };
        Self {
            schedule,
            cron,
            loaded_at,
            dirty: false,
        }
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule.schedule_id
    }

    /// Whether run state changed since the last write-back.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Interval schedules are due once `every` seconds passed since the last
    /// run, or since loading if they never ran. Crontab schedules are due in
    /// a matching minute they have not already run in.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.schedule.enabled {
            return false;
        }
        match &self.schedule.schedule {
            ScheduleExpr::Interval { every } => {
                let since = self.schedule.last_run_at.unwrap_or(self.loaded_at);
                let elapsed = (now - since).num_microseconds().unwrap_or(i64::MAX);
                elapsed as f64 >= every * 1_000_000.0
            }
            ScheduleExpr::Crontab(_) => {
                let Some(cron) = &self.cron else {
                    return false;
                };
                if !cron.matches(now) {
                    return false;
                }
                match self.schedule.last_run_at {
                    Some(last) => minute_of(last) < minute_of(now),
                    None => true,
                }
            }
        }
    }

    fn record_run(&mut self, at: DateTime<Utc>) {
        self.schedule.last_run_at = Some(at);
        self.schedule.total_run_count += 1;
        self.dirty = true;
    }
}

fn minute_of(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(ts)
}

/// Scheduler whose schedules are rows in the event store.
pub struct DatabaseScheduler {
    store: Arc<dyn EventStore>,
    config: BeatConfig,
    entries: BTreeMap<String, ScheduleEntry>,
}

impl DatabaseScheduler {
    pub fn new(store: Arc<dyn EventStore>, config: BeatConfig) -> Self {
        Self {
            store,
            config,
            entries: BTreeMap::new(),
        }
    }

    pub fn app(&self) -> &str {
        &self.config.app
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.values()
    }

    pub fn entry(&self, schedule_id: &str) -> Option<&ScheduleEntry> {
        self.entries.get(schedule_id)
    }

    /// Enabled rows belonging to this scheduler's app.
    async fn load_own(&self) -> Result<Vec<Schedule>> {
        let app = self.app();
        Ok(self
            .store
            .get_schedules()
            .await?
            .into_iter()
            .filter(|s| s.enabled && s.app.as_deref() == Some(app))
            .collect())
    }

    /// Replace the in-memory schedule with this app's enabled rows.
    pub async fn setup_schedule(&mut self) -> Result<usize> {
        let now = Utc::now();
        self.entries = self
            .load_own()
            .await?
            .into_iter()
            .map(|s| (s.schedule_id.clone(), ScheduleEntry::new(s, now)))
            .collect();
        info!(
            subsystem = "beat",
            app = %self.config.app,
            result_count = self.entries.len(),
            "Schedule loaded"
        );
        Ok(self.entries.len())
    }

    /// Reload rows, keeping in-memory run state that is newer than what is
    /// stored. Rows that disappeared or were disabled are dropped.
    pub async fn refresh(&mut self) -> Result<()> {
        let now = Utc::now();
        let rows = self.load_own().await?;
        let mut previous = std::mem::take(&mut self.entries);
        for mut schedule in rows {
            let entry = match previous.remove(&schedule.schedule_id) {
                Some(old) => {
                    let stored_newer = match (schedule.last_run_at, old.schedule.last_run_at) {
                        (Some(stored), Some(ours)) => stored > ours,
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    let dirty = old.dirty && !stored_newer;
                    if !stored_newer {
                        schedule.last_run_at = old.schedule.last_run_at;
                        schedule.total_run_count =
                            schedule.total_run_count.max(old.schedule.total_run_count);
                    }
                    let mut entry = ScheduleEntry::new(schedule, old.loaded_at);
                    entry.dirty = dirty;
                    entry
                }
                None => ScheduleEntry::new(schedule, now),
            };
            self.entries.insert(entry.schedule.schedule_id.clone(), entry);
        }
        debug!(
            subsystem = "beat",
            app = %self.config.app,
            result_count = self.entries.len(),
            dropped = previous.len(),
            "Schedule refreshed"
        );
        Ok(())
    }

    /// Ids of entries due at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| e.schedule.schedule_id.clone())
            .collect()
    }

    /// Record that `schedule_id` ran at `at`.
    pub fn record_run(&mut self, schedule_id: &str, at: DateTime<Utc>) -> Result<()> {
        let entry = self
            .entries
            .get_mut(schedule_id)
            .ok_or_else(|| Error::NotFound(format!("schedule {}", schedule_id)))?;
        entry.record_run(at);
        Ok(())
    }

    /// Dispatch every due entry and record the ones that were sent.
    ///
    /// A failed dispatch is logged and left due for the next tick.
    pub async fn fire_due(
        &mut self,
        now: DateTime<Utc>,
        dispatcher: &dyn TaskDispatcher,
    ) -> Result<Vec<String>> {
        let mut fired = Vec::new();
        for schedule_id in self.due(now) {
            let Some(entry) = self.entries.get(&schedule_id) else {
                continue;
            };
            match dispatcher.dispatch(&entry.schedule).await {
                Ok(()) => {
                    self.record_run(&schedule_id, now)?;
                    fired.push(schedule_id);
                }
                Err(e) => {
                    warn!(
                        subsystem = "beat",
                        schedule_id = %schedule_id,
                        error = %e,
                        "Dispatch failed"
                    );
                }
            }
        }
        Ok(fired)
    }

    /// Write back run state of entries that changed since the last sync.
    /// Returns how many schedules were written.
    pub async fn sync(&mut self) -> Result<usize> {
        let mut written = 0;
        for entry in self.entries.values_mut().filter(|e| e.dirty) {
            self.store.store_schedule(entry.schedule.clone()).await?;
            entry.dirty = false;
            written += 1;
        }
        if written > 0 {
            debug!(
                subsystem = "beat",
                app = %self.config.app,
                result_count = written,
                "Run state synced"
            );
        }
        Ok(written)
    }

    /// Fire, sync and refresh on a fixed tick until `shutdown` flips, then
    /// sync one last time.
    ///
    /// Store errors during the loop are logged and retried on a later tick.
    pub async fn run(
        mut self,
        dispatcher: Arc<dyn TaskDispatcher>,
        tick: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.setup_schedule().await?;

        let sync_every = Duration::from_secs_f64(self.config.sync_every_seconds);
        let refresh_every = self.config.db_refresh_seconds.map(Duration::from_secs_f64);
        let mut last_sync = Instant::now();
        let mut last_refresh = Instant::now();
        let mut ticker = tokio::time::interval(tick);

        info!(
            subsystem = "beat",
            app = %self.config.app,
            tick_ms = tick.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if let Some(every) = refresh_every {
                if last_refresh.elapsed() >= every {
                    match self.refresh().await {
                        Ok(()) => last_refresh = Instant::now(),
                        Err(e) => warn!(subsystem = "beat", error = %e, "Schedule refresh failed"),
                    }
                }
            }

            if let Err(e) = self.fire_due(Utc::now(), dispatcher.as_ref()).await {
                warn!(subsystem = "beat", error = %e, "Firing due schedules failed");
            }

            if last_sync.elapsed() >= sync_every {
                match self.sync().await {
                    Ok(_) => last_sync = Instant::now(),
                    Err(e) => warn!(subsystem = "beat", error = %e, "Run state sync failed"),
                }
            }
        }

        let synced = self.sync().await?;
        info!(
            subsystem = "beat",
            app = %self.config.app,
            result_count = synced,
            "Scheduler stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 5, 0).unwrap()
    }

    fn entry(expr: &str, last_run_at: Option<DateTime<Utc>>) -> ScheduleEntry {
        let mut schedule = Schedule::new("s", "tasks.s", ScheduleExpr::parse(expr).unwrap());
        schedule.last_run_at = last_run_at;
        ScheduleEntry::new(schedule, t0() - chrono::Duration::seconds(30))
    }

    #[test]
    fn test_interval_without_runs_counts_from_load() {
        let e = entry("interval:60", None);
        assert!(!e.is_due(t0()));
        assert!(e.is_due(t0() + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_interval_counts_from_last_run() {
        let e = entry("interval:10", Some(t0()));
        assert!(!e.is_due(t0() + chrono::Duration::seconds(9)));
        assert!(e.is_due(t0() + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_crontab_fires_once_per_minute() {
        let mut e = entry("*/5 * * * *", None);
        assert!(e.is_due(t0()));
        e.record_run(t0());
        assert!(!e.is_due(t0() + chrono::Duration::seconds(30)));
        assert!(!e.is_due(t0() + chrono::Duration::minutes(1)));
        assert!(e.is_due(t0() + chrono::Duration::minutes(5)));
        assert_eq!(e.schedule.total_run_count, 1);
        assert!(e.is_dirty());
    }

    #[test]
    fn test_disabled_is_never_due() {
        let mut e = entry("* * * * *", None);
        e.schedule.enabled = false;
        assert!(!e.is_due(t0()));
    }

    #[test]
    fn test_bad_crontab_is_never_due() {
        let schedule = Schedule::new(
            "s",
            "tasks.s",
            ScheduleExpr::Crontab(taskroot_core::CrontabSpec::parse("99 * * * *").unwrap()),
        );
        let e = ScheduleEntry::new(schedule, t0());
        assert!(!e.is_due(t0()));
    }
}
