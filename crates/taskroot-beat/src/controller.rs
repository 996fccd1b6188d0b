//! Schedule management for one app.
//!
//! The controller is what an editing surface talks to: it only lists and
//! deletes schedules of its own app and stamps that app on schedules saved
//! without one.

use std::sync::Arc;

use tracing::info;

use taskroot_core::{parse_interval_seconds, Error, EventStore, Result, Schedule, ScheduleExpr};

use crate::cron::CronMatcher;

pub struct BeatController {
    store: Arc<dyn EventStore>,
    app: String,
}

impl BeatController {
    pub fn new(store: Arc<dyn EventStore>, app: impl Into<String>) -> Self {
        Self {
            store,
            app: app.into(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Schedules owned by this app, enabled or not.
    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        Ok(self
            .store
            .get_schedules()
            .await?
            .into_iter()
            .filter(|s| s.app.as_deref() == Some(self.app.as_str()))
            .collect())
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Option<Schedule>> {
        Ok(self
            .list_schedules()
            .await?
            .into_iter()
            .find(|s| s.schedule_id == schedule_id))
    }

    /// Validate and store a schedule, stamping this app when none is set.
    pub async fn save_schedule(&self, mut schedule: Schedule) -> Result<Schedule> {
        if schedule.schedule_id.trim().is_empty() {
            return Err(Error::InvalidInput("schedule_id must not be empty".into()));
        }
        if schedule.task.trim().is_empty() {
            return Err(Error::InvalidInput("task must not be empty".into()));
        }
        if let ScheduleExpr::Crontab(spec) = &schedule.schedule {
            CronMatcher::from_spec(spec)?;
        }
        if schedule.app.as_deref().map_or(true, str::is_empty) {
            schedule.app = Some(self.app.clone());
        }
        if schedule.name.trim().is_empty() {
            schedule.name = schedule.schedule_id.clone();
        }

        self.store.store_schedule(schedule.clone()).await?;
        info!(
            subsystem = "beat",
            app = %self.app,
            schedule_id = %schedule.schedule_id,
            expr = %schedule.schedule,
            "Schedule saved"
        );
        Ok(schedule)
    }

    /// Delete this app's schedule. Absent ids are a no-op.
    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<()> {
        self.store
            .delete_schedule(schedule_id, Some(self.app.as_str()))
            .await?;
        info!(
            subsystem = "beat",
            app = %self.app,
            schedule_id = %schedule_id,
            "Schedule deleted"
        );
        Ok(())
    }

    /// Enable or disable one of this app's schedules.
    pub async fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<Schedule> {
        let mut schedule = self
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("schedule {}", schedule_id)))?;
        schedule.enabled = enabled;
        self.store.store_schedule(schedule.clone()).await?;
        Ok(schedule)
    }
}

/// Parse a schedule expression typed by a user.
///
/// `interval:` text and free text such as `"every 5 seconds"` become an
/// interval, falling back to the default interval when no positive number
/// is found. Five fields become a crontab expression, which must be valid.
pub fn parse_schedule_text(text: &str) -> Result<ScheduleExpr> {
    let trimmed = text.trim();
    if trimmed.split_whitespace().count() == 5 {
        let expr = ScheduleExpr::parse(trimmed)?;
        if let ScheduleExpr::Crontab(spec) = &expr {
            CronMatcher::from_spec(spec)?;
        }
        return Ok(expr);
    }
    let seconds = trimmed.strip_prefix("interval:").unwrap_or(trimmed);
    Ok(ScheduleExpr::interval(parse_interval_seconds(seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule_text() {
        assert!(matches!(
            parse_schedule_text("*/5 * * * *").unwrap(),
            ScheduleExpr::Crontab(_)
        ));
        assert_eq!(
            parse_schedule_text("interval:30").unwrap(),
            ScheduleExpr::interval(30.0)
        );
        assert_eq!(
            parse_schedule_text("every 5 seconds").unwrap(),
            ScheduleExpr::interval(5.0)
        );
        assert_eq!(
            parse_schedule_text("bad").unwrap(),
            ScheduleExpr::interval(60.0)
        );
        assert_eq!(
            parse_schedule_text("interval:0").unwrap(),
            ScheduleExpr::interval(60.0)
        );
        assert!(parse_schedule_text("61 * * * *").is_err());
    }
}
