//! Crontab field matching.
//!
//! Each field compiles to a bit set of allowed values. Supported syntax per
//! field: `*`, `*/n`, `a`, `a-b`, `a-b/n` and comma-separated lists of those.
//! Day-of-week runs 0-6 with Sunday = 0; 7 is accepted as Sunday. Month and
//! weekday fields also take three-letter English names.
//!
//! When both day-of-month and day-of-week are restricted, a date must match
//! both.

use chrono::{DateTime, Datelike, Timelike, Utc};

use taskroot_core::{CrontabSpec, Error, Result};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Compiled crontab expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronMatcher {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
}

impl CronMatcher {
    pub fn from_spec(spec: &CrontabSpec) -> Result<Self> {
        let mut days_of_week = parse_field("day_of_week", &spec.day_of_week, 0, 7, &WEEKDAY_NAMES, 0)?;
        // 7 is Sunday too
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }
        Ok(Self {
            minutes: parse_field("minute", &spec.minute, 0, 59, &[], 0)?,
            hours: parse_field("hour", &spec.hour, 0, 23, &[], 0)?,
            days_of_month: parse_field("day_of_month", &spec.day_of_month, 1, 31, &[], 0)?,
            months: parse_field("month_of_year", &spec.month_of_year, 1, 12, &MONTH_NAMES, 1)?,
            days_of_week,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        Self::from_spec(&CrontabSpec::parse(text)?)
    }

    /// Whether the minute containing `at` is selected.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        bit(self.minutes, at.minute())
            && bit(self.hours, at.hour())
            && bit(self.days_of_month, at.day())
            && bit(self.months, at.month())
            && bit(self.days_of_week, at.weekday().num_days_from_sunday())
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

/// Parse one field into a bit set over `min..=max`.
///
/// `names[i]` stands for the value `i + name_base`.
fn parse_field(
    field: &str,
    text: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> Result<u64> {
    let invalid = |detail: &str| {
        Error::InvalidInput(format!("crontab {} {:?}: {}", field, text, detail))
    };
    let value = |token: &str| -> Result<u32> {
        let lower = token.to_ascii_lowercase();
        if let Some(index) = names.iter().position(|n| *n == lower) {
            return Ok(index as u32 + name_base);
        }
        let parsed: u32 = token
            .parse()
            .map_err(|_| invalid(&format!("{:?} is not a number", token)))?;
        if parsed < min || parsed > max {
            return Err(invalid(&format!("{} is outside {}-{}", parsed, min, max)));
        }
        Ok(parsed)
    };

    if text.trim().is_empty() {
        return Err(invalid("empty field"));
    }

    let mut set = 0u64;
    for part in text.split(',') {
        let part = part.trim();
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(&format!("bad step {:?}", step)))?;
                if step == 0 {
                    return Err(invalid("step must be > 0"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (value(a)?, value(b)?);
            if a > b {
                return Err(invalid(&format!("range {}-{} is reversed", a, b)));
            }
            (a, b)
        } else {
            let single = value(range)?;
            // "5/15" means from 5 to the end in steps of 15
            if step > 1 {
                (single, max)
            } else {
                (single, single)
            }
        };

        let mut v = start;
        while v <= end {
            set |= 1u64 << v;
            v += step;
        }
    }
    Ok(set)
}
