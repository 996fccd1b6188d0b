//! Schedule expressions: five-field crontab specs and fixed intervals.
//!
//! Expressions are stored and transported as text. The interval form is
//! `interval:<seconds>`; anything with five whitespace-separated fields is a
//! crontab spec.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::defaults::DEFAULT_INTERVAL_SECONDS;
use crate::{Error, Result};

static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d+(?:\.\d+)?").expect("number pattern is valid")
});

const INTERVAL_PREFIX: &str = "interval:";

/// The five textual fields of a crontab expression, in crontab order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrontabSpec {
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month_of_year: String,
    pub day_of_week: String,
}

impl CrontabSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        match fields.as_slice() {
            [minute, hour, day_of_month, month_of_year, day_of_week] => Ok(Self {
                minute: minute.to_string(),
                hour: hour.to_string(),
                day_of_month: day_of_month.to_string(),
                month_of_year: month_of_year.to_string(),
                day_of_week: day_of_week.to_string(),
            }),
            _ => Err(Error::InvalidInput(format!(
                "crontab expression needs 5 fields, got {}: {:?}",
                fields.len(),
                text
            ))),
        }
    }
}

impl std::fmt::Display for CrontabSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month_of_year, self.day_of_week
        )
    }
}

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScheduleExpr {
    Crontab(CrontabSpec),
    Interval { every: f64 },
}

impl ScheduleExpr {
    pub fn interval(every: f64) -> Self {
        Self::Interval { every }
    }

    /// Strict parse, used when validating user input.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if let Some(rest) = trimmed.strip_prefix(INTERVAL_PREFIX) {
            let every: f64 = rest.trim().parse().map_err(|_| {
                Error::InvalidInput(format!("invalid interval seconds: {:?}", rest))
            })?;
            if !every.is_finite() || every <= 0.0 {
                return Err(Error::InvalidInput(format!(
                    "interval must be positive, got {}",
                    every
                )));
            }
            return Ok(Self::Interval { every });
        }
        CrontabSpec::parse(trimmed).map(Self::Crontab)
    }

    /// Lenient parse for stored text. Unparseable interval text falls back to
    /// the default interval, anything else that is not a crontab spec too.
    pub fn parse_lenient(text: &str) -> Self {
        let trimmed = text.trim();
        if let Some(rest) = trimmed.strip_prefix(INTERVAL_PREFIX) {
            return Self::Interval {
                every: parse_interval_seconds(rest),
            };
        }
        match CrontabSpec::parse(trimmed) {
            Ok(spec) => Self::Crontab(spec),
            Err(_) => {
                tracing::warn!(
                    subsystem = "beat",
                    expr = %trimmed,
                    "Unparseable schedule expression, using default interval"
                );
                Self::Interval {
                    every: parse_interval_seconds(trimmed),
                }
            }
        }
    }
}

impl std::fmt::Display for ScheduleExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crontab(spec) => spec.fmt(f),
            Self::Interval { every } if every.fract() == 0.0 => {
                write!(f, "{}{}", INTERVAL_PREFIX, *every as i64)
            }
            Self::Interval { every } => write!(f, "{}{}", INTERVAL_PREFIX, every),
        }
    }
}

impl From<String> for ScheduleExpr {
    fn from(text: String) -> Self {
        Self::parse_lenient(&text)
    }
}

impl From<ScheduleExpr> for String {
    fn from(expr: ScheduleExpr) -> Self {
        expr.to_string()
    }
}

/// Extract a positive number of seconds from free text such as
/// `"every 5 seconds"`. Falls back to [`DEFAULT_INTERVAL_SECONDS`].
pub fn parse_interval_seconds(text: &str) -> f64 {
    NUMBER
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(DEFAULT_INTERVAL_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crontab() {
        let expr = ScheduleExpr::parse("*/5 * * * *").unwrap();
        match &expr {
            ScheduleExpr::Crontab(spec) => assert_eq!(spec.minute, "*/5"),
            other => panic!("expected crontab, got {:?}", other),
        }
        assert!(expr.to_string().contains("*/5"));
    }

    #[test]
    fn test_parse_interval() {
        let expr = ScheduleExpr::parse("interval:30").unwrap();
        assert_eq!(expr, ScheduleExpr::Interval { every: 30.0 });
        assert_eq!(expr.to_string(), "interval:30");
        assert_eq!(ScheduleExpr::interval(2.5).to_string(), "interval:2.5");
    }

    #[test]
    fn test_strict_parse_rejects_garbage() {
        assert!(ScheduleExpr::parse("* * *").is_err());
        assert!(ScheduleExpr::parse("interval:soon").is_err());
        assert!(ScheduleExpr::parse("interval:0").is_err());
    }

    #[test]
    fn test_lenient_parse_falls_back() {
        assert_eq!(
            ScheduleExpr::parse_lenient("interval:bad"),
            ScheduleExpr::Interval { every: 60.0 }
        );
        assert_eq!(
            ScheduleExpr::parse_lenient("every 5 seconds"),
            ScheduleExpr::Interval { every: 5.0 }
        );
    }

    #[test]
    fn test_parse_interval_seconds() {
        assert_eq!(parse_interval_seconds("every 5 seconds"), 5.0);
        assert_eq!(parse_interval_seconds("bad"), 60.0);
        assert_eq!(parse_interval_seconds("0"), 60.0);
        assert_eq!(parse_interval_seconds("1.5s"), 1.5);
    }

    #[test]
    fn test_serde_as_text() {
        let json = serde_json::to_string(&ScheduleExpr::parse("0 1 * * *").unwrap()).unwrap();
        assert_eq!(json, "\"0 1 * * *\"");
        let back: ScheduleExpr = serde_json::from_str("\"interval:10\"").unwrap();
        assert_eq!(back, ScheduleExpr::Interval { every: 10.0 });
    }
}
