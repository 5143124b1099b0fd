use chrono::{DateTime, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::exchange::Exchange;

/// What a scheduled task does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Run a reconciliation pass over active cycles
    Update,
    /// Create new cycles on enabled exchanges
    New,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Update => "update",
            TaskKind::New => "new",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "update" => Ok(TaskKind::Update),
            "new" => Ok(TaskKind::New),
            _ => Err("invalid task type; expected update|new"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        }
    }

    pub fn to_duration(&self, value: u32) -> Duration {
        match self {
            IntervalUnit::Minutes => Duration::minutes(value as i64),
            IntervalUnit::Hours => Duration::hours(value as i64),
            IntervalUnit::Days => Duration::days(value as i64),
        }
    }
}

impl std::fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IntervalUnit {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minutes" | "minute" | "min" => Ok(IntervalUnit::Minutes),
            "hours" | "hour" => Ok(IntervalUnit::Hours),
            "days" | "day" => Ok(IntervalUnit::Days),
            _ => Err("invalid interval unit; expected minutes|hours|days"),
        }
    }
}

/// Parse a daily `HH:MM` time-of-day.
pub fn parse_specific_time(raw: &str) -> std::result::Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| format!("invalid HH:MM time '{raw}': {e}"))
}

/// A named recurring job.
///
/// Exactly one of the interval pair or `specific_time` drives
/// scheduling; `specific_time` wins when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique key
    pub name: String,
    pub kind: TaskKind,
    pub enabled: bool,
    #[serde(default)]
    pub interval_value: Option<u32>,
    #[serde(default)]
    pub interval_unit: Option<IntervalUnit>,
    /// Daily HH:MM
    #[serde(default)]
    pub specific_time: Option<NaiveTime>,
    /// Optional scope filter; None means all enabled exchanges
    #[serde(default)]
    pub exchange: Option<Exchange>,
    /// Per-task strategy overrides
    #[serde(default)]
    pub buy_offset: Option<Decimal>,
    #[serde(default)]
    pub sell_offset: Option<Decimal>,
    #[serde(default)]
    pub percent: Option<Decimal>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_scheduled_at: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    pub fn interval(name: &str, kind: TaskKind, value: u32, unit: IntervalUnit) -> Self {
        Self {
            name: name.to_string(),
            kind,
            enabled: true,
            interval_value: Some(value),
            interval_unit: Some(unit),
            specific_time: None,
            exchange: None,
            buy_offset: None,
            sell_offset: None,
            percent: None,
            last_run: None,
            next_scheduled_at: None,
        }
    }

    pub fn daily(name: &str, kind: TaskKind, at: NaiveTime) -> Self {
        Self {
            name: name.to_string(),
            kind,
            enabled: true,
            interval_value: None,
            interval_unit: None,
            specific_time: Some(at),
            exchange: None,
            buy_offset: None,
            sell_offset: None,
            percent: None,
            last_run: None,
            next_scheduled_at: None,
        }
    }

    /// One of the two scheduling drivers must be present.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("task name must not be empty".to_string());
        }
        let has_interval = self.interval_value.is_some() && self.interval_unit.is_some();
        if !has_interval && self.specific_time.is_none() {
            return Err(format!(
                "task '{}' has neither an interval nor a specific time",
                self.name
            ));
        }
        if let Some(v) = self.interval_value {
            if v == 0 && self.specific_time.is_none() {
                return Err(format!("task '{}' has a zero interval", self.name));
            }
        }
        Ok(())
    }

    /// Compute the next execution time relative to `now`.
    ///
    /// A fixed daily time targets today at that time, or tomorrow if
    /// already passed. Otherwise an already-computed future timestamp
    /// is kept, and failing that the interval is added to the last run
    /// time (or to `now` when the task has never run).
    pub fn compute_next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self.specific_time {
            let today = now.date_naive().and_time(at).and_utc();
            return if today > now {
                today
            } else {
                today + Duration::days(1)
            };
        }

        if let Some(next) = self.next_scheduled_at {
            if next > now {
                return next;
            }
        }

        let value = self.interval_value.unwrap_or(0);
        let unit = self.interval_unit.unwrap_or(IntervalUnit::Minutes);
        let base = self.last_run.unwrap_or(now);
        base + unit.to_duration(value)
    }

    /// Whether the task should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self
                .next_scheduled_at
                .map(|next| next <= now)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn specific_time_already_passed_targets_tomorrow() {
        let task = ScheduledTask::daily("new-cycles", TaskKind::New, parse_specific_time("09:00").unwrap());
        let next = task.compute_next(at(10, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 9, 0, 0).unwrap());
    }

    #[test]
    fn specific_time_later_today_targets_today() {
        let task = ScheduledTask::daily("new-cycles", TaskKind::New, parse_specific_time("09:00").unwrap());
        let next = task.compute_next(at(8, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap());
    }

    #[test]
    fn existing_future_timestamp_is_kept() {
        let mut task =
            ScheduledTask::interval("update-all", TaskKind::Update, 30, IntervalUnit::Minutes);
        task.next_scheduled_at = Some(at(11, 15));
        assert_eq!(task.compute_next(at(10, 0)), at(11, 15));
    }

    #[test]
    fn interval_added_to_last_run() {
        let mut task =
            ScheduledTask::interval("update-all", TaskKind::Update, 2, IntervalUnit::Hours);
        task.last_run = Some(at(10, 0));
        assert_eq!(task.compute_next(at(10, 30)), at(12, 0));
    }

    #[test]
    fn interval_added_to_now_when_never_run() {
        let task =
            ScheduledTask::interval("update-all", TaskKind::Update, 15, IntervalUnit::Minutes);
        assert_eq!(task.compute_next(at(10, 0)), at(10, 15));
    }

    #[test]
    fn is_due_requires_enabled_and_past_timestamp() {
        let mut task =
            ScheduledTask::interval("update-all", TaskKind::Update, 30, IntervalUnit::Minutes);
        assert!(!task.is_due(at(10, 0)));

        task.next_scheduled_at = Some(at(9, 59));
        assert!(task.is_due(at(10, 0)));

        task.enabled = false;
        assert!(!task.is_due(at(10, 0)));
    }

    #[test]
    fn validate_rejects_driverless_task() {
        let task = ScheduledTask {
            interval_value: None,
            interval_unit: None,
            specific_time: None,
            ..ScheduledTask::interval("x", TaskKind::Update, 1, IntervalUnit::Minutes)
        };
        assert!(task.validate().is_err());
    }

    #[test]
    fn parse_specific_time_rejects_garbage() {
        assert!(parse_specific_time("25:99").is_err());
        assert!(parse_specific_time("nope").is_err());
        assert_eq!(
            parse_specific_time("07:30").unwrap(),
            NaiveTime::from_hms_opt(7, 30, 0).unwrap()
        );
    }
}
