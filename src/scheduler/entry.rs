//! Schedule entry types and next-fire computation.
//!
//! Expressions and timezones are validated when a spec is built; by the
//! time an entry reaches the tick loop its schedule is known-parseable.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::types::ChannelId;

/// When a schedule entry fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Fire exactly once at the given instant, then disable.
    Once { at: DateTime<Utc> },
    /// Fire on a cron expression, evaluated in the given timezone.
    Recurring { expr: String, timezone: Tz },
}

impl ScheduleSpec {
    /// Build a one-shot spec.
    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    /// Build a recurring spec, validating the expression and timezone.
    pub fn recurring(expr: &str, timezone: &str) -> Result<Self, ScheduleError> {
        parse_expression(expr)?;
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::UnknownTimezone {
                tz: timezone.to_string(),
            })?;
        Ok(Self::Recurring {
            expr: expr.to_string(),
            timezone: tz,
        })
    }

    /// Next fire time strictly after `after`, or `None` when no future
    /// fire exists (a past one-shot, or an exhausted cron).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once { at } => (*at > after).then_some(*at),
            Self::Recurring { expr, timezone } => {
                let schedule = parse_expression(expr).ok()?;
                let local = after.with_timezone(timezone);
                schedule
                    .after(&local)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Recurring { .. })
    }
}

/// Parse a cron expression. The `cron` crate wants 7 fields
/// (sec min hour dom month dow year); operators usually write 5
/// (min hour dom month dow), so pad with seconds and year.
pub(crate) fn parse_expression(expr: &str) -> Result<Schedule, ScheduleError> {
    expr.parse::<Schedule>()
        .or_else(|_| format!("0 {expr} *").parse::<Schedule>())
        .map_err(|e| ScheduleError::InvalidExpression {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

/// A scheduled outgoing message with its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub channel: ChannelId,
    pub message: String,
    pub spec: ScheduleSpec,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Send failures inside the current rolling day window.
    #[serde(default)]
    pub failures_today: u32,
    #[serde(default)]
    pub failure_window_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn new(channel: ChannelId, message: String, spec: ScheduleSpec) -> Self {
        let next_run_at = match &spec {
            ScheduleSpec::Once { at } => Some(*at),
            ScheduleSpec::Recurring { .. } => spec.next_after(Utc::now()),
        };
        Self {
            id: Uuid::new_v4(),
            channel,
            message,
            spec,
            enabled: true,
            last_run_at: None,
            next_run_at,
            failures_today: 0,
            failure_window_start: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Convenience constructor for a one-shot entry.
    pub fn once(channel: ChannelId, message: String, at: DateTime<Utc>) -> Self {
        Self::new(channel, message, ScheduleSpec::once(at))
    }

    /// Whether the entry is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn five_field_expression_is_padded() {
        assert!(parse_expression("0 9 * * *").is_ok());
        assert!(parse_expression("*/5 * * * *").is_ok());
    }

    #[test]
    fn seven_field_expression_parses_directly() {
        assert!(parse_expression("0 0 9 * * * *").is_ok());
    }

    #[test]
    fn malformed_expression_rejected() {
        let err = ScheduleSpec::recurring("not a cron", "UTC").unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidExpression { .. }));
    }

    #[test]
    fn unknown_timezone_rejected() {
        let err = ScheduleSpec::recurring("0 9 * * *", "Mars/Olympus").unwrap_err();
        assert!(matches!(err, ScheduleError::UnknownTimezone { .. }));
    }

    #[test]
    fn once_next_after() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let spec = ScheduleSpec::once(at);

        let before = at - chrono::Duration::hours(1);
        assert_eq!(spec.next_after(before), Some(at));

        // At or past the fire time there is no future fire.
        assert_eq!(spec.next_after(at), None);
        assert_eq!(spec.next_after(at + chrono::Duration::seconds(1)), None);
    }

    #[test]
    fn hourly_next_fire_is_strictly_future() {
        let spec = ScheduleSpec::recurring("0 * * * *", "UTC").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let next = spec.next_after(now).unwrap();
        assert!(next > now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn timezone_shifts_fire_time() {
        // 9:00 Paris = 08:00 UTC in winter (CET = UTC+1).
        let spec = ScheduleSpec::recurring("0 9 * * *", "Europe/Paris").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let next = spec.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap());
    }

    #[test]
    fn new_entry_computes_first_fire() {
        let entry = ScheduleEntry::new(
            ChannelId::from("c"),
            "standup time".into(),
            ScheduleSpec::recurring("0 9 * * *", "UTC").unwrap(),
        );
        assert!(entry.enabled);
        assert!(entry.next_run_at.unwrap() > Utc::now());
        assert!(entry.last_run_at.is_none());
    }

    #[test]
    fn due_check() {
        let now = Utc::now();
        let mut entry =
            ScheduleEntry::once(ChannelId::from("c"), "hi".into(), now - chrono::Duration::seconds(1));
        assert!(entry.is_due(now));

        entry.enabled = false;
        assert!(!entry.is_due(now));

        let future = ScheduleEntry::once(
            ChannelId::from("c"),
            "hi".into(),
            now + chrono::Duration::hours(1),
        );
        assert!(!future.is_due(now));
    }

    #[test]
    fn spec_serde_roundtrip() {
        let spec = ScheduleSpec::recurring("0 9 * * MON-FRI", "Europe/Paris").unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: ScheduleSpec = serde_json::from_str(&json).unwrap();
        match parsed {
            ScheduleSpec::Recurring { expr, timezone } => {
                assert_eq!(expr, "0 9 * * MON-FRI");
                assert_eq!(timezone, chrono_tz::Europe::Paris);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
