//! Cron normalization and tick-window helpers for `cron_tick_passed`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::ConditionEvaluationError;

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
///
/// The `cron` crate requires 6 fields: `sec min hour day-of-month month day-of-week`.
/// Condition definitions use standard 5-field cron.
pub(crate) fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn parse_schedule(expr: &str) -> Result<Schedule, ConditionEvaluationError> {
    Schedule::from_str(&normalize_cron(expr)).map_err(|e| ConditionEvaluationError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn parse_timezone(name: &str) -> Result<Tz, ConditionEvaluationError> {
    name.parse::<Tz>()
        .map_err(|_| ConditionEvaluationError::UnknownTimezone(name.to_string()))
}

/// Whether a scheduled tick, interpreted in `tz`, falls in `(after, until]`.
pub(crate) fn tick_between(
    schedule: &Schedule,
    tz: Tz,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> bool {
    let after_tz = after.with_timezone(&tz);
    let until_tz = until.with_timezone(&tz);
    schedule
        .after(&after_tz)
        .next()
        .map(|t| t <= until_tz)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize_cron("0 9 * * *"), "0 0 9 * * *");
        assert_eq!(normalize_cron(" 0 0 9 * * * "), "0 0 9 * * *");
    }

    #[test]
    fn daily_tick_respects_timezone() {
        let schedule = parse_schedule("0 9 * * *").unwrap();
        let tz = parse_timezone("America/New_York").unwrap();
        // 09:00 New York in January is 14:00 UTC.
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 13, 0, 0).unwrap();
        let before_tick = Utc.with_ymd_and_hms(2024, 1, 10, 13, 59, 0).unwrap();
        let at_tick = Utc.with_ymd_and_hms(2024, 1, 10, 14, 0, 0).unwrap();
        assert!(!tick_between(&schedule, tz, after, before_tick));
        assert!(tick_between(&schedule, tz, after, at_tick));
        assert!(!tick_between(&schedule, tz, at_tick, at_tick));
    }

    #[test]
    fn bad_inputs_are_reported() {
        assert!(matches!(
            parse_schedule("not a cron"),
            Err(ConditionEvaluationError::InvalidCron { .. })
        ));
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(ConditionEvaluationError::UnknownTimezone(_))
        ));
    }
}
