//! Cron schedule parsing and next-run calculation.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use super::SchedulerError;

/// A parsed cron expression, evaluated in UTC.
///
/// Accepts the `cron` crate's 6/7-field form (`sec min hour dom month dow [year]`)
/// and standard 5-field Unix expressions, which run at second 0.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let widened = widen_unix_expression(expression.trim());
        let schedule = Schedule::from_str(&widened).map_err(|e| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// How long to sleep from `now` until the next fire time.
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(now)?;
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

// 5-field Unix cron (min hour dom month dow) -> 7-field (sec ... year).
fn widen_unix_expression(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression} *")
    } else {
        expression.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_are_widened() {
        assert_eq!(widen_unix_expression("*/10 * * * *"), "0 */10 * * * * *");
        assert_eq!(widen_unix_expression("0 */10 * * * *"), "0 */10 * * * *");
    }

    #[test]
    fn every_ten_minutes_fires_on_the_next_boundary() {
        let schedule = CronSchedule::parse("0 */10 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 3, 30).unwrap();

        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 10, 0).unwrap())
        );
        assert_eq!(schedule.until_next(now), Some(Duration::from_secs(390)));
    }

    #[test]
    fn unix_form_matches_extended_form() {
        let unix = CronSchedule::parse("*/10 * * * *").unwrap();
        let extended = CronSchedule::parse("0 */10 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 23, 55, 1).unwrap();

        assert_eq!(unix.next_after(now), extended.next_after(now));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = CronSchedule::parse("every ten minutes").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    }
}
