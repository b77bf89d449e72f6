//! Cron-like reset schedule: `next(now)` / `last(now)` (spec §4.5, §9).

use cron::Schedule;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

#[derive(Clone)]
pub struct ResetSchedule {
    expression: String,
    schedule: Schedule,
}

impl ResetSchedule {
    pub fn parse(expression: &str) -> CoreResult<Self> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| CoreError::BadInput(format!("invalid reset schedule: {e}")))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next reset epoch second strictly after `now`.
    pub fn next(&self, now: i64) -> i64 {
        let after = chrono::DateTime::from_timestamp(now, 0).expect("valid timestamp");
        self.schedule
            .after(&after)
            .next()
            .map(|dt| dt.timestamp())
            .unwrap_or(i64::MAX)
    }

    /// Previous reset epoch second at or before `now`.
    pub fn last(&self, now: i64) -> i64 {
        let at = chrono::DateTime::from_timestamp(now, 0).expect("valid timestamp");
        self.schedule
            .after(&at)
            .next_back()
            .map(|dt| dt.timestamp())
            .unwrap_or(i64::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_midnight_schedule_advances() {
        // seconds minutes hours day-of-month month day-of-week (cron crate's
        // 6/7-field format, includes seconds).
        let schedule = ResetSchedule::parse("0 0 0 * * *").unwrap();
        let now = 1_700_000_000; // arbitrary epoch second
        let next = schedule.next(now);
        assert!(next > now);
        let last = schedule.last(now);
        assert!(last <= now);
    }

    #[test]
    fn bad_expression_rejected() {
        assert!(ResetSchedule::parse("not a cron expression").is_err());
    }
}
