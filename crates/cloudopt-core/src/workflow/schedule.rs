//! Trigger evaluation for scheduled workflows: five-field cron expressions,
//! one-shot times and fixed intervals.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CloudoptError, Result};

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

/// A parsed `minute hour day-of-month month day-of-week` expression.
///
/// Each field accepts `*`, single values, `a-b` ranges, `/n` steps and
/// comma lists. Day-of-week runs 0-7 with both 0 and 7 meaning Sunday.
/// When day-of-month and day-of-week are both restricted a day matching
/// either one matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(CloudoptError::InvalidWorkflow(format!(
                "cron {expr:?}: expected 5 fields, got {}",
                fields.len()
            )));
        };
        let mut days_of_week = parse_field(dow, 0, 7, expr)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }
        Ok(Self {
            minutes: parse_field(minute, 0, 59, expr)?,
            hours: parse_field(hour, 0, 23, expr)?,
            days_of_month: parse_field(dom, 1, 31, expr)?,
            months: parse_field(month, 1, 12, expr)?,
            days_of_week,
            dom_restricted: *dom != "*",
            dow_restricted: *dow != "*",
        })
    }

    /// Whether the minute containing `at` matches.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let bit = |set: u64, v: u32| set & (1u64 << v) != 0;
        let dom = bit(self.days_of_month, at.day());
        let dow = bit(self.days_of_week, at.weekday().num_days_from_sunday());
        let day = if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        };
        bit(self.minutes, at.minute()) && bit(self.hours, at.hour()) && bit(self.months, at.month()) && day
    }

    /// Latest matching minute in `(after, until]`, looking back at most a day.
    pub fn last_match_in(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut at = truncate_to_minute(until);
        let floor = after.max(until - Duration::days(1));
        while at > floor {
            if self.matches(at) {
                return Some(at);
            }
            at -= Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32, expr: &str) -> Result<u64> {
    let invalid = |why: &str| {
        CloudoptError::InvalidWorkflow(format!("cron {expr:?}: field {field:?} {why}"))
    };
    let number = |s: &str| -> Result<u32> {
        let v: u32 = s.parse().map_err(|_| invalid("is not a number"))?;
        if v < min || v > max {
            return Err(invalid(&format!("value {v} outside {min}-{max}")));
        }
        Ok(v)
    };

    let mut set = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("has a bad step"))?;
                if step == 0 {
                    return Err(invalid("has a zero step"));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (number(a)?, number(b)?)
        } else {
            let v = number(range)?;
            // `5/15` means every 15 starting at 5.
            (v, if part.contains('/') { max } else { v })
        };
        if lo > hi {
            return Err(invalid("has a reversed range"));
        }
        for v in (lo..=hi).step_by(step as usize) {
            set |= 1u64 << v;
        }
    }
    Ok(set)
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

// ---------------------------------------------------------------------------
// TriggerConfig
// ---------------------------------------------------------------------------

/// Schedule of a `scheduled` workflow. The first field set wins, in the
/// order `cron`, `time`, `interval_hours`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// One-shot run time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_hours: Option<f64>,
    /// Stamped each time the scheduler starts a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
}

impl TriggerConfig {
    pub fn is_empty(&self) -> bool {
        self.cron.is_none() && self.time.is_none() && self.interval_hours.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(CloudoptError::InvalidWorkflow(
                "scheduled workflow needs cron, time or interval_hours".to_string(),
            ));
        }
        if let Some(cron) = &self.cron {
            CronSchedule::parse(cron)?;
        }
        if let Some(hours) = self.interval_hours {
            if !(hours.is_finite() && hours > 0.0) {
                return Err(CloudoptError::InvalidWorkflow(format!(
                    "interval_hours must be positive, got {hours}"
                )));
            }
        }
        Ok(())
    }

    /// Whether a run should start at `now`. `window` is the tolerance either
    /// side of a `time` trigger. `since` is when the workflow was created; a
    /// cron trigger that never ran catches up on a match from its creation
    /// minute onward.
    pub fn is_due(&self, now: DateTime<Utc>, window: Duration, since: DateTime<Utc>) -> bool {
        if let Some(expr) = &self.cron {
            let Ok(cron) = CronSchedule::parse(expr) else {
                return false;
            };
            let after = self
                .last_execution
                .unwrap_or_else(|| since - Duration::minutes(1));
            return cron.last_match_in(after, now).is_some();
        }
        if let Some(time) = self.time {
            let in_window = (now - time).abs() <= window;
            let already_ran = self.last_execution.is_some_and(|last| last >= time - window);
            return in_window && !already_ran;
        }
        if let Some(hours) = self.interval_hours {
            return match self.last_execution {
                None => true,
                Some(last) => {
                    let elapsed = (now - last).num_seconds() as f64 / 3600.0;
                    elapsed >= hours
                }
            };
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_lists_ranges_and_steps() {
        let c = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
        // 2024-06-10 is a Monday.
        assert!(c.matches(at(2024, 6, 10, 9, 0)));
        assert!(c.matches(at(2024, 6, 10, 17, 45)));
        assert!(!c.matches(at(2024, 6, 10, 9, 10)));
        assert!(!c.matches(at(2024, 6, 10, 18, 0)));
        // Saturday.
        assert!(!c.matches(at(2024, 6, 15, 9, 0)));

        let list = CronSchedule::parse("0,30 0 1 1,7 *").unwrap();
        assert!(list.matches(at(2024, 7, 1, 0, 30)));
        assert!(!list.matches(at(2024, 8, 1, 0, 30)));
    }

    #[test]
    fn sunday_is_zero_and_seven() {
        let zero = CronSchedule::parse("0 0 * * 0").unwrap();
        let seven = CronSchedule::parse("0 0 * * 7").unwrap();
        let sunday = at(2024, 6, 16, 0, 0);
        assert!(zero.matches(sunday) && seven.matches(sunday));
        assert_eq!(zero, seven);
    }

    #[test]
    fn restricted_dom_and_dow_match_either() {
        // The 1st of the month or any Monday.
        let c = CronSchedule::parse("0 12 1 * 1").unwrap();
        assert!(c.matches(at(2024, 6, 1, 12, 0)));
        assert!(c.matches(at(2024, 6, 10, 12, 0)));
        assert!(!c.matches(at(2024, 6, 11, 12, 0)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["* * * *", "60 * * * *", "*/0 * * * *", "5-1 * * * *", "a * * * *"] {
            assert!(CronSchedule::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn offset_step_runs_to_field_max() {
        let c = CronSchedule::parse("5/20 * * * *").unwrap();
        assert!(c.matches(at(2024, 1, 1, 0, 5)));
        assert!(c.matches(at(2024, 1, 1, 0, 45)));
        assert!(!c.matches(at(2024, 1, 1, 0, 0)));
    }

    #[test]
    fn cron_due_since_last_execution() {
        let trigger = TriggerConfig {
            cron: Some("0 * * * *".into()),
            last_execution: Some(at(2024, 6, 10, 8, 0)),
            ..Default::default()
        };
        let window = Duration::minutes(5);
        let created = at(2024, 6, 1, 0, 0);
        assert!(!trigger.is_due(at(2024, 6, 10, 8, 30), window, created));
        assert!(trigger.is_due(at(2024, 6, 10, 9, 2), window, created));
    }

    #[test]
    fn cron_that_never_ran_catches_up_from_creation() {
        let never_ran = TriggerConfig {
            cron: Some("0 * * * *".into()),
            ..Default::default()
        };
        let window = Duration::minutes(5);

        // Created in the matching minute: due right away.
        let created = at(2024, 6, 10, 9, 0) + Duration::seconds(30);
        assert!(never_ran.is_due(at(2024, 6, 10, 9, 0) + Duration::seconds(45), window, created));

        // A tick that lands after the matching minute still fires.
        let created = at(2024, 6, 10, 8, 40);
        assert!(!never_ran.is_due(at(2024, 6, 10, 8, 59), window, created));
        assert!(never_ran.is_due(at(2024, 6, 10, 9, 1), window, created));
        assert!(never_ran.is_due(at(2024, 6, 10, 9, 7), window, created));

        // Matches before creation do not count.
        let created = at(2024, 6, 10, 9, 10);
        assert!(!never_ran.is_due(at(2024, 6, 10, 9, 30), window, created));
    }

    #[test]
    fn time_trigger_fires_once_inside_window() {
        let time = at(2024, 6, 10, 12, 0);
        let mut trigger = TriggerConfig {
            time: Some(time),
            ..Default::default()
        };
        let window = Duration::minutes(5);
        let created = at(2024, 6, 1, 0, 0);
        assert!(trigger.is_due(at(2024, 6, 10, 12, 4), window, created));
        assert!(!trigger.is_due(at(2024, 6, 10, 12, 6), window, created));
        trigger.last_execution = Some(at(2024, 6, 10, 11, 58));
        assert!(!trigger.is_due(at(2024, 6, 10, 12, 1), window, created));
    }

    #[test]
    fn interval_trigger() {
        let mut trigger = TriggerConfig {
            interval_hours: Some(6.0),
            ..Default::default()
        };
        let window = Duration::minutes(5);
        let created = at(2024, 6, 1, 0, 0);
        assert!(trigger.is_due(at(2024, 6, 10, 0, 0), window, created));
        trigger.last_execution = Some(at(2024, 6, 10, 0, 0));
        assert!(!trigger.is_due(at(2024, 6, 10, 5, 59), window, created));
        assert!(trigger.is_due(at(2024, 6, 10, 6, 0), window, created));
    }

    #[test]
    fn validation() {
        assert!(TriggerConfig::default().validate().is_err());
        let bad_interval = TriggerConfig {
            interval_hours: Some(0.0),
            ..Default::default()
        };
        assert!(bad_interval.validate().is_err());
        let bad_cron = TriggerConfig {
            cron: Some("nope".into()),
            ..Default::default()
        };
        assert!(bad_cron.validate().is_err());
    }
}
