//! Schedule variants and next-occurrence resolution.
//!
//! Every variant resolves through [`Schedule::next_after`], which returns the
//! first occurrence strictly after the reference instant, `None` when the
//! schedule has no further occurrences, or an error when the schedule itself
//! is unusable. All arithmetic is UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Months searched by the monthly resolver before giving up (10 years).
const MONTHLY_SEARCH_HORIZON: u32 = 120;

/// When and how often a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire once at an absolute instant.
    OneTime { at: DateTime<Utc> },

    /// Fire at `start` and then every `interval_secs`, optionally capped at
    /// `max_runs` occurrences in total.
    FixedInterval {
        start: DateTime<Utc>,
        interval_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_runs: Option<u32>,
    },

    /// Fire once a month on `day` (clamped to the month's last day).
    Monthly { day: u32, hour: u32, minute: u32 },

    /// Fire every day at `hour:minute`.
    Daily { hour: u32, minute: u32 },

    /// Fire on `weekday` at `hour:minute`.
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },

    /// Fire according to a cron expression (5 or 6/7 fields).
    Cron { expression: String },
}

/// Lightweight identifier for a schedule variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    OneTime,
    FixedInterval,
    Monthly,
    Daily,
    Weekly,
    Cron,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleKind::OneTime => "one_time",
            ScheduleKind::FixedInterval => "fixed_interval",
            ScheduleKind::Monthly => "monthly",
            ScheduleKind::Daily => "daily",
            ScheduleKind::Weekly => "weekly",
            ScheduleKind::Cron => "cron",
        };
        write!(f, "{s}")
    }
}

impl Schedule {
    /// The variant tag.
    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::OneTime { .. } => ScheduleKind::OneTime,
            Schedule::FixedInterval { .. } => ScheduleKind::FixedInterval,
            Schedule::Monthly { .. } => ScheduleKind::Monthly,
            Schedule::Daily { .. } => ScheduleKind::Daily,
            Schedule::Weekly { .. } => ScheduleKind::Weekly,
            Schedule::Cron { .. } => ScheduleKind::Cron,
        }
    }

    /// Whether the schedule can produce more than one occurrence.
    pub fn is_recurring(&self) -> bool {
        match self {
            Schedule::OneTime { .. } => false,
            Schedule::FixedInterval { max_runs, .. } => max_runs.is_none_or(|m| m > 1),
            _ => true,
        }
    }

    /// Check field ranges without resolving an occurrence.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Schedule::OneTime { .. } => Ok(()),
            Schedule::FixedInterval {
                interval_secs,
                max_runs,
                ..
            } => {
                if *interval_secs == 0 {
                    return Err(ScheduleError::InvalidInterval);
                }
                if *max_runs == Some(0) {
                    return Err(ScheduleError::InvalidInterval);
                }
                Ok(())
            }
            Schedule::Monthly { day, hour, minute } => {
                if !(1..=31).contains(day) {
                    return Err(ScheduleError::InvalidTime(format!(
                        "day {day} is outside 1..=31"
                    )));
                }
                check_time_of_day(*hour, *minute)
            }
            Schedule::Daily { hour, minute } | Schedule::Weekly { hour, minute, .. } => {
                check_time_of_day(*hour, *minute)
            }
            Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Schedule::OneTime { at } => Ok((*at > after).then_some(*at)),

            Schedule::FixedInterval {
                start,
                interval_secs,
                max_runs,
            } => next_fixed_interval(*start, *interval_secs, *max_runs, after),

            Schedule::Monthly { day, hour, minute } => {
                check_time_of_day(*hour, *minute)?;
                next_monthly(*day, *hour, *minute, after).map(Some)
            }

            Schedule::Daily { hour, minute } => {
                check_time_of_day(*hour, *minute)?;
                let candidate = at_time_of_day(after.date_naive(), *hour, *minute)?;
                if candidate > after {
                    Ok(Some(candidate))
                } else {
                    Ok(Some(candidate + Duration::days(1)))
                }
            }

            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => {
                check_time_of_day(*hour, *minute)?;
                let current = after.weekday().num_days_from_monday() as i64;
                let target = weekday.num_days_from_monday() as i64;
                let days_until = (target - current + 7) % 7;
                let date = after.date_naive() + Duration::days(days_until);
                let candidate = at_time_of_day(date, *hour, *minute)?;
                if candidate > after {
                    Ok(Some(candidate))
                } else {
                    // Same weekday, earlier time: next week's occurrence.
                    Ok(Some(candidate + Duration::days(7)))
                }
            }

            Schedule::Cron { expression } => {
                let schedule = parse_cron(expression)?;
                Ok(schedule.after(&after).next())
            }
        }
    }
}

fn next_fixed_interval(
    start: DateTime<Utc>,
    interval_secs: u64,
    max_runs: Option<u32>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    if interval_secs == 0 {
        return Err(ScheduleError::InvalidInterval);
    }
    let max_runs = max_runs.filter(|m| *m > 0).map(u64::from);

    if after < start {
        return Ok(Some(start));
    }

    let elapsed = (after - start).num_seconds() as u64;
    let passed = elapsed / interval_secs;
    // Occurrence `k` (0-based) lands at start + k * interval; the next one is
    // `passed + 1`, i.e. the `passed + 2`-th run overall.
    let next_index = passed + 1;
    if max_runs.is_some_and(|max| next_index + 1 > max) {
        return Ok(None);
    }

    let offset = next_index
        .checked_mul(interval_secs)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(Duration::try_seconds)
        .ok_or(ScheduleError::SearchExhausted)?;
    start
        .checked_add_signed(offset)
        .map(Some)
        .ok_or(ScheduleError::SearchExhausted)
}

fn next_monthly(
    day: u32,
    hour: u32,
    minute: u32,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    if !(1..=31).contains(&day) {
        return Err(ScheduleError::InvalidTime(format!(
            "day {day} is outside 1..=31"
        )));
    }

    let (mut year, mut month) = (after.year(), after.month());
    for _ in 0..MONTHLY_SEARCH_HORIZON {
        let clamped = day.min(days_in_month(year, month)?);
        let date = NaiveDate::from_ymd_opt(year, month, clamped)
            .ok_or_else(|| ScheduleError::InvalidTime(format!("{year}-{month}-{clamped}")))?;
        let candidate = at_time_of_day(date, hour, minute)?;
        if candidate > after {
            return Ok(candidate);
        }
        (year, month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
    }
    Err(ScheduleError::SearchExhausted)
}

fn days_in_month(year: i32, month: u32) -> Result<u32, ScheduleError> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .ok_or(ScheduleError::SearchExhausted)
}

fn at_time_of_day(date: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Utc>, ScheduleError> {
    date.and_hms_opt(hour, minute, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| ScheduleError::InvalidTime(format!("{hour:02}:{minute:02}")))
}

fn check_time_of_day(hour: u32, minute: u32) -> Result<(), ScheduleError> {
    if hour > 23 || minute > 59 {
        return Err(ScheduleError::InvalidTime(format!("{hour:02}:{minute:02}")));
    }
    Ok(())
}

/// Parse a cron expression, accepting the classic 5-field form by
/// prepending a zero seconds field.
fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_one_time_fires_only_when_in_future() {
        let at = utc(2025, 12, 17, 18, 10);
        let schedule = Schedule::OneTime { at };

        assert_eq!(schedule.next_after(at - Duration::seconds(1)).unwrap(), Some(at));
        assert_eq!(schedule.next_after(at).unwrap(), None);
        assert!(!schedule.is_recurring());
    }

    #[test]
    fn test_fixed_interval_before_start_returns_start() {
        let start = utc(2025, 1, 1, 0, 0);
        let schedule = Schedule::FixedInterval {
            start,
            interval_secs: 60,
            max_runs: None,
        };
        assert_eq!(
            schedule.next_after(start - Duration::hours(1)).unwrap(),
            Some(start)
        );
        assert_eq!(
            schedule.next_after(start).unwrap(),
            Some(start + Duration::seconds(60))
        );
    }

    #[test]
    fn test_fixed_interval_zero_is_invalid() {
        let schedule = Schedule::FixedInterval {
            start: utc(2025, 1, 1, 0, 0),
            interval_secs: 0,
            max_runs: None,
        };
        assert_eq!(
            schedule.next_after(Utc::now()),
            Err(ScheduleError::InvalidInterval)
        );
        assert_eq!(schedule.validate(), Err(ScheduleError::InvalidInterval));
    }

    #[test]
    fn test_fixed_interval_max_runs_caps_total_occurrences() {
        let start = utc(2025, 1, 1, 0, 0);
        let schedule = Schedule::FixedInterval {
            start,
            interval_secs: 60,
            max_runs: Some(3),
        };

        let mut runs = Vec::new();
        let mut cursor = start - Duration::seconds(1);
        while let Some(next) = schedule.next_after(cursor).unwrap() {
            runs.push(next);
            cursor = next;
        }

        assert_eq!(
            runs,
            vec![
                start,
                start + Duration::seconds(60),
                start + Duration::seconds(120)
            ]
        );
        assert!(schedule.is_recurring());
    }

    #[test]
    fn test_fixed_interval_single_run_is_not_recurring() {
        let schedule = Schedule::FixedInterval {
            start: utc(2025, 1, 1, 0, 0),
            interval_secs: 60,
            max_runs: Some(1),
        };
        assert!(!schedule.is_recurring());
    }

    #[test]
    fn test_daily_fired_at_time_rearms_next_day() {
        let fired = utc(2025, 3, 10, 9, 30);
        let schedule = Schedule::Daily {
            hour: 9,
            minute: 30,
        };
        assert_eq!(
            schedule.next_after(fired).unwrap(),
            Some(fired + Duration::hours(24))
        );
    }

    #[test]
    fn test_daily_later_today() {
        let schedule = Schedule::Daily {
            hour: 18,
            minute: 0,
        };
        assert_eq!(
            schedule.next_after(utc(2025, 3, 10, 9, 30)).unwrap(),
            Some(utc(2025, 3, 10, 18, 0))
        );
    }

    #[test]
    fn test_weekly_same_day_earlier_time_moves_a_week() {
        // 2025-03-10 is a Monday.
        let schedule = Schedule::Weekly {
            weekday: Weekday::Mon,
            hour: 8,
            minute: 0,
        };
        assert_eq!(
            schedule.next_after(utc(2025, 3, 10, 9, 0)).unwrap(),
            Some(utc(2025, 3, 17, 8, 0))
        );
    }

    #[test]
    fn test_weekly_later_in_week() {
        let schedule = Schedule::Weekly {
            weekday: Weekday::Fri,
            hour: 17,
            minute: 45,
        };
        assert_eq!(
            schedule.next_after(utc(2025, 3, 10, 9, 0)).unwrap(),
            Some(utc(2025, 3, 14, 17, 45))
        );
    }

    #[test]
    fn test_monthly_day_31_clamps_to_end_of_february() {
        let schedule = Schedule::Monthly {
            day: 31,
            hour: 12,
            minute: 0,
        };
        // Fired on January 31st; the next occurrence is the last day of February.
        assert_eq!(
            schedule.next_after(utc(2025, 1, 31, 12, 0)).unwrap(),
            Some(utc(2025, 2, 28, 12, 0))
        );
        // Leap year.
        assert_eq!(
            schedule.next_after(utc(2024, 2, 1, 0, 0)).unwrap(),
            Some(utc(2024, 2, 29, 12, 0))
        );
    }

    #[test]
    fn test_monthly_rolls_over_year() {
        let schedule = Schedule::Monthly {
            day: 5,
            hour: 0,
            minute: 0,
        };
        assert_eq!(
            schedule.next_after(utc(2025, 12, 6, 0, 0)).unwrap(),
            Some(utc(2026, 1, 5, 0, 0))
        );
    }

    #[test]
    fn test_cron_five_field_expression() {
        let schedule = Schedule::Cron {
            expression: "*/15 * * * *".to_string(),
        };
        assert_eq!(
            schedule.next_after(utc(2025, 3, 10, 9, 1)).unwrap(),
            Some(utc(2025, 3, 10, 9, 15))
        );
        assert!(schedule.validate().is_ok());
    }

    #[test]
    fn test_cron_unparseable_is_an_error() {
        let schedule = Schedule::Cron {
            expression: "not a cron".to_string(),
        };
        assert!(matches!(
            schedule.next_after(Utc::now()),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_time() {
        assert!(Schedule::Daily { hour: 24, minute: 0 }.validate().is_err());
        assert!(Schedule::Daily { hour: 0, minute: 60 }.validate().is_err());
        assert!(
            Schedule::Monthly {
                day: 0,
                hour: 0,
                minute: 0
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_schedule_serde_is_tagged() {
        let schedule = Schedule::Weekly {
            weekday: Weekday::Tue,
            hour: 6,
            minute: 15,
        };
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["kind"], "weekly");
        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }

    proptest! {
        // Every recurring variant resolves strictly after the reference.
        #[test]
        fn next_is_strictly_after_reference(
            offset_mins in 0i64..(60 * 24 * 400),
            hour in 0u32..24,
            minute in 0u32..60,
            day in 1u32..=31,
        ) {
            let reference = utc(2024, 1, 1, 0, 0) + Duration::minutes(offset_mins);
            let schedules = [
                Schedule::Daily { hour, minute },
                Schedule::Weekly { weekday: Weekday::Wed, hour, minute },
                Schedule::Monthly { day, hour, minute },
            ];
            for schedule in schedules {
                let next = schedule.next_after(reference).unwrap().unwrap();
                prop_assert!(next > reference, "{:?} produced {} for {}", schedule, next, reference);
            }
        }

        // Daily occurrences are never more than a day away.
        #[test]
        fn daily_within_one_day(offset_mins in 0i64..(60 * 24 * 400), hour in 0u32..24, minute in 0u32..60) {
            let reference = utc(2024, 1, 1, 0, 0) + Duration::minutes(offset_mins);
            let next = Schedule::Daily { hour, minute }.next_after(reference).unwrap().unwrap();
            prop_assert!(next - reference <= Duration::days(1));
        }

        // Fixed-interval occurrences stay on the start + k * interval grid.
        #[test]
        fn fixed_interval_stays_on_grid(
            interval_secs in 1u64..86_400,
            offset_secs in 0i64..10_000_000,
        ) {
            let start = utc(2024, 6, 1, 0, 0);
            let schedule = Schedule::FixedInterval { start, interval_secs, max_runs: None };
            let reference = start + Duration::seconds(offset_secs);
            let next = schedule.next_after(reference).unwrap().unwrap();

            prop_assert!(next > reference);
            prop_assert!(next - reference <= Duration::seconds(interval_secs as i64));
            prop_assert_eq!((next - start).num_seconds() as u64 % interval_secs, 0);
        }
    }
}
