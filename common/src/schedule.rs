// Trigger schedule calculation
//
// Computes the next fire time for every trigger mode: Interval, Daily, Cron
// and OnDemand. Daily and Cron are evaluated in their own timezone.

use crate::errors::ScheduleError;
use crate::models::Schedule;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// ScheduleTrigger defines how the next run time is derived from a schedule
pub trait ScheduleTrigger {
    /// Next fire time strictly after `after`; `None` when the schedule never fires by itself
    fn next_fire_time(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError>;
}

impl ScheduleTrigger for Schedule {
    fn next_fire_time(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Schedule::Interval { interval_seconds } => {
                Ok(Some(after + Duration::seconds(*interval_seconds as i64)))
            }
            Schedule::Daily { time, timezone } => {
                let time = parse_time_of_day(time)?;
                next_daily(time, *timezone, after).map(Some)
            }
            Schedule::Cron {
                expression,
                timezone,
            } => {
                let schedule = parse_cron_expression(expression)?;
                let reference = after.with_timezone(timezone);
                let next = schedule.after(&reference).next().ok_or_else(|| {
                    ScheduleError::NoNextExecution {
                        schedule_type: "cron".to_string(),
                    }
                })?;
                Ok(Some(next.with_timezone(&Utc)))
            }
            Schedule::OnDemand => Ok(None),
        }
    }
}

/// Check a schedule without computing anything from the clock
pub fn validate(schedule: &Schedule) -> Result<(), ScheduleError> {
    match schedule {
        Schedule::Interval { interval_seconds } if *interval_seconds == 0 => Err(
            ScheduleError::InvalidConfiguration("interval_seconds must be greater than 0".to_string()),
        ),
        Schedule::Interval { .. } | Schedule::OnDemand => Ok(()),
        Schedule::Daily { time, .. } => parse_time_of_day(time).map(|_| ()),
        Schedule::Cron { expression, .. } => parse_cron_expression(expression).map(|_| ()),
    }
}

/// Parse and validate a cron expression (seconds-precision, `cron` crate syntax)
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `HH:MM`
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| ScheduleError::InvalidTimeOfDay(value.to_string()))
}

fn next_daily(time: NaiveTime, timezone: Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let mut date = after.with_timezone(&timezone).date_naive();
    // A wall-clock time can fall into a DST gap; try the following days
    for _ in 0..3 {
        if let Some(local) = timezone.from_local_datetime(&date.and_time(time)).earliest() {
            let candidate = local.with_timezone(&Utc);
            if candidate > after {
                return Ok(candidate);
            }
        }
        date = date.succ_opt().ok_or_else(|| ScheduleError::NoNextExecution {
            schedule_type: "daily".to_string(),
        })?;
    }
    Err(ScheduleError::NoNextExecution {
        schedule_type: "daily".to_string(),
    })
}
