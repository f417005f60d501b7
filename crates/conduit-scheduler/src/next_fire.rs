//! Next-fire-time computation (§4.I): interprets `scheduled_time` in the
//! task's timezone and finds the smallest future instant matching the
//! recurrence, returned in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use conduit_store::{Recurrence, ScheduledTask};

#[derive(Debug, thiserror::Error)]
pub enum NextFireError {
    #[error("invalid scheduled_time: {0}")]
    BadTime(String),
    #[error("weekly recurrence requires scheduled_day in 0..=6")]
    BadWeeklyDay,
    #[error("monthly recurrence requires scheduled_day in 1..=31")]
    BadMonthlyDay,
}

fn resolve_tz(name: &str) -> Tz {
    name.parse().unwrap_or(chrono_tz::UTC)
}

fn parse_time(value: &str) -> Result<(u32, u32, u32), NextFireError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 2 {
        return Err(NextFireError::BadTime(value.to_string()));
    }
    let hour: u32 = parts[0].parse().map_err(|_| NextFireError::BadTime(value.to_string()))?;
    let minute: u32 = parts[1].parse().map_err(|_| NextFireError::BadTime(value.to_string()))?;
    let second: u32 = if parts.len() == 3 {
        parts[2].parse().map_err(|_| NextFireError::BadTime(value.to_string()))?
    } else {
        0
    };
    if hour > 23 || minute > 59 || second > 59 {
        return Err(NextFireError::BadTime(value.to_string()));
    }
    Ok((hour, minute, second))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next_month_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month arithmetic");
    let this_month_first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month");
    (next_month_first - this_month_first).num_days() as u32
}

/// `allow_once` mirrors the `once` recurrence's one-shot semantics: once a
/// `once` task has fired, the caller passes `false` so it is never rearmed.
pub fn compute_next_fire(
    recurrence: Recurrence,
    scheduled_time: &str,
    scheduled_day: Option<i64>,
    timezone_name: &str,
    from_utc: DateTime<Utc>,
    allow_once: bool,
) -> Result<Option<DateTime<Utc>>, NextFireError> {
    let tz = resolve_tz(timezone_name);
    let local_now = from_utc.with_timezone(&tz);
    let (hour, minute, second) = parse_time(scheduled_time)?;

    match recurrence {
        Recurrence::Once => {
            if !allow_once {
                return Ok(None);
            }
            let target = local_now
                .date_naive()
                .and_hms_opt(hour, minute, second)
                .and_then(|naive| tz.from_local_datetime(&naive).single())
                .ok_or_else(|| NextFireError::BadTime(scheduled_time.to_string()))?;
            let next_local = if target > local_now { target } else { target + Duration::days(1) };
            Ok(Some(next_local.with_timezone(&Utc)))
        }

        Recurrence::Daily => {
            let target = local_now
                .date_naive()
                .and_hms_opt(hour, minute, second)
                .and_then(|naive| tz.from_local_datetime(&naive).single())
                .ok_or_else(|| NextFireError::BadTime(scheduled_time.to_string()))?;
            let next_local = if target > local_now { target } else { target + Duration::days(1) };
            Ok(Some(next_local.with_timezone(&Utc)))
        }

        Recurrence::Weekly => {
            let day = scheduled_day.ok_or(NextFireError::BadWeeklyDay)?;
            if !(0..=6).contains(&day) {
                return Err(NextFireError::BadWeeklyDay);
            }
            let today_dow = local_now.weekday().num_days_from_monday() as i64;
            let days_ahead = (day - today_dow).rem_euclid(7);
            let target_date = local_now.date_naive() + Duration::days(days_ahead);
            let target = target_date
                .and_hms_opt(hour, minute, second)
                .and_then(|naive| tz.from_local_datetime(&naive).single())
                .ok_or_else(|| NextFireError::BadTime(scheduled_time.to_string()))?;
            let next_local = if target > local_now { target } else { target + Duration::days(7) };
            Ok(Some(next_local.with_timezone(&Utc)))
        }

        Recurrence::Monthly => {
            let day = scheduled_day.ok_or(NextFireError::BadMonthlyDay)?;
            if !(1..=31).contains(&day) {
                return Err(NextFireError::BadMonthlyDay);
            }
            let mut year = local_now.year();
            let mut month = local_now.month();
            let clamp_day = |year: i32, month: u32| -> u32 { (day as u32).min(days_in_month(year, month)) };

            let mut target_day = clamp_day(year, month);
            let mut target = NaiveDate::from_ymd_opt(year, month, target_day)
                .and_then(|d| d.and_hms_opt(hour, minute, second))
                .and_then(|naive| tz.from_local_datetime(&naive).single())
                .ok_or_else(|| NextFireError::BadTime(scheduled_time.to_string()))?;

            if target <= local_now {
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
                target_day = clamp_day(year, month);
                target = NaiveDate::from_ymd_opt(year, month, target_day)
                    .and_then(|d| d.and_hms_opt(hour, minute, second))
                    .and_then(|naive| tz.from_local_datetime(&naive).single())
                    .ok_or_else(|| NextFireError::BadTime(scheduled_time.to_string()))?;
            }
            Ok(Some(target.with_timezone(&Utc)))
        }
    }
}

/// Convenience wrapper over a persisted [`ScheduledTask`], used by the claim
/// loop to rearm a task that just fired. `allow_once` is always `false` here
/// — a task that is firing right now has, by definition, already had its one
/// shot for `once`.
pub fn compute_next_after_fire(task: &ScheduledTask, from_utc: DateTime<Utc>) -> Option<DateTime<Utc>> {
    compute_next_fire(task.recurrence, &task.scheduled_time, task.scheduled_day, &task.timezone, from_utc, false)
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn daily_rolls_to_tomorrow_once_passed() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 10, 0, 0).unwrap();
        let next = compute_next_fire(Recurrence::Daily, "09:00:00", None, "UTC", now, true).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 29, 9, 0, 0).unwrap());
    }

    #[test]
    fn daily_stays_today_if_still_ahead() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 3, 0, 0).unwrap();
        let next = compute_next_fire(Recurrence::Daily, "09:00:00", None, "UTC", now, true).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 28, 9, 0, 0).unwrap());
    }

    #[test]
    fn once_is_not_rearmed() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 10, 0, 0).unwrap();
        let next = compute_next_fire(Recurrence::Once, "09:00:00", None, "UTC", now, false).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn weekly_picks_same_day_if_time_not_passed() {
        // 2026-07-28 is a Tuesday (num_days_from_monday = 1).
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 3, 0, 0).unwrap();
        let next = compute_next_fire(Recurrence::Weekly, "09:00:00", Some(1), "UTC", now, true).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 28, 9, 0, 0).unwrap());
    }

    #[test]
    fn weekly_skips_to_next_week_if_time_passed_today() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 10, 0, 0).unwrap();
        let next = compute_next_fire(Recurrence::Weekly, "09:00:00", Some(1), "UTC", now, true).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 4, 9, 0, 0).unwrap());
    }

    #[test]
    fn monthly_clamps_short_months() {
        // scheduled_day 31, evaluated from January 31 after the time passed -> February clamps to 28.
        let now = Utc.with_ymd_and_hms(2026, 1, 31, 10, 0, 0).unwrap();
        let next = compute_next_fire(Recurrence::Monthly, "09:00:00", Some(31), "UTC", now, true).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 28, 9, 0, 0).unwrap());
    }

    #[test]
    fn weekly_rejects_out_of_range_day() {
        let now = Utc::now();
        let err = compute_next_fire(Recurrence::Weekly, "09:00:00", Some(9), "UTC", now, true).unwrap_err();
        assert!(matches!(err, NextFireError::BadWeeklyDay));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 3, 0, 0).unwrap();
        let next = compute_next_fire(Recurrence::Daily, "09:00:00", None, "Not/AZone", now, true).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 28, 9, 0, 0).unwrap());
    }
}
