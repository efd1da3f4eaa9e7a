//! Lightweight cron expression evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field forms: *, */N, N, N-M, and comma lists of those.
//! DOW is 0-6 with 0=Sunday (7 accepted as Sunday).
//!
//! Expressions are evaluated in the campaign's IANA timezone, so
//! "0 8 * * *" means 08:00 local across DST transitions.

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

/// Parse a cron expression, or explain why it is malformed.
pub fn parse(expression: &str) -> Result<CronExpr, String> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
        return Err(format!(
            "need 5 fields (MIN HOUR DOM MON DOW), got {}",
            parts.len()
        ));
    }

    let minutes = parse_field(parts[0], 0, 59).ok_or_else(|| bad_field("minute", parts[0]))?;
    let hours = parse_field(parts[1], 0, 23).ok_or_else(|| bad_field("hour", parts[1]))?;
    let days_of_month =
        parse_field(parts[2], 1, 31).ok_or_else(|| bad_field("day-of-month", parts[2]))?;
    let months = parse_field(parts[3], 1, 12).ok_or_else(|| bad_field("month", parts[3]))?;
    // 7 is accepted as Sunday alongside 0.
    let days_of_week = parse_field(parts[4], 0, 7)
        .map(|days| {
            let mut days: Vec<u32> = days.into_iter().map(|d| d % 7).collect();
            days.sort_unstable();
            days.dedup();
            days
        })
        .ok_or_else(|| bad_field("day-of-week", parts[4]))?;

    Ok(CronExpr {
        minutes,
        hours,
        days_of_month,
        months,
        days_of_week,
        dom_restricted: parts[2] != "*",
        dow_restricted: parts[4] != "*",
    })
}

fn bad_field(name: &str, value: &str) -> String {
    format!("invalid {name} field '{value}'")
}

impl CronExpr {
    /// Standard cron day semantics: when both DOM and DOW are
    /// restricted, a date matches if either matches.
    fn matches_date(&self, date: &NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom_match = self.days_of_month.contains(&date.day());
        let dow_match = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom_match || dow_match
        } else {
            dom_match && dow_match
        }
    }

    /// First matching instant on `date` at or after `from` local time.
    /// Local times that fall in a spring-forward gap are skipped; an
    /// ambiguous (fold) time resolves to the earlier instant.
    fn next_in_day(&self, date: NaiveDate, from: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
        for &hour in &self.hours {
            for &minute in &self.minutes {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                if time < from {
                    continue;
                }
                match tz.from_local_datetime(&date.and_time(time)) {
                    chrono::LocalResult::Single(at) => return Some(at.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earlier, _) => {
                        return Some(earlier.with_timezone(&Utc));
                    }
                    chrono::LocalResult::None => continue,
                }
            }
        }
        None
    }
}

/// Compute the next run strictly after `after`, evaluated in `tz`.
/// Searches up to 366 days ahead (covers e.g. "0 9 29 2 *").
pub fn next_run_from_cron(expr: &CronExpr, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let local = (after + Duration::minutes(1))
        .with_timezone(&tz)
        .naive_local()
        .with_second(0)?
        .with_nanosecond(0)?;

    let horizon = local.date().checked_add_days(Days::new(366))?;
    let mut date = local.date();
    // The first day is constrained by the reference time; later days
    // scan from midnight.
    let mut time_floor = Some(local.time());

    while date <= horizon {
        let from = time_floor.take().unwrap_or(NaiveTime::MIN);
        if expr.matches_date(&date)
            && let Some(at) = expr.next_in_day(date, from, tz)
        {
            return Some(at);
        }
        date = date.succ_opt()?;
    }
    None
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }

        // */N — every N
        if let Some(step) = part.strip_prefix("*/") {
            let n: u32 = step.parse().ok()?;
            if n == 0 {
                return None;
            }
            values.extend((min..=max).step_by(n as usize));
            continue;
        }

        // N-M range
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.parse().ok()?;
            let hi: u32 = hi.parse().ok()?;
            if lo > hi || lo < min || hi > max {
                return None;
            }
            values.extend(lo..=hi);
            continue;
        }

        // Single number
        let n: u32 = part.parse().ok()?;
        if n < min || n > max {
            return None;
        }
        values.push(n);
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() { None } else { Some(values) }
}
