//! Pure recurrence math: given a campaign and a reference instant,
//! compute the next occurrence(s). Time is always an explicit
//! parameter — no system clock in here — so every rule is exhaustively
//! unit-testable.
//!
//! All date walking happens in the campaign's timezone. A `send_time`
//! that falls in a spring-forward gap resolves to the next valid local
//! time; an ambiguous (fall-back) time resolves to the earlier instant.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::campaign::{Campaign, Recurrence};
use crate::cron;

/// How many minutes past a nonexistent local time we search for the
/// next valid one. DST gaps are at most a couple of hours.
const GAP_SEARCH_MINUTES: i64 = 3 * 60;

/// Days scanned before giving up on a calendar recurrence. The largest
/// legitimate gap is ~2 months (monthly on day 31).
const DAY_SCAN_HORIZON: u32 = 400;

/// Resolve a wall-clock time on a local date to a UTC instant.
///
/// Returns `None` only if the time cannot be resolved within
/// [`GAP_SEARCH_MINUTES`] of the requested wall clock.
pub fn resolve_local(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let mut naive = date.and_time(time);
    for _ in 0..GAP_SEARCH_MINUTES {
        match tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(at) => return Some(at.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(earlier, _) => {
                return Some(earlier.with_timezone(&Utc));
            }
            // Spring-forward gap: walk forward to the next valid wall
            // clock rather than fail or fabricate an instant.
            chrono::LocalResult::None => naive += Duration::minutes(1),
        }
    }
    None
}

/// Whether `date` is a firing day for this recurrence.
/// Months without the configured day-of-month simply never produce a
/// matching date, so "Feb 31" is skipped by construction.
pub fn day_matches(recurrence: &Recurrence, date: NaiveDate) -> bool {
    match recurrence {
        Recurrence::Once | Recurrence::Daily => true,
        Recurrence::Weekly { weekdays } => weekdays.contains(&date.weekday()),
        Recurrence::Monthly { day } => date.day() == *day,
        Recurrence::Cron { .. } => false,
    }
}

/// Next occurrences strictly after `after`: at most `limit`, no
/// earlier than `start_at`, strictly before `end_at`.
pub fn next_occurrences(
    campaign: &Campaign,
    after: DateTime<Utc>,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    if limit == 0 {
        return Vec::new();
    }

    match &campaign.recurrence {
        Recurrence::Once => {
            let Some(at) = campaign.start_at else {
                return Vec::new();
            };
            if at > after && before_end(campaign, at) {
                vec![at]
            } else {
                Vec::new()
            }
        }
        Recurrence::Cron { expr } => cron_occurrences(campaign, expr, after, limit),
        _ => calendar_occurrences(campaign, after, limit),
    }
}

fn before_end(campaign: &Campaign, at: DateTime<Utc>) -> bool {
    campaign.end_at.is_none_or(|end| at < end)
}

fn calendar_occurrences(
    campaign: &Campaign,
    after: DateTime<Utc>,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    let tz = campaign.timezone;
    // No occurrence can precede start_at, so start walking there.
    let floor = match campaign.start_at {
        Some(start) if start > after => start,
        _ => after,
    };

    let mut occurrences = Vec::new();
    let mut date = floor.with_timezone(&tz).date_naive();

    for _ in 0..DAY_SCAN_HORIZON {
        if day_matches(&campaign.recurrence, date)
            && let Some(at) = resolve_local(date, campaign.send_time, tz)
        {
            if campaign.end_at.is_some_and(|end| at >= end) {
                break;
            }
            if at > after && campaign.start_at.is_none_or(|start| at >= start) {
                occurrences.push(at);
                if occurrences.len() == limit {
                    break;
                }
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    occurrences
}

fn cron_occurrences(
    campaign: &Campaign,
    expr: &str,
    after: DateTime<Utc>,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    let Ok(parsed) = cron::parse(expr) else {
        // Validation rejects bad expressions at creation time; a bad
        // stored expression degrades to "never due".
        tracing::warn!("Campaign '{}': unparseable cron '{expr}'", campaign.id);
        return Vec::new();
    };

    // Seed just below start_at so an occurrence exactly at start_at is
    // still produced.
    let mut seed = after;
    if let Some(start) = campaign.start_at
        && start > after
    {
        seed = start - Duration::minutes(1);
    }

    let mut occurrences = Vec::new();
    while occurrences.len() < limit {
        let Some(at) = cron::next_run_from_cron(&parsed, seed, campaign.timezone) else {
            break;
        };
        if !before_end(campaign, at) {
            break;
        }
        occurrences.push(at);
        seed = at;
    }
    occurrences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{CampaignStatus, ParamsMode};
    use chrono::Weekday;
    use std::collections::{BTreeMap, HashSet};

    fn campaign(recurrence: Recurrence, tz: Tz, send_time: &str) -> Campaign {
        Campaign {
            id: "c1".into(),
            name: "test".into(),
            template: "med_reminder".into(),
            lang_code: "pt_BR".into(),
            params_mode: ParamsMode::Fixed,
            fixed_params: BTreeMap::new(),
            timezone: tz,
            start_at: None,
            end_at: None,
            recurrence,
            send_time: send_time.parse().unwrap(),
            status: CampaignStatus::Active,
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_sao_paulo_is_noon_utc() {
        // 09:00 in São Paulo (UTC-3) = 12:00 UTC.
        let c = campaign(Recurrence::Daily, chrono_tz::America::Sao_Paulo, "09:00:00");
        let next = next_occurrences(&c, utc(2024, 6, 2, 21, 0), 1);
        assert_eq!(next, vec![utc(2024, 6, 3, 12, 0)]);
        // The local weekday survives the UTC date boundary: the
        // occurrence is Monday both locally and in UTC here.
        assert_eq!(next[0].weekday(), Weekday::Mon);
        assert_eq!(
            next[0]
                .with_timezone(&chrono_tz::America::Sao_Paulo)
                .weekday(),
            Weekday::Mon
        );
    }

    #[test]
    fn test_daily_sequence() {
        let c = campaign(Recurrence::Daily, chrono_tz::Tz::UTC, "09:00:00");
        let next = next_occurrences(&c, utc(2024, 6, 3, 10, 0), 3);
        assert_eq!(
            next,
            vec![utc(2024, 6, 4, 9, 0), utc(2024, 6, 5, 9, 0), utc(2024, 6, 6, 9, 0)]
        );
    }

    #[test]
    fn test_weekly_monday_only() {
        let c = campaign(
            Recurrence::Weekly { weekdays: [Weekday::Mon].into() },
            chrono_tz::America::Sao_Paulo,
            "09:00:00",
        );
        // Saturday June 1st → next two Mondays.
        let next = next_occurrences(&c, utc(2024, 6, 1, 0, 0), 2);
        assert_eq!(next, vec![utc(2024, 6, 3, 12, 0), utc(2024, 6, 10, 12, 0)]);
    }

    #[test]
    fn test_weekly_multiple_days() {
        let weekdays: HashSet<Weekday> = [Weekday::Tue, Weekday::Thu].into();
        let c = campaign(Recurrence::Weekly { weekdays }, chrono_tz::Tz::UTC, "08:00:00");
        let next = next_occurrences(&c, utc(2024, 6, 3, 0, 0), 3);
        // Jun 4 Tue, Jun 6 Thu, Jun 11 Tue.
        assert_eq!(
            next,
            vec![utc(2024, 6, 4, 8, 0), utc(2024, 6, 6, 8, 0), utc(2024, 6, 11, 8, 0)]
        );
    }

    #[test]
    fn test_monthly_day_31_skips_april() {
        let c = campaign(Recurrence::Monthly { day: 31 }, chrono_tz::Tz::UTC, "10:00:00");
        let next = next_occurrences(&c, utc(2024, 4, 1, 0, 0), 2);
        // April has no 31st: skipped, not clamped. May and July do
        // (June doesn't either).
        assert_eq!(next, vec![utc(2024, 5, 31, 10, 0), utc(2024, 7, 31, 10, 0)]);
    }

    #[test]
    fn test_monthly_february_29() {
        let c = campaign(Recurrence::Monthly { day: 29 }, chrono_tz::Tz::UTC, "08:00:00");
        // 2023 is not a leap year: Feb skipped, Jan 29 then Mar 29.
        let next = next_occurrences(&c, utc(2023, 1, 1, 0, 0), 2);
        assert_eq!(next, vec![utc(2023, 1, 29, 8, 0), utc(2023, 3, 29, 8, 0)]);
    }

    #[test]
    fn test_once_future_and_past() {
        let mut c = campaign(Recurrence::Once, chrono_tz::Tz::UTC, "09:00:00");
        c.start_at = Some(utc(2024, 6, 10, 9, 0));

        assert_eq!(next_occurrences(&c, utc(2024, 6, 1, 0, 0), 5), vec![utc(2024, 6, 10, 9, 0)]);
        // Already past: empty.
        assert!(next_occurrences(&c, utc(2024, 6, 10, 9, 0), 5).is_empty());
    }

    #[test]
    fn test_start_at_floor() {
        let mut c = campaign(Recurrence::Daily, chrono_tz::Tz::UTC, "09:00:00");
        c.start_at = Some(utc(2024, 6, 10, 0, 0));
        let next = next_occurrences(&c, utc(2024, 6, 1, 0, 0), 1);
        assert_eq!(next, vec![utc(2024, 6, 10, 9, 0)]);
    }

    #[test]
    fn test_end_at_bound() {
        let mut c = campaign(Recurrence::Daily, chrono_tz::Tz::UTC, "09:00:00");
        c.end_at = Some(utc(2024, 6, 5, 9, 0));
        let next = next_occurrences(&c, utc(2024, 6, 3, 10, 0), 10);
        // Jun 5 09:00 == end_at is excluded (exclusive bound).
        assert_eq!(next, vec![utc(2024, 6, 4, 9, 0)]);
    }

    #[test]
    fn test_dst_gap_resolves_forward() {
        // America/New_York 2024-03-10: 02:00-03:00 does not exist.
        // A 02:30 send_time resolves to 03:00 EDT = 07:00 UTC.
        let c = campaign(Recurrence::Daily, chrono_tz::America::New_York, "02:30:00");
        let next = next_occurrences(&c, utc(2024, 3, 10, 0, 0), 2);
        assert_eq!(next[0], utc(2024, 3, 10, 7, 0));
        // The next day 02:30 EDT exists again = 06:30 UTC.
        assert_eq!(next[1], utc(2024, 3, 11, 6, 30));
    }

    #[test]
    fn test_fall_back_takes_earlier_instant() {
        // America/New_York 2024-11-03: 01:30 occurs twice; the earlier
        // (EDT, UTC-4) instant wins.
        let c = campaign(Recurrence::Daily, chrono_tz::America::New_York, "01:30:00");
        let next = next_occurrences(&c, utc(2024, 11, 3, 0, 0), 1);
        assert_eq!(next, vec![utc(2024, 11, 3, 5, 30)]);
    }

    #[test]
    fn test_cron_occurrences_in_zone() {
        let c = campaign(
            Recurrence::Cron { expr: "0 8 * * *".into() },
            chrono_tz::America::Sao_Paulo,
            "00:00:00",
        );
        let next = next_occurrences(&c, utc(2024, 6, 3, 0, 0), 2);
        // 08:00 São Paulo = 11:00 UTC.
        assert_eq!(next, vec![utc(2024, 6, 3, 11, 0), utc(2024, 6, 4, 11, 0)]);
    }

    #[test]
    fn test_limit_zero() {
        let c = campaign(Recurrence::Daily, chrono_tz::Tz::UTC, "09:00:00");
        assert!(next_occurrences(&c, utc(2024, 6, 3, 0, 0), 0).is_empty());
    }

    #[test]
    fn test_all_strictly_after_reference() {
        let c = campaign(Recurrence::Daily, chrono_tz::Tz::UTC, "09:00:00");
        let reference = utc(2024, 6, 3, 9, 0);
        // Exactly at send_time: today's occurrence is not "next".
        let next = next_occurrences(&c, reference, 1);
        assert_eq!(next, vec![utc(2024, 6, 4, 9, 0)]);
    }
}
