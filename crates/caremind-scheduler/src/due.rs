//! Due evaluation — "must this campaign fire on this tick?"
//!
//! Stateless per tick: the run ledger is the only durable memory, so a
//! process restart can neither double-fire nor miss a fire inside the
//! tolerance window. The ledger check is the dedup mechanism; the time
//! window only bridges tick granularity.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};

use caremind_core::error::Result;

use crate::campaign::{Campaign, Recurrence};
use crate::cron;
use crate::ledger::RunLedger;
use crate::recurrence;
use crate::run::PeriodKey;

pub struct DueEvaluator {
    ledger: Arc<dyn RunLedger>,
    /// Half-width of the due window around the scheduled instant.
    /// Must cover the tick interval or fires fall between ticks.
    tolerance: Duration,
}

impl DueEvaluator {
    pub fn new(ledger: Arc<dyn RunLedger>, tolerance_secs: u64) -> Self {
        Self {
            ledger,
            tolerance: Duration::seconds(tolerance_secs as i64),
        }
    }

    /// Decide whether `campaign` must fire at `now`. Returns the period
    /// key to execute under when due, `None` otherwise.
    pub async fn should_execute_now(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Result<Option<PeriodKey>> {
        if !campaign.in_window(now) {
            return Ok(None);
        }

        if let Recurrence::Cron { expr } = &campaign.recurrence {
            return self.due_cron_instant(campaign, expr, now).await;
        }

        // The scheduled instant for `now`'s local day, if the
        // recurrence has one; its absence means "not a firing day".
        let Some((scheduled, period)) = self.scheduled_instant(campaign, now) else {
            return Ok(None);
        };

        if (now - scheduled).abs() > self.tolerance {
            return Ok(None);
        }

        // At most one fire per period, regardless of prior status: a
        // failed period does not retry until the next period.
        if self.ledger.has_run(&campaign.id, &period).await? {
            return Ok(None);
        }

        Ok(Some(period))
    }

    /// The period a run started at `now` belongs to, independent of
    /// whether the campaign is due. Used by the manual "send now" path
    /// so forced runs share the automatic dedup key.
    pub fn current_period(&self, campaign: &Campaign, now: DateTime<Utc>) -> PeriodKey {
        match &campaign.recurrence {
            Recurrence::Cron { expr } => match self.cron_instant_near(campaign, expr, now) {
                Some(at) => PeriodKey::Instant(truncate_to_minute(at)),
                // No cron instant near now: dedup on the minute of the
                // forced run itself.
                None => PeriodKey::Instant(truncate_to_minute(now)),
            },
            _ => PeriodKey::Day(now.with_timezone(&campaign.timezone).date_naive()),
        }
    }

    /// First cron instant within tolerance of `now` whose period has
    /// no run yet. Instants close together (e.g. `0,1 8 * * *` or
    /// `* * * * *`) are each their own period, so an already-run
    /// instant must not mask a later un-run one inside the window.
    async fn due_cron_instant(
        &self,
        campaign: &Campaign,
        expr: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PeriodKey>> {
        // Validation rejects bad expressions at creation time; a bad
        // stored expression degrades to "never due".
        let Ok(parsed) = cron::parse(expr) else {
            return Ok(None);
        };

        let mut seed = now - self.tolerance - Duration::minutes(1);
        loop {
            let Some(at) = cron::next_run_from_cron(&parsed, seed, campaign.timezone) else {
                return Ok(None);
            };
            if at > now + self.tolerance {
                return Ok(None);
            }
            if (now - at).abs() <= self.tolerance {
                let period = PeriodKey::Instant(truncate_to_minute(at));
                if !self.ledger.has_run(&campaign.id, &period).await? {
                    return Ok(Some(period));
                }
            }
            seed = at;
        }
    }

    /// First cron instant within tolerance of `now`, ignoring the
    /// ledger.
    fn cron_instant_near(
        &self,
        campaign: &Campaign,
        expr: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let parsed = cron::parse(expr).ok()?;
        let mut seed = now - self.tolerance - Duration::minutes(1);
        loop {
            let at = cron::next_run_from_cron(&parsed, seed, campaign.timezone)?;
            if at > now + self.tolerance {
                return None;
            }
            if (now - at).abs() <= self.tolerance {
                return Some(at);
            }
            seed = at;
        }
    }

    /// Scheduled instant for `now`'s local day and the period it
    /// defines. Calendar recurrences only; cron has its own path.
    fn scheduled_instant(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, PeriodKey)> {
        let tz = campaign.timezone;
        match &campaign.recurrence {
            Recurrence::Once => {
                let at = campaign.start_at?;
                Some((at, PeriodKey::Day(now.with_timezone(&tz).date_naive())))
            }
            Recurrence::Cron { .. } => None,
            _ => {
                let local_date = now.with_timezone(&tz).date_naive();
                if !recurrence::day_matches(&campaign.recurrence, local_date) {
                    return None;
                }
                let at = recurrence::resolve_local(local_date, campaign.send_time, tz)?;
                Some((at, PeriodKey::Day(local_date)))
            }
        }
    }
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}
