//! Campaign definitions — the core data model for recurring broadcasts.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use caremind_core::error::{CaremindError, Result};

use crate::cron;

/// A reusable recurring broadcast definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Opaque unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Provider template identifier.
    pub template: String,
    /// Template language code (e.g. "pt_BR").
    pub lang_code: String,
    /// How per-recipient parameters are built.
    #[serde(default)]
    pub params_mode: ParamsMode,
    /// Placeholder index → value, shared by all recipients.
    #[serde(default)]
    pub fixed_params: BTreeMap<u32, String>,
    /// IANA zone every time-of-day and day computation runs in.
    pub timezone: Tz,
    /// Inclusive start of the firing window. Required for `Once`.
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    /// Exclusive end of the firing window.
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    /// When the campaign fires.
    pub recurrence: Recurrence,
    /// Wall-clock time-of-day in `timezone`. Ignored for `Cron`.
    pub send_time: NaiveTime,
    #[serde(default)]
    pub status: CampaignStatus,
}

/// How the effective parameter map for each recipient is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamsMode {
    /// One parameter set for all recipients.
    #[default]
    Fixed,
    /// Recipient overrides merged over the fixed defaults.
    PerRecipient,
}

/// When a campaign fires. Invalid combinations are unrepresentable:
/// weekdays only exist on `Weekly`, day-of-month only on `Monthly`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Fire once, at `start_at`.
    Once,
    /// Fire every day at `send_time`.
    Daily,
    /// Fire at `send_time` on the given ISO weekdays.
    Weekly { weekdays: HashSet<Weekday> },
    /// Fire at `send_time` on this day of each month. Months without
    /// the day (e.g. 31 in April) are skipped, never clamped.
    Monthly { day: u32 },
    /// 5-field cron expression, evaluated in the campaign timezone.
    /// `send_time` is ignored; the expression is self-contained.
    Cron { expr: String },
}

/// Campaign lifecycle state. Only `Active` campaigns are ticked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Active,
    Paused,
    /// A `Once` campaign that fired successfully, or any campaign past
    /// its `end_at`.
    Done,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Done => "done",
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = CaremindError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "done" => Ok(Self::Done),
            other => Err(CaremindError::Config(format!(
                "Unknown campaign status: '{other}'"
            ))),
        }
    }
}

impl Campaign {
    /// Validate recurrence-specific consistency. Called by the store
    /// on every write, so a malformed campaign never reaches the tick
    /// loop.
    pub fn validate(&self) -> Result<()> {
        match &self.recurrence {
            Recurrence::Once => {
                if self.start_at.is_none() {
                    return Err(CaremindError::Config(format!(
                        "Campaign '{}': once recurrence requires start_at",
                        self.id
                    )));
                }
            }
            Recurrence::Daily => {}
            Recurrence::Weekly { weekdays } => {
                if weekdays.is_empty() {
                    return Err(CaremindError::Config(format!(
                        "Campaign '{}': weekly recurrence requires a non-empty weekday set",
                        self.id
                    )));
                }
            }
            Recurrence::Monthly { day } => {
                if !(1..=31).contains(day) {
                    return Err(CaremindError::Config(format!(
                        "Campaign '{}': day_of_month must be 1..=31, got {day}",
                        self.id
                    )));
                }
            }
            Recurrence::Cron { expr } => {
                cron::parse(expr).map_err(|e| {
                    CaremindError::Config(format!(
                        "Campaign '{}': invalid cron expression '{expr}': {e}",
                        self.id
                    ))
                })?;
            }
        }
        if let (Some(start), Some(end)) = (self.start_at, self.end_at)
            && end <= start
        {
            return Err(CaremindError::Config(format!(
                "Campaign '{}': end_at must follow start_at",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether `now` falls inside the campaign's [start_at, end_at)
    /// firing window.
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        if let Some(start) = self.start_at
            && now < start
        {
            return false;
        }
        if let Some(end) = self.end_at
            && now >= end
        {
            return false;
        }
        true
    }
}

/// One (campaign, phone) pair, with optional per-recipient overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub campaign_id: String,
    /// Phone identifier in the provider's format (E.164 for WhatsApp,
    /// chat id for Telegram).
    pub phone: String,
    /// Placeholder overrides, consulted only when
    /// `params_mode = per_recipient`.
    #[serde(default)]
    pub params: BTreeMap<u32, String>,
}

impl Recipient {
    pub fn new(campaign_id: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            phone: phone.into(),
            params: BTreeMap::new(),
        }
    }
}
