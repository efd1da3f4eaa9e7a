//! Immutable execution records and the period key they dedup on.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use caremind_core::error::{CaremindError, Result};

/// The dedup unit: a campaign fires at most once per period.
///
/// Calendar recurrences (once/daily/weekly/monthly) dedup on the local
/// calendar day in the campaign timezone; cron dedups on the computed
/// instant, truncated to the minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodKey {
    Day(NaiveDate),
    Instant(DateTime<Utc>),
}

impl PeriodKey {
    /// Stable string form used as the ledger dedup column.
    pub fn as_string(&self) -> String {
        match self {
            Self::Day(date) => date.format("%Y-%m-%d").to_string(),
            Self::Instant(at) => at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Parse back from the ledger column.
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Self::Day(date));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|at| Self::Instant(at.with_timezone(&Utc)))
            .map_err(|e| CaremindError::Storage(format!("Bad period key '{s}': {e}")))
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Provider accepted the message.
    Ok,
    /// Provider rejected it, the call failed, or it timed out.
    Error,
    /// Recipient was deliberately not dispatched.
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CaremindError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            other => Err(CaremindError::Storage(format!("Unknown run status: '{other}'"))),
        }
    }
}

/// One immutable record of a dispatch attempt to one recipient.
/// Created only by the executor, never mutated. The ledger of runs is
/// the sole durable signal for "already fired this period".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub campaign_id: String,
    pub phone: String,
    /// When the attempt happened.
    pub at: DateTime<Utc>,
    /// The period this run belongs to.
    pub period: PeriodKey,
    /// The payload actually sent (template name, lang, params).
    pub payload: serde_json::Value,
    /// Raw provider response, stored verbatim for audit.
    pub provider_response: serde_json::Value,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl Run {
    /// Build a new run record with a fresh id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaign_id: impl Into<String>,
        phone: impl Into<String>,
        at: DateTime<Utc>,
        period: PeriodKey,
        payload: serde_json::Value,
        provider_response: serde_json::Value,
        status: RunStatus,
        error: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            phone: phone.into(),
            at,
            period,
            payload,
            provider_response,
            status,
            error,
        }
    }
}
