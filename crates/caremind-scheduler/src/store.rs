//! Campaign and recipient storage.
//!
//! The write path is the admin layer's concern; it lands here so the
//! store can enforce `Campaign::validate()` on every write and a
//! malformed definition never reaches the tick loop.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use caremind_core::error::{CaremindError, Result};

use crate::campaign::{Campaign, CampaignStatus, ParamsMode, Recipient};

/// CRUD boundary for campaigns and their recipients.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Campaigns the tick loop evaluates.
    async fn list_active(&self) -> Result<Vec<Campaign>>;

    async fn get(&self, id: &str) -> Result<Option<Campaign>>;

    /// Insert or replace. Validates the definition first.
    async fn upsert(&self, campaign: &Campaign) -> Result<()>;

    async fn set_status(&self, id: &str, status: CampaignStatus) -> Result<()>;

    async fn recipients(&self, campaign_id: &str) -> Result<Vec<Recipient>>;

    /// Insert or replace one (campaign, phone) pair.
    async fn add_recipient(&self, recipient: &Recipient) -> Result<()>;

    async fn remove_recipient(&self, campaign_id: &str, phone: &str) -> Result<()>;
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryCampaignStore {
    campaigns: Mutex<HashMap<String, Campaign>>,
    recipients: Mutex<Vec<Recipient>>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn list_active(&self) -> Result<Vec<Campaign>> {
        Ok(self
            .campaigns
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|c| c.status == CampaignStatus::Active)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Campaign>> {
        Ok(self
            .campaigns
            .lock()
            .expect("store lock poisoned")
            .get(id)
            .cloned())
    }

    async fn upsert(&self, campaign: &Campaign) -> Result<()> {
        campaign.validate()?;
        self.campaigns
            .lock()
            .expect("store lock poisoned")
            .insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn set_status(&self, id: &str, status: CampaignStatus) -> Result<()> {
        let mut campaigns = self.campaigns.lock().expect("store lock poisoned");
        let campaign = campaigns
            .get_mut(id)
            .ok_or_else(|| CaremindError::NotFound(format!("campaign '{id}'")))?;
        campaign.status = status;
        Ok(())
    }

    async fn recipients(&self, campaign_id: &str) -> Result<Vec<Recipient>> {
        Ok(self
            .recipients
            .lock()
            .expect("store lock poisoned")
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn add_recipient(&self, recipient: &Recipient) -> Result<()> {
        let mut recipients = self.recipients.lock().expect("store lock poisoned");
        recipients
            .retain(|r| !(r.campaign_id == recipient.campaign_id && r.phone == recipient.phone));
        recipients.push(recipient.clone());
        Ok(())
    }

    async fn remove_recipient(&self, campaign_id: &str, phone: &str) -> Result<()> {
        self.recipients
            .lock()
            .expect("store lock poisoned")
            .retain(|r| !(r.campaign_id == campaign_id && r.phone == phone));
        Ok(())
    }
}

/// SQLite-backed store. Structured fields live in columns; the
/// recurrence variant and parameter maps are JSON blobs, mirroring how
/// the run ledger stores payloads.
pub struct SqliteCampaignStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteCampaignStore {
    /// Open or create the campaign database.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| CaremindError::Storage(format!("DB open: {e}")))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .expect("store lock poisoned")
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                template TEXT NOT NULL,
                lang_code TEXT NOT NULL,
                params_mode TEXT NOT NULL,       -- 'fixed' | 'per_recipient'
                fixed_params TEXT NOT NULL,      -- JSON: index → value
                timezone TEXT NOT NULL,          -- IANA zone name
                start_at TEXT,
                end_at TEXT,
                recurrence TEXT NOT NULL,        -- JSON tagged variant
                send_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS recipients (
                campaign_id TEXT NOT NULL,
                phone TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (campaign_id, phone),
                FOREIGN KEY (campaign_id) REFERENCES campaigns(id) ON DELETE CASCADE
            );
         ",
            )
            .map_err(|e| CaremindError::Storage(format!("Migration: {e}")))?;
        Ok(())
    }

    fn row_to_campaign(row: &rusqlite::Row<'_>) -> Result<Campaign> {
        let id: String = row.get(0).map_err(sql_err)?;
        let name: String = row.get(1).map_err(sql_err)?;
        let template: String = row.get(2).map_err(sql_err)?;
        let lang_code: String = row.get(3).map_err(sql_err)?;
        let params_mode_str: String = row.get(4).map_err(sql_err)?;
        let fixed_params_str: String = row.get(5).map_err(sql_err)?;
        let timezone_str: String = row.get(6).map_err(sql_err)?;
        let start_at_str: Option<String> = row.get(7).map_err(sql_err)?;
        let end_at_str: Option<String> = row.get(8).map_err(sql_err)?;
        let recurrence_str: String = row.get(9).map_err(sql_err)?;
        let send_time_str: String = row.get(10).map_err(sql_err)?;
        let status_str: String = row.get(11).map_err(sql_err)?;

        let params_mode = match params_mode_str.as_str() {
            "per_recipient" => ParamsMode::PerRecipient,
            _ => ParamsMode::Fixed,
        };
        let timezone = timezone_str
            .parse()
            .map_err(|e| CaremindError::Storage(format!("Bad timezone '{timezone_str}': {e}")))?;
        let recurrence = serde_json::from_str(&recurrence_str)
            .map_err(|e| CaremindError::Storage(format!("Bad recurrence for '{id}': {e}")))?;
        let send_time = send_time_str
            .parse()
            .map_err(|e| CaremindError::Storage(format!("Bad send_time for '{id}': {e}")))?;

        Ok(Campaign {
            id,
            name,
            template,
            lang_code,
            params_mode,
            fixed_params: serde_json::from_str(&fixed_params_str).unwrap_or_default(),
            timezone,
            start_at: parse_instant(start_at_str),
            end_at: parse_instant(end_at_str),
            recurrence,
            send_time,
            status: status_str.parse()?,
        })
    }
}

fn sql_err(e: rusqlite::Error) -> CaremindError {
    CaremindError::Storage(format!("Row read: {e}"))
}

fn parse_instant(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

#[async_trait]
impl CampaignStore for SqliteCampaignStore {
    async fn list_active(&self) -> Result<Vec<Campaign>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, name, template, lang_code, params_mode, fixed_params, timezone,
                        start_at, end_at, recurrence, send_time, status
                 FROM campaigns WHERE status = 'active' ORDER BY id",
            )
            .map_err(|e| CaremindError::Storage(format!("List campaigns: {e}")))?;
        let rows = stmt
            .query_map([], |row| Ok(Self::row_to_campaign(row)))
            .map_err(|e| CaremindError::Storage(format!("List campaigns: {e}")))?;

        let mut campaigns = Vec::new();
        for row in rows.flatten() {
            match row {
                Ok(campaign) => campaigns.push(campaign),
                // A corrupt row must not take the whole tick down.
                Err(e) => tracing::warn!("Skipping unreadable campaign row: {e}"),
            }
        }
        Ok(campaigns)
    }

    async fn get(&self, id: &str) -> Result<Option<Campaign>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, name, template, lang_code, params_mode, fixed_params, timezone,
                        start_at, end_at, recurrence, send_time, status
                 FROM campaigns WHERE id = ?1",
            )
            .map_err(|e| CaremindError::Storage(format!("Get campaign: {e}")))?;
        let mut rows = stmt
            .query_map([id], |row| Ok(Self::row_to_campaign(row)))
            .map_err(|e| CaremindError::Storage(format!("Get campaign: {e}")))?;
        match rows.next() {
            Some(Ok(result)) => result.map(Some),
            Some(Err(e)) => Err(CaremindError::Storage(format!("Get campaign: {e}"))),
            None => Ok(None),
        }
    }

    async fn upsert(&self, campaign: &Campaign) -> Result<()> {
        campaign.validate()?;
        let recurrence = serde_json::to_string(&campaign.recurrence)
            .map_err(|e| CaremindError::Storage(format!("Serialize recurrence: {e}")))?;
        let fixed_params = serde_json::to_string(&campaign.fixed_params)
            .map_err(|e| CaremindError::Storage(format!("Serialize params: {e}")))?;
        let params_mode = match campaign.params_mode {
            ParamsMode::Fixed => "fixed",
            ParamsMode::PerRecipient => "per_recipient",
        };

        self.conn
            .lock()
            .expect("store lock poisoned")
            .execute(
                "INSERT OR REPLACE INTO campaigns
                 (id, name, template, lang_code, params_mode, fixed_params, timezone,
                  start_at, end_at, recurrence, send_time, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    campaign.id,
                    campaign.name,
                    campaign.template,
                    campaign.lang_code,
                    params_mode,
                    fixed_params,
                    campaign.timezone.name(),
                    campaign.start_at.map(|t| t.to_rfc3339()),
                    campaign.end_at.map(|t| t.to_rfc3339()),
                    recurrence,
                    campaign.send_time.format("%H:%M:%S").to_string(),
                    campaign.status.as_str(),
                ],
            )
            .map_err(|e| CaremindError::Storage(format!("Save campaign: {e}")))?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: CampaignStatus) -> Result<()> {
        let changed = self
            .conn
            .lock()
            .expect("store lock poisoned")
            .execute(
                "UPDATE campaigns SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.as_str(), id],
            )
            .map_err(|e| CaremindError::Storage(format!("Set status: {e}")))?;
        if changed == 0 {
            return Err(CaremindError::NotFound(format!("campaign '{id}'")));
        }
        Ok(())
    }

    async fn recipients(&self, campaign_id: &str) -> Result<Vec<Recipient>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT campaign_id, phone, params FROM recipients
                 WHERE campaign_id = ?1 ORDER BY phone",
            )
            .map_err(|e| CaremindError::Storage(format!("List recipients: {e}")))?;
        let rows = stmt
            .query_map([campaign_id], |row| {
                let params_str: String = row.get(2)?;
                Ok(Recipient {
                    campaign_id: row.get(0)?,
                    phone: row.get(1)?,
                    params: serde_json::from_str(&params_str).unwrap_or_default(),
                })
            })
            .map_err(|e| CaremindError::Storage(format!("List recipients: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn add_recipient(&self, recipient: &Recipient) -> Result<()> {
        let params = serde_json::to_string(&recipient.params)
            .map_err(|e| CaremindError::Storage(format!("Serialize params: {e}")))?;
        self.conn
            .lock()
            .expect("store lock poisoned")
            .execute(
                "INSERT OR REPLACE INTO recipients (campaign_id, phone, params)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![recipient.campaign_id, recipient.phone, params],
            )
            .map_err(|e| CaremindError::Storage(format!("Save recipient: {e}")))?;
        Ok(())
    }

    async fn remove_recipient(&self, campaign_id: &str, phone: &str) -> Result<()> {
        self.conn
            .lock()
            .expect("store lock poisoned")
            .execute(
                "DELETE FROM recipients WHERE campaign_id = ?1 AND phone = ?2",
                rusqlite::params![campaign_id, phone],
            )
            .map_err(|e| CaremindError::Storage(format!("Delete recipient: {e}")))?;
        Ok(())
    }
}
