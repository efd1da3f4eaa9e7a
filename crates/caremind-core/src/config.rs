//! CareMind configuration system.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaremindError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaremindConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl CaremindConfig {
    /// Load config from the default path (~/.caremind/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CaremindError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CaremindError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CaremindError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".caremind")
            .join("config.toml")
    }

    /// Get the CareMind home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".caremind")
    }
}

/// Tick loop and dispatch pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Due-window tolerance around a scheduled instant, in seconds.
    /// Must cover the tick interval or fires can fall between ticks.
    #[serde(default = "default_due_tolerance")]
    pub due_tolerance_secs: u64,
    /// Max concurrent dispatches within one campaign batch.
    #[serde(default = "default_concurrency")]
    pub dispatch_concurrency: usize,
    /// Per-dispatch timeout, in seconds. A timed-out call is an error
    /// run, never "still pending".
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
}

fn default_tick_interval() -> u64 { 60 }
fn default_due_tolerance() -> u64 { 60 }
fn default_concurrency() -> usize { 4 }
fn default_dispatch_timeout() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            due_tolerance_secs: default_due_tolerance(),
            dispatch_concurrency: default_concurrency(),
            dispatch_timeout_secs: default_dispatch_timeout(),
        }
    }
}

/// Run retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Runs older than this many days are eligible for deletion.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    /// Seconds between retention sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn bool_true() -> bool { true }
fn default_horizon_days() -> u32 { 30 }
fn default_sweep_interval() -> u64 { 6 * 3600 }

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: bool_true(),
            horizon_days: default_horizon_days(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Messaging channel settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub whatsapp: Option<WhatsAppSettings>,
    #[serde(default)]
    pub telegram: Option<TelegramSettings>,
}

/// WhatsApp Business Cloud API settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhatsAppSettings {
    /// Facebook Graph API access token.
    pub access_token: String,
    /// WhatsApp Phone Number ID.
    pub phone_number_id: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramSettings {
    pub bot_token: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Template name → message text with `{{n}}` placeholders.
    /// Telegram has no server-side template store, so templates are
    /// rendered locally from this table.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CaremindConfig::default();
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        assert_eq!(config.scheduler.dispatch_concurrency, 4);
        assert_eq!(config.retention.horizon_days, 30);
        assert!(config.channel.whatsapp.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [scheduler]
            dispatch_concurrency = 8

            [channel.telegram]
            bot_token = "123:abc"

            [channel.telegram.templates]
            med_reminder = "Hello {{1}}, time for {{2}}."
        "#;
        let config: CaremindConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.scheduler.dispatch_concurrency, 8);
        assert_eq!(config.scheduler.tick_interval_secs, 60);
        let tg = config.channel.telegram.unwrap();
        assert!(tg.enabled);
        assert_eq!(
            tg.templates.get("med_reminder").unwrap(),
            "Hello {{1}}, time for {{2}}."
        );
    }

    #[test]
    fn test_roundtrip() {
        let mut config = CaremindConfig::default();
        config.scheduler.tick_interval_secs = 30;
        config.channel.whatsapp = Some(WhatsAppSettings {
            access_token: "tok".into(),
            phone_number_id: "123".into(),
            enabled: true,
        });
        let text = toml::to_string_pretty(&config).unwrap();
        let back: CaremindConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.scheduler.tick_interval_secs, 30);
        assert_eq!(back.channel.whatsapp.unwrap().phone_number_id, "123");
    }
}
