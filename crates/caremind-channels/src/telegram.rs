//! Telegram Bot API dispatcher.
//!
//! Telegram has no server-side template store, so templates are plain
//! message texts in the config with `{{n}}` placeholders, rendered
//! locally before `sendMessage`. The recipient "phone" is the Telegram
//! chat id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use caremind_core::config::TelegramSettings;
use caremind_core::error::{CaremindError, Result};
use caremind_core::traits::{DispatchOutcome, MessageDispatcher};

/// Standard Bot API response envelope.
#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
}

/// Telegram Bot dispatcher.
pub struct TelegramDispatcher {
    settings: TelegramSettings,
    client: reqwest::Client,
}

impl TelegramDispatcher {
    pub fn new(settings: TelegramSettings) -> Result<Self> {
        if settings.bot_token.is_empty() {
            return Err(CaremindError::Config(
                "Telegram bot_token not configured".into(),
            ));
        }
        Ok(Self {
            settings,
            client: reqwest::Client::new(),
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{}",
            self.settings.bot_token, method
        )
    }
}

/// Substitute `{{n}}` placeholders. Errors on an unresolved
/// placeholder: a reminder with a hole in it must not go out.
fn render_template(text: &str, params: &BTreeMap<u32, String>) -> Result<String> {
    let mut rendered = text.to_string();
    for (index, value) in params {
        rendered = rendered.replace(&format!("{{{{{index}}}}}"), value);
    }
    if rendered.contains("{{") {
        return Err(CaremindError::Channel(format!(
            "Template has unresolved placeholders: {rendered}"
        )));
    }
    Ok(rendered)
}

#[async_trait]
impl MessageDispatcher for TelegramDispatcher {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(
        &self,
        phone: &str,
        template: &str,
        _lang_code: &str,
        params: &BTreeMap<u32, String>,
    ) -> Result<DispatchOutcome> {
        let chat_id: i64 = phone
            .parse()
            .map_err(|_| CaremindError::Channel(format!("Invalid Telegram chat id: {phone}")))?;

        let text = self
            .settings
            .templates
            .get(template)
            .ok_or_else(|| {
                CaremindError::Channel(format!("Unknown Telegram template: {template}"))
            })
            .and_then(|t| render_template(t, params))?;

        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| CaremindError::Channel(format!("sendMessage failed: {e}")))?;

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CaremindError::Channel(format!("Invalid Telegram response: {e}")))?;
        let envelope: TelegramApiResponse<TelegramMessage> =
            serde_json::from_value(raw.clone())
                .map_err(|e| CaremindError::Channel(format!("Invalid Telegram envelope: {e}")))?;

        if !envelope.ok {
            let error_text = envelope.description.unwrap_or_else(|| "send failed".into());
            tracing::warn!("⚠️ Telegram rejected send to chat {chat_id}: {error_text}");
            return Ok(DispatchOutcome::rejected(error_text, raw));
        }

        let msg_id = envelope
            .result
            .map(|m| m.message_id.to_string())
            .unwrap_or_else(|| "unknown".into());
        tracing::debug!("Telegram template '{template}' sent: {msg_id} → chat {chat_id}");
        Ok(DispatchOutcome::accepted(msg_id, raw))
    }
}
