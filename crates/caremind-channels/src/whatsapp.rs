//! WhatsApp Business Cloud API dispatcher.
//!
//! Sends pre-approved message templates via the official WhatsApp
//! Business Platform (Cloud API). Requires: Access Token + Phone
//! Number ID from Meta Business Suite. Template bodies live on Meta's
//! side; only the positional parameters travel with the request.

use std::collections::BTreeMap;

use async_trait::async_trait;

use caremind_core::config::WhatsAppSettings;
use caremind_core::error::{CaremindError, Result};
use caremind_core::traits::{DispatchOutcome, MessageDispatcher};

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// WhatsApp Business dispatcher.
pub struct WhatsAppDispatcher {
    settings: WhatsAppSettings,
    client: reqwest::Client,
}

impl WhatsAppDispatcher {
    pub fn new(settings: WhatsAppSettings) -> Result<Self> {
        if settings.access_token.is_empty() {
            return Err(CaremindError::Config(
                "WhatsApp access_token not configured".into(),
            ));
        }
        if settings.phone_number_id.is_empty() {
            return Err(CaremindError::Config(
                "WhatsApp phone_number_id not configured".into(),
            ));
        }
        Ok(Self {
            settings,
            client: reqwest::Client::new(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{GRAPH_API_BASE}/{}/messages", self.settings.phone_number_id)
    }
}

/// Build the Cloud API template-message request body. Parameters are
/// positional: the BTreeMap's ascending key order is the placeholder
/// order `{{1}}`, `{{2}}`, ... in the approved template.
fn template_payload(
    to: &str,
    template: &str,
    lang_code: &str,
    params: &BTreeMap<u32, String>,
) -> serde_json::Value {
    let mut template_obj = serde_json::json!({
        "name": template,
        "language": { "code": lang_code },
    });
    if !params.is_empty() {
        let parameters: Vec<serde_json::Value> = params
            .values()
            .map(|text| serde_json::json!({ "type": "text", "text": text }))
            .collect();
        template_obj["components"] = serde_json::json!([{
            "type": "body",
            "parameters": parameters,
        }]);
    }
    serde_json::json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "template",
        "template": template_obj,
    })
}

#[async_trait]
impl MessageDispatcher for WhatsAppDispatcher {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(
        &self,
        phone: &str,
        template: &str,
        lang_code: &str,
        params: &BTreeMap<u32, String>,
    ) -> Result<DispatchOutcome> {
        let body = template_payload(phone, template, lang_code, params);

        let response = self
            .client
            .post(self.messages_url())
            .header(
                "Authorization",
                format!("Bearer {}", self.settings.access_token),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CaremindError::Channel(format!("WhatsApp API request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CaremindError::Channel(format!("WhatsApp response read failed: {e}")))?;
        let raw: serde_json::Value =
            serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({ "body": text }));

        // A rejection still produced a response: preserve it verbatim
        // rather than erroring, so the run record keeps the evidence.
        if !status.is_success() {
            let error_text = raw["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("WhatsApp API error {status}"));
            tracing::warn!("⚠️ WhatsApp rejected send to {phone}: {error_text}");
            return Ok(DispatchOutcome::rejected(error_text, raw));
        }

        let msg_id = raw["messages"][0]["id"].as_str().unwrap_or("unknown").to_string();
        tracing::debug!("WhatsApp template '{template}' sent: {msg_id} → {phone}");
        Ok(DispatchOutcome::accepted(msg_id, raw))
    }
}
