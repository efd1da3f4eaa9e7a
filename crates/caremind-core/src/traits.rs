//! The dispatcher boundary between the scheduler and the messaging
//! providers. The scheduler only ever sees this trait; WhatsApp and
//! Telegram implementations live in `caremind-channels`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Structured outcome of one dispatch attempt.
///
/// A provider-level rejection (API said no) is `accepted: false` with
/// the raw body preserved; a transport failure is an `Err` from
/// [`MessageDispatcher::send`]. The scheduler records both as error
/// runs and never interprets `raw_response` beyond storing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Whether the provider accepted the message.
    pub accepted: bool,
    /// Provider-assigned message id, when one was returned.
    pub provider_message_id: Option<String>,
    /// Raw provider response, stored verbatim for audit.
    pub raw_response: serde_json::Value,
    /// Provider error text, when rejected.
    pub error_text: Option<String>,
}

impl DispatchOutcome {
    /// An accepted outcome.
    pub fn accepted(message_id: impl Into<String>, raw: serde_json::Value) -> Self {
        Self {
            accepted: true,
            provider_message_id: Some(message_id.into()),
            raw_response: raw,
            error_text: None,
        }
    }

    /// A provider-rejected outcome.
    pub fn rejected(error: impl Into<String>, raw: serde_json::Value) -> Self {
        Self {
            accepted: false,
            provider_message_id: None,
            raw_response: raw,
            error_text: Some(error.into()),
        }
    }
}

/// Sends one templated message to one recipient.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// Channel name ("whatsapp", "telegram", ...).
    fn name(&self) -> &str;

    /// Send `template` in `lang_code` to `phone`, with positional
    /// parameters keyed by placeholder index.
    async fn send(
        &self,
        phone: &str,
        template: &str,
        lang_code: &str,
        params: &BTreeMap<u32, String>,
    ) -> Result<DispatchOutcome>;
}
