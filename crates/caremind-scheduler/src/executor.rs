//! Campaign execution — fan out one due campaign to its recipients.
//!
//! Dispatch runs with bounded concurrency; every recipient gets exactly
//! one Run regardless of outcome, and one recipient's failure never
//! aborts the batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use caremind_core::error::Result;
use caremind_core::traits::MessageDispatcher;

use crate::campaign::{Campaign, CampaignStatus, ParamsMode, Recipient, Recurrence};
use crate::clock::Clock;
use crate::ledger::RunLedger;
use crate::run::{PeriodKey, Run, RunStatus};
use crate::store::CampaignStore;

/// Aggregated outcome of one campaign execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub sent: usize,
    pub failed: usize,
    pub total: usize,
}

pub struct CampaignExecutor {
    store: Arc<dyn CampaignStore>,
    ledger: Arc<dyn RunLedger>,
    dispatcher: Arc<dyn MessageDispatcher>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
    dispatch_timeout: Duration,
}

impl CampaignExecutor {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        ledger: Arc<dyn RunLedger>,
        dispatcher: Arc<dyn MessageDispatcher>,
        clock: Arc<dyn Clock>,
        concurrency: usize,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            dispatcher,
            clock,
            concurrency: concurrency.max(1),
            dispatch_timeout,
        }
    }

    /// Execute `campaign` for `period`: one dispatch and one Run per
    /// recipient. Never fails for dispatch errors; only a store read
    /// failure propagates.
    pub async fn execute(&self, campaign: &Campaign, period: PeriodKey) -> Result<ExecutionResult> {
        let recipients = self.store.recipients(&campaign.id).await?;
        let total = recipients.len();
        if total == 0 {
            tracing::info!(
                "📭 Campaign '{}' has no recipients for period {period}",
                campaign.id
            );
            return Ok(ExecutionResult::default());
        }

        tracing::info!(
            "📨 Executing campaign '{}' ({total} recipients, period {period})",
            campaign.id
        );

        let sent = stream::iter(recipients)
            .map(|recipient| self.dispatch_one(campaign, period, recipient))
            .buffer_unordered(self.concurrency)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;
        let failed = total - sent;

        let result = ExecutionResult { sent, failed, total };
        tracing::info!(
            "✅ Campaign '{}' period {period}: sent={} failed={} total={}",
            campaign.id,
            result.sent,
            result.failed,
            result.total
        );

        if campaign.recurrence == Recurrence::Once
            && sent > 0
            && let Err(e) = self.store.set_status(&campaign.id, CampaignStatus::Done).await
        {
            tracing::warn!("⚠️ Failed to mark once-campaign '{}' done: {e}", campaign.id);
        }

        Ok(result)
    }

    /// Dispatch to one recipient and record its Run. Returns whether
    /// the recipient counts as sent.
    async fn dispatch_one(
        &self,
        campaign: &Campaign,
        period: PeriodKey,
        recipient: Recipient,
    ) -> bool {
        let params = effective_params(campaign, &recipient);
        let payload = serde_json::json!({
            "template": campaign.template,
            "lang_code": campaign.lang_code,
            "params": params,
        });

        let (status, response, error) = match tokio::time::timeout(
            self.dispatch_timeout,
            self.dispatcher
                .send(&recipient.phone, &campaign.template, &campaign.lang_code, &params),
        )
        .await
        {
            Ok(Ok(outcome)) => {
                let status = if outcome.accepted { RunStatus::Ok } else { RunStatus::Error };
                (status, outcome.raw_response, outcome.error_text)
            }
            Ok(Err(e)) => (RunStatus::Error, serde_json::Value::Null, Some(e.to_string())),
            // A timed-out call is an error run, never "still pending".
            Err(_) => (
                RunStatus::Error,
                serde_json::Value::Null,
                Some(format!(
                    "dispatch timed out after {}s",
                    self.dispatch_timeout.as_secs()
                )),
            ),
        };

        if let Some(reason) = &error {
            tracing::warn!(
                "⚠️ Dispatch failed for '{}' → {}: {reason}",
                campaign.id,
                recipient.phone
            );
        }

        let run = Run::new(
            campaign.id.clone(),
            recipient.phone.clone(),
            self.clock.now(),
            period,
            payload,
            response,
            status,
            error,
        );

        match self.ledger.record(&run).await {
            Ok(()) => status == RunStatus::Ok,
            Err(e) => {
                // The outcome is lost for audit but the batch goes on;
                // runs already written stand.
                tracing::error!(
                    "💾 Failed to record run for '{}' → {}: {e}",
                    campaign.id,
                    recipient.phone
                );
                false
            }
        }
    }
}

/// Fixed params, overlaid with the recipient's own map when the
/// campaign is per-recipient. Recipient wins on key collision.
fn effective_params(campaign: &Campaign, recipient: &Recipient) -> BTreeMap<u32, String> {
    let mut params = campaign.fixed_params.clone();
    if campaign.params_mode == ParamsMode::PerRecipient {
        for (index, value) in &recipient.params {
            params.insert(*index, value.clone());
        }
    }
    params
}
