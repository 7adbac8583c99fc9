// Webhook notifier
// POSTs the obligation as JSON. The fingerprint travels as `Idempotency-Key`
// so receivers can drop the duplicates at-least-once delivery produces.

use crate::errors::NotifierError;
use crate::fingerprint::short;
use crate::models::Obligation;
use crate::notifier::{classify_error, classify_status, format_amount, ActionOutcome, Notifier};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct WebhookNotifier {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        bearer_token: Option<String>,
        timeout_seconds: u64,
    ) -> Result<Self, NotifierError> {
        let url = url.into();
        if url.is_empty() {
            return Err(NotifierError::Configuration("Webhook URL is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            url,
            bearer_token,
        })
    }
}

/// JSON body sent to the receiver
pub fn webhook_payload(obligation: &Obligation) -> serde_json::Value {
    json!({
        "fingerprint": obligation.fingerprint,
        "taxpayer_id": obligation.taxpayer_id,
        "period": obligation.period,
        "category": obligation.category.to_string(),
        "kind": obligation.kind.to_string(),
        "due_at": obligation.due_at.to_rfc3339(),
        "amount": obligation.amount.map(|a| a.to_string()),
        "amount_display": obligation.amount.map(format_amount),
        "currency": obligation.currency,
        "description": obligation.description,
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    #[instrument(skip(self, obligation), fields(fingerprint = %short(&obligation.fingerprint)))]
    async fn act(&self, obligation: &Obligation) -> ActionOutcome {
        let mut request = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, &obligation.fingerprint)
            .json(&webhook_payload(obligation));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let outcome = classify_error(&e);
                warn!(?outcome, "Webhook request failed");
                return outcome;
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let outcome = classify_status(status, &body);
        debug!(status = status.as_u16(), ?outcome, "Webhook delivery finished");
        outcome
    }
}
