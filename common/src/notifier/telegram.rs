// Telegram notifier
// Sends an HTML message through the Bot API `sendMessage` method.

use crate::errors::NotifierError;
use crate::fingerprint::short;
use crate::models::Obligation;
use crate::notifier::{classify_error, classify_status, render_message, ActionOutcome, Notifier};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout_seconds: u64,
    ) -> Result<Self, NotifierError> {
        let bot_token = bot_token.into();
        let chat_id = chat_id.into();
        if bot_token.is_empty() {
            return Err(NotifierError::Configuration("Telegram bot token is empty".to_string()));
        }
        if chat_id.is_empty() {
            return Err(NotifierError::Configuration("Telegram chat_id is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token,
            chat_id,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    #[instrument(skip(self, obligation), fields(fingerprint = %short(&obligation.fingerprint)))]
    async fn act(&self, obligation: &Obligation) -> ActionOutcome {
        let payload = json!({
            "chat_id": self.chat_id,
            "text": render_message(obligation),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let response = match self.client.post(self.endpoint()).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                // reqwest includes the URL, which carries the token
                let outcome = classify_error(&e.without_url());
                warn!(?outcome, "Telegram request failed");
                return outcome;
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        let outcome = match classify_status(status, &body) {
            ActionOutcome::Delivered => match serde_json::from_str::<ApiResponse>(&body) {
                Ok(api) if !api.ok => ActionOutcome::Permanent(
                    api.description
                        .unwrap_or_else(|| "Telegram API returned ok=false".to_string()),
                ),
                _ => ActionOutcome::Delivered,
            },
            other => other,
        };

        debug!(status = status.as_u16(), ?outcome, "Telegram sendMessage finished");
        outcome
    }
}
