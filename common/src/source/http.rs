// HTTP source adapter
// GETs a JSON document of obligations and normalizes it.

use crate::errors::SourceError;
use crate::models::RawCandidate;
use crate::source::{normalize_document, CandidateStream, SourceAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};

/// HttpSource reads obligations from a JSON endpoint
pub struct HttpSource {
    name: String,
    url: String,
    bearer_token: Option<String>,
    timeout_seconds: u64,
    client: Client,
}

impl HttpSource {
    /// Create a new HttpSource with the specified timeout
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        bearer_token: Option<String>,
        timeout_seconds: u64,
    ) -> Result<Self, SourceError> {
        let name = name.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| SourceError::Unavailable {
                source_name: name.clone(),
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            name,
            url: url.into(),
            bearer_token,
            timeout_seconds,
            client,
        })
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Unavailable {
            source_name: self.name.clone(),
            reason: reason.into(),
        }
    }

    async fn fetch_document(&self) -> Result<Vec<RawCandidate>, SourceError> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(self.timeout_seconds)
            } else {
                self.unavailable(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let document: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(self.timeout_seconds)
            } else {
                SourceError::InvalidPayload(format!("response is not JSON: {}", e))
            }
        })?;

        normalize_document(document)
    }
}

#[async_trait]
impl SourceAdapter for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name, url = %self.url))]
    async fn fetch(&self, _now: DateTime<Utc>) -> Result<CandidateStream, SourceError> {
        let candidates = self.fetch_document().await?;
        debug!(count = candidates.len(), "Fetched candidates");
        Ok(stream::iter(candidates.into_iter().map(Ok)).boxed())
    }
}
