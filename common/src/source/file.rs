// File source adapter
// Reads a JSON feed from disk. A missing or unreadable file is an unavailable
// source, never an empty one.

use crate::errors::SourceError;
use crate::source::{normalize_document, CandidateStream, SourceAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use tracing::{debug, instrument};

pub struct FileSource {
    name: String,
    path: PathBuf,
}

impl FileSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name, path = %self.path.display()))]
    async fn fetch(&self, _now: DateTime<Utc>) -> Result<CandidateStream, SourceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::Unavailable {
                source_name: self.name.clone(),
                reason: format!("cannot read {}: {}", self.path.display(), e),
            })?;

        let document: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| SourceError::InvalidPayload(format!("invalid JSON: {}", e)))?;

        let candidates = normalize_document(document)?;
        debug!(count = candidates.len(), "Read candidates from file");
        Ok(stream::iter(candidates.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_reads_feed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(
            &path,
            r#"{"obligations":[{"taxpayer_id":"tp-1","period":"2026-Q1","kind":"filing","due_at":"2026-04-15"}]}"#,
        )
        .unwrap();

        let source = FileSource::new("feed", &path);
        let candidates: Vec<_> = source
            .fetch(Utc::now())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, "filing");
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new("feed", dir.path().join("absent.json"));
        let result = source.fetch(Utc::now()).await;
        assert!(matches!(result, Err(SourceError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_garbage_file_is_invalid_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(&path, "not json").unwrap();
        let result = FileSource::new("feed", &path).fetch(Utc::now()).await;
        assert!(matches!(result, Err(SourceError::InvalidPayload(_))));
    }
}
