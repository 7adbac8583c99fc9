// Escalation of permanently failed obligations
//
// A permanent failure parks the obligation: no run retries it automatically.
// An operator inspects it and releases it with `manual_retry`, after which
// the next run attempts it from a fresh attempt counter.

use crate::errors::StoreError;
use crate::fingerprint::short;
use crate::models::ActionRecord;
use crate::store::ObligationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Operator-facing handle over parked obligations
#[derive(Clone)]
pub struct Escalation {
    store: Arc<dyn ObligationStore>,
}

impl Escalation {
    pub fn new(store: Arc<dyn ObligationStore>) -> Self {
        Self { store }
    }

    /// Parked records are never acted on automatically
    pub fn is_parked(record: &ActionRecord) -> bool {
        record.is_permanent_failure()
    }

    /// Log an obligation that just reached permanent failure
    pub fn escalate(record: &ActionRecord) {
        warn!(
            fingerprint = %short(&record.fingerprint),
            attempt_count = record.attempt_count,
            error = record.last_error.as_deref().unwrap_or("unknown"),
            "Obligation escalated to permanent failure; operator action required"
        );
    }

    /// Release a parked (or backing-off) obligation for the next run.
    /// Returns the record that was cleared.
    pub async fn manual_retry(&self, fingerprint: &str) -> Result<ActionRecord, StoreError> {
        let record = self
            .store
            .action_record(fingerprint)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("no action record for {}", fingerprint)))?;

        if record.is_success() {
            return Err(StoreError::SuccessIsImmutable(fingerprint.to_string()));
        }

        self.store.reset(fingerprint).await?;

        info!(
            fingerprint = %short(fingerprint),
            previous_outcome = %record.outcome,
            previous_attempts = record.attempt_count,
            "Obligation released for retry by operator"
        );
        Ok(record)
    }

    pub async fn stats(&self) -> Result<EscalationStats, StoreError> {
        let parked = self.store.awaiting_operator().await?;
        Ok(EscalationStats {
            awaiting_operator: parked.len(),
            oldest: parked.iter().map(|r| r.acted_at).min(),
            fingerprints: parked.into_iter().map(|r| r.fingerprint).collect(),
        })
    }
}

/// Summary of parked obligations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationStats {
    pub awaiting_operator: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub fingerprints: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordOutcome;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn parked(fp: &str, acted_at: DateTime<Utc>) -> ActionRecord {
        ActionRecord {
            fingerprint: fp.to_string(),
            acted_at,
            outcome: RecordOutcome::PermanentFailure,
            attempt_count: 5,
            last_error: Some("HTTP 400".to_string()),
            next_attempt_at: None,
        }
    }

    #[tokio::test]
    async fn test_manual_retry_clears_parked_record() {
        let store = Arc::new(MemoryStore::new());
        store.record(&parked("fp-1", Utc::now())).await.unwrap();
        let escalation = Escalation::new(store.clone());

        let cleared = escalation.manual_retry("fp-1").await.unwrap();
        assert_eq!(cleared.attempt_count, 5);
        assert!(store.action_record("fp-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_retry_refuses_success_and_unknown() {
        let store = Arc::new(MemoryStore::new());
        store
            .record(&ActionRecord::success("done", Utc::now(), 1))
            .await
            .unwrap();
        let escalation = Escalation::new(store);

        assert!(matches!(
            escalation.manual_retry("done").await,
            Err(StoreError::SuccessIsImmutable(_))
        ));
        assert!(matches!(
            escalation.manual_retry("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_reports_oldest() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store.record(&parked("a", now)).await.unwrap();
        store
            .record(&parked("b", now - Duration::days(2)))
            .await
            .unwrap();

        let stats = Escalation::new(store).stats().await.unwrap();
        assert_eq!(stats.awaiting_operator, 2);
        assert_eq!(stats.oldest, Some(now - Duration::days(2)));
        assert_eq!(stats.fingerprints, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_only_permanent_failures_are_parked() {
        assert!(Escalation::is_parked(&parked("a", Utc::now())));
        assert!(!Escalation::is_parked(&ActionRecord::success("a", Utc::now(), 1)));
    }
}
