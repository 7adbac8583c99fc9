// In-memory store for tests and dry runs

use crate::errors::StoreError;
use crate::models::{ActionRecord, Obligation, RunSummary};
use crate::store::state::StoreState;
use crate::store::ObligationStore;
use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of action records held
    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

#[async_trait]
impl ObligationStore for MemoryStore {
    async fn has_succeeded(&self, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().await.has_succeeded(fingerprint))
    }

    async fn action_record(&self, fingerprint: &str) -> Result<Option<ActionRecord>, StoreError> {
        Ok(self.state.read().await.records.get(fingerprint).cloned())
    }

    async fn obligation(&self, fingerprint: &str) -> Result<Option<Obligation>, StoreError> {
        Ok(self.state.read().await.obligations.get(fingerprint).cloned())
    }

    async fn upsert_obligation(&self, obligation: &Obligation) -> Result<(), StoreError> {
        self.state.write().await.upsert_obligation(obligation);
        Ok(())
    }

    async fn record(&self, record: &ActionRecord) -> Result<(), StoreError> {
        self.state.write().await.record(record);
        Ok(())
    }

    async fn mark_superseded(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.state.write().await.mark_superseded(fingerprint);
        Ok(())
    }

    async fn reset(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.state.write().await.reset(fingerprint)
    }

    async fn awaiting_operator(&self) -> Result<Vec<ActionRecord>, StoreError> {
        Ok(self.state.read().await.awaiting_operator())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        self.state.write().await.record_run(summary);
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        Ok(self.state.read().await.recent_runs(limit))
    }
}
