// File-backed store
// The whole state is one JSON snapshot. Every mutation writes a temp file in
// the same directory and renames it over the snapshot, so a crash leaves
// either the old or the new state on disk, never a torn file.

use crate::errors::StoreError;
use crate::models::{ActionRecord, Obligation, RunSummary};
use crate::store::state::StoreState;
use crate::store::ObligationStore;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open the snapshot at `path`, starting empty when it does not exist yet
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                StoreState::default()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            obligations = state.obligations.len(),
            records = state.records.len(),
            "File store opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Apply `mutate` to a copy of the state, persist it, then publish it.
    /// On any failure the in-memory state is left untouched.
    async fn update<T, F>(&self, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<T, StoreError>,
    {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let result = mutate(&mut next)?;
        persist(&self.path, &next).await?;
        *guard = next;
        Ok(result)
    }
}

async fn persist(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state)?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StoreError::FileSystemError(e.to_string()))?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::FileSystemError(format!("persist task failed: {}", e)))??;

    debug!("Store snapshot written");
    Ok(())
}

#[async_trait]
impl ObligationStore for FileStore {
    async fn has_succeeded(&self, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.has_succeeded(fingerprint))
    }

    async fn action_record(&self, fingerprint: &str) -> Result<Option<ActionRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(fingerprint).cloned())
    }

    async fn obligation(&self, fingerprint: &str) -> Result<Option<Obligation>, StoreError> {
        Ok(self.state.lock().await.obligations.get(fingerprint).cloned())
    }

    async fn upsert_obligation(&self, obligation: &Obligation) -> Result<(), StoreError> {
        self.update(|state| {
            state.upsert_obligation(obligation);
            Ok(())
        })
        .await
    }

    async fn record(&self, record: &ActionRecord) -> Result<(), StoreError> {
        self.update(|state| {
            state.record(record);
            Ok(())
        })
        .await
        .map_err(|e| match e {
            e if e.is_unavailable() => e,
            other => StoreError::CommitFailed {
                fingerprint: record.fingerprint.clone(),
                reason: other.to_string(),
            },
        })
    }

    async fn mark_superseded(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.update(|state| {
            state.mark_superseded(fingerprint);
            Ok(())
        })
        .await
    }

    async fn reset(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.update(|state| state.reset(fingerprint)).await
    }

    async fn awaiting_operator(&self) -> Result<Vec<ActionRecord>, StoreError> {
        Ok(self.state.lock().await.awaiting_operator())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        self.update(|state| {
            state.record_run(summary);
            Ok(())
        })
        .await
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        Ok(self.state.lock().await.recent_runs(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObligationKind, ObligationStatus, TriggerSource};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn obligation() -> Obligation {
        Obligation {
            fingerprint: "fp-1".to_string(),
            taxpayer_id: "tp-1".to_string(),
            period: "2026-Q1".to_string(),
            category: ObligationKind::PaymentDue,
            kind: ObligationKind::PaymentDue,
            due_at: Utc.with_ymd_and_hms(2026, 4, 12, 21, 59, 59).unwrap(),
            amount: Some(Decimal::new(12346, 2)),
            currency: Some("HUF".to_string()),
            description: None,
            status: ObligationStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.upsert_obligation(&obligation()).await.unwrap();
            store
                .record(&ActionRecord::success("fp-1", Utc::now(), 1))
                .await
                .unwrap();
            store
                .record_run(&RunSummary::new(TriggerSource::Manual, Utc::now()))
                .await
                .unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        assert!(reopened.has_succeeded("fp-1").await.unwrap());
        let stored = reopened.obligation("fp-1").await.unwrap().unwrap();
        assert_eq!(stored.amount, Some(Decimal::new(12346, 2)));
        assert_eq!(stored.status, ObligationStatus::Notified);
        assert_eq!(reopened.recent_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::InvalidJson(_))
        ));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStore::open(&path).await.unwrap();
        store.upsert_obligation(&obligation()).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
