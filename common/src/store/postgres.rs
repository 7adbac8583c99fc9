// PostgreSQL store
// Action record and obligation status are written in one transaction. The
// upsert's WHERE clause keeps a success record immutable even under races.

use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::{ActionRecord, Obligation, ObligationStatus, RecordOutcome, RunSummary};
use crate::store::ObligationStore;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, instrument};

const RECORD_COLUMNS: &str =
    "fingerprint, acted_at, outcome, attempt_count, last_error, next_attempt_at";

/// Repository-style store over the shared connection pool
pub struct PostgresStore {
    pool: DbPool,
}

impl PostgresStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connect-level failures stay `Unavailable`; anything else during a
    /// record write is a commit failure for that fingerprint.
    fn commit_error(fingerprint: &str, err: sqlx::Error) -> StoreError {
        match StoreError::from(err) {
            e if e.is_unavailable() => e,
            other => StoreError::CommitFailed {
                fingerprint: fingerprint.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl ObligationStore for PostgresStore {
    #[instrument(skip(self))]
    async fn has_succeeded(&self, fingerprint: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM action_records WHERE fingerprint = $1 AND outcome = $2)",
        )
        .bind(fingerprint)
        .bind(RecordOutcome::Success.to_string())
        .fetch_one(self.pool.pool())
        .await?;
        Ok(exists)
    }

    #[instrument(skip(self))]
    async fn action_record(&self, fingerprint: &str) -> Result<Option<ActionRecord>, StoreError> {
        let record = sqlx::query_as::<_, ActionRecord>(&format!(
            "SELECT {} FROM action_records WHERE fingerprint = $1",
            RECORD_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn obligation(&self, fingerprint: &str) -> Result<Option<Obligation>, StoreError> {
        let obligation = sqlx::query_as::<_, Obligation>(
            r#"
            SELECT fingerprint, taxpayer_id, period, category, kind, due_at,
                   amount, currency, description, status
            FROM obligations
            WHERE fingerprint = $1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(obligation)
    }

    #[instrument(skip(self, obligation), fields(fingerprint = %obligation.fingerprint))]
    async fn upsert_obligation(&self, obligation: &Obligation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO obligations (
                fingerprint, taxpayer_id, period, category, kind, due_at,
                amount, currency, description, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (fingerprint) DO UPDATE SET
                kind = EXCLUDED.kind,
                due_at = EXCLUDED.due_at,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                description = EXCLUDED.description,
                status = CASE
                    WHEN obligations.status = 'notified' THEN 'notified'
                    WHEN EXCLUDED.status = 'superseded' THEN 'superseded'
                    WHEN obligations.status = 'superseded' THEN EXCLUDED.status
                    ELSE obligations.status
                END,
                updated_at = NOW()
            "#,
        )
        .bind(&obligation.fingerprint)
        .bind(&obligation.taxpayer_id)
        .bind(&obligation.period)
        .bind(obligation.category.to_string())
        .bind(obligation.kind.to_string())
        .bind(obligation.due_at)
        .bind(obligation.amount)
        .bind(&obligation.currency)
        .bind(&obligation.description)
        .bind(obligation.status.to_string())
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(fingerprint = %record.fingerprint, outcome = %record.outcome))]
    async fn record(&self, record: &ActionRecord) -> Result<(), StoreError> {
        let fp = record.fingerprint.as_str();
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Self::commit_error(fp, e))?;

        let written = sqlx::query(
            r#"
            INSERT INTO action_records (
                fingerprint, acted_at, outcome, attempt_count, last_error, next_attempt_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (fingerprint) DO UPDATE SET
                acted_at = EXCLUDED.acted_at,
                outcome = EXCLUDED.outcome,
                attempt_count = EXCLUDED.attempt_count,
                last_error = EXCLUDED.last_error,
                next_attempt_at = EXCLUDED.next_attempt_at
            WHERE action_records.outcome <> 'success'
            "#,
        )
        .bind(fp)
        .bind(record.acted_at)
        .bind(record.outcome.to_string())
        .bind(record.attempt_count)
        .bind(&record.last_error)
        .bind(record.next_attempt_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::commit_error(fp, e))?
        .rows_affected();

        if written > 0 {
            sqlx::query(
                r#"
                UPDATE obligations
                SET status = $2, updated_at = NOW()
                WHERE fingerprint = $1 AND status <> 'notified'
                "#,
            )
            .bind(fp)
            .bind(record.obligation_status().to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::commit_error(fp, e))?;
        } else {
            debug!("Existing success record left untouched");
        }

        tx.commit().await.map_err(|e| Self::commit_error(fp, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_superseded(&self, fingerprint: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE obligations
            SET status = $2, updated_at = NOW()
            WHERE fingerprint = $1 AND status <> 'notified'
            "#,
        )
        .bind(fingerprint)
        .bind(ObligationStatus::Superseded.to_string())
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset(&self, fingerprint: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.pool().begin().await?;

        let outcome: Option<String> = sqlx::query_scalar(
            "SELECT outcome FROM action_records WHERE fingerprint = $1 FOR UPDATE",
        )
        .bind(fingerprint)
        .fetch_optional(&mut *tx)
        .await?;

        match outcome.as_deref() {
            None => {
                return Err(StoreError::NotFound(format!(
                    "no action record for {}",
                    fingerprint
                )))
            }
            Some("success") => return Err(StoreError::SuccessIsImmutable(fingerprint.to_string())),
            Some(_) => {}
        }

        sqlx::query("DELETE FROM action_records WHERE fingerprint = $1")
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE obligations SET status = $2, updated_at = NOW() WHERE fingerprint = $1",
        )
        .bind(fingerprint)
        .bind(ObligationStatus::Pending.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn awaiting_operator(&self) -> Result<Vec<ActionRecord>, StoreError> {
        let records = sqlx::query_as::<_, ActionRecord>(&format!(
            "SELECT {} FROM action_records WHERE outcome = $1 ORDER BY acted_at",
            RECORD_COLUMNS
        ))
        .bind(RecordOutcome::PermanentFailure.to_string())
        .fetch_all(self.pool.pool())
        .await?;
        Ok(records)
    }

    #[instrument(skip(self, summary), fields(run_id = %summary.run_id))]
    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_history (
                run_id, trigger, started_at, finished_at, outcome,
                fetched, succeeded, failed, summary
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.trigger.to_string())
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.outcome.to_string())
        .bind(summary.fetched as i32)
        .bind(summary.succeeded as i32)
        .bind(summary.failed as i32)
        .bind(Json(summary))
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT summary FROM run_history ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(self.pool.pool())
        .await?;

        rows.into_iter()
            .map(|row| -> Result<RunSummary, StoreError> {
                let Json(summary): Json<RunSummary> = row.try_get("summary")?;
                Ok(summary)
            })
            .collect()
    }
}
