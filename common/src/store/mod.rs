// Dedup/state store
// Durable record of which obligations have been acted on, plus run history.

pub mod file;
pub mod memory;
pub mod postgres;
mod state;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::errors::StoreError;
use crate::models::{ActionRecord, Obligation, RunSummary};
use async_trait::async_trait;

/// ObligationStore is the single source of truth for "already handled".
///
/// `record` is atomic per obligation: the action record and the obligation
/// status change together or not at all. A success record is never
/// overwritten.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObligationStore: Send + Sync {
    async fn has_succeeded(&self, fingerprint: &str) -> Result<bool, StoreError>;

    async fn action_record(&self, fingerprint: &str) -> Result<Option<ActionRecord>, StoreError>;

    async fn obligation(&self, fingerprint: &str) -> Result<Option<Obligation>, StoreError>;

    /// Insert a new obligation or merge fresh fields into the stored one
    async fn upsert_obligation(&self, obligation: &Obligation) -> Result<(), StoreError>;

    async fn record(&self, record: &ActionRecord) -> Result<(), StoreError>;

    async fn mark_superseded(&self, fingerprint: &str) -> Result<(), StoreError>;

    /// Operator reset: drop a non-success action record so the obligation is
    /// attempted again on the next run.
    async fn reset(&self, fingerprint: &str) -> Result<(), StoreError>;

    /// Records parked in permanent failure
    async fn awaiting_operator(&self) -> Result<Vec<ActionRecord>, StoreError>;

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError>;

    /// Most recent runs first
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError>;
}
