// In-process store state shared by the memory and file backends

use crate::errors::StoreError;
use crate::models::{ActionRecord, Obligation, ObligationStatus, RunSummary};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Run history entries kept by the non-database backends
pub(crate) const MAX_RUN_HISTORY: usize = 500;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    pub obligations: BTreeMap<String, Obligation>,
    #[serde(default)]
    pub records: BTreeMap<String, ActionRecord>,
    /// Oldest first
    #[serde(default)]
    pub runs: VecDeque<RunSummary>,
}

impl StoreState {
    pub fn has_succeeded(&self, fingerprint: &str) -> bool {
        self.records
            .get(fingerprint)
            .map_or(false, ActionRecord::is_success)
    }

    pub fn upsert_obligation(&mut self, obligation: &Obligation) {
        match self.obligations.get_mut(&obligation.fingerprint) {
            Some(stored) => stored.merge_from(obligation),
            None => {
                self.obligations
                    .insert(obligation.fingerprint.clone(), obligation.clone());
            }
        }
    }

    /// Returns false when an existing success record made this a no-op
    pub fn record(&mut self, record: &ActionRecord) -> bool {
        if self.has_succeeded(&record.fingerprint) {
            return false;
        }
        self.records
            .insert(record.fingerprint.clone(), record.clone());
        if let Some(obligation) = self.obligations.get_mut(&record.fingerprint) {
            if obligation.status != ObligationStatus::Notified {
                obligation.status = record.obligation_status();
            }
        }
        true
    }

    pub fn mark_superseded(&mut self, fingerprint: &str) {
        if let Some(obligation) = self.obligations.get_mut(fingerprint) {
            if obligation.status != ObligationStatus::Notified {
                obligation.status = ObligationStatus::Superseded;
            }
        }
    }

    pub fn reset(&mut self, fingerprint: &str) -> Result<(), StoreError> {
        match self.records.get(fingerprint) {
            None => Err(StoreError::NotFound(format!(
                "no action record for {}",
                fingerprint
            ))),
            Some(record) if record.is_success() => {
                Err(StoreError::SuccessIsImmutable(fingerprint.to_string()))
            }
            Some(_) => {
                self.records.remove(fingerprint);
                if let Some(obligation) = self.obligations.get_mut(fingerprint) {
                    obligation.status = ObligationStatus::Pending;
                }
                Ok(())
            }
        }
    }

    pub fn awaiting_operator(&self) -> Vec<ActionRecord> {
        let mut parked: Vec<ActionRecord> = self
            .records
            .values()
            .filter(|r| r.is_permanent_failure())
            .cloned()
            .collect();
        parked.sort_by_key(|r| r.acted_at);
        parked
    }

    pub fn record_run(&mut self, summary: &RunSummary) {
        self.runs.push_back(summary.clone());
        while self.runs.len() > MAX_RUN_HISTORY {
            self.runs.pop_front();
        }
    }

    pub fn recent_runs(&self, limit: usize) -> Vec<RunSummary> {
        self.runs.iter().rev().take(limit).cloned().collect()
    }
}
