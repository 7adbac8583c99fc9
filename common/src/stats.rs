// Run history report for the `stats` command

use crate::errors::StoreError;
use crate::escalation::{Escalation, EscalationStats};
use crate::models::{RunOutcome, RunSummary};
use crate::store::ObligationStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Aggregated view over stored run summaries
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub generated_at: DateTime<Utc>,
    pub total: Totals,
    /// Same counters restricted to the last seven days
    pub last_week: Totals,
    pub outcomes: BTreeMap<String, usize>,
    pub last_run: Option<RunSummary>,
    pub escalation: EscalationStats,
    attempted_runs: usize,
    clean_runs: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub runs: usize,
    pub notified: usize,
    pub failed: usize,
    pub evaluation_errors: usize,
    pub permanent_failures: usize,
}

impl Totals {
    fn add(&mut self, run: &RunSummary) {
        self.runs += 1;
        self.notified += run.succeeded;
        self.failed += run.failed;
        self.evaluation_errors += run.evaluation_errors;
        self.permanent_failures += run.permanent_failures.len();
    }
}

impl StatsReport {
    /// Build a report from runs ordered newest first
    pub fn build(runs: &[RunSummary], escalation: EscalationStats, now: DateTime<Utc>) -> Self {
        let week_start = now - Duration::days(7);
        let mut total = Totals::default();
        let mut last_week = Totals::default();
        let mut outcomes = BTreeMap::new();
        let mut attempted_runs = 0;
        let mut clean_runs = 0;

        for run in runs {
            if run.outcome != RunOutcome::SkippedOverlap {
                attempted_runs += 1;
            }
            if run.is_success() {
                clean_runs += 1;
            }
            total.add(run);
            if run.started_at > week_start {
                last_week.add(run);
            }
            *outcomes.entry(run.outcome.to_string()).or_insert(0) += 1;
        }

        Self {
            generated_at: now,
            total,
            last_week,
            outcomes,
            last_run: runs.first().cloned(),
            escalation,
            attempted_runs,
            clean_runs,
        }
    }

    /// Share of attempted runs (overlaps excluded) that completed with no
    /// failed obligation
    pub fn success_rate(&self) -> Option<f64> {
        if self.attempted_runs == 0 {
            return None;
        }
        Some(self.clean_runs as f64 / self.attempted_runs as f64)
    }
}

/// Load the report from a store
pub async fn collect(
    store: Arc<dyn ObligationStore>,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<StatsReport, StoreError> {
    let runs = store.recent_runs(limit).await?;
    let escalation = Escalation::new(store).stats().await?;
    Ok(StatsReport::build(&runs, escalation, now))
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run statistics")?;
        writeln!(f)?;
        write_totals(f, "All recorded runs", &self.total)?;
        write_totals(f, "Last 7 days", &self.last_week)?;

        if !self.outcomes.is_empty() {
            writeln!(f, "Outcomes:")?;
            for (outcome, count) in &self.outcomes {
                writeln!(f, "  {}: {}", outcome, count)?;
            }
            writeln!(f)?;
        }

        if let Some(rate) = self.success_rate() {
            writeln!(f, "Completed runs: {:.1}%", rate * 100.0)?;
        }

        match &self.last_run {
            Some(run) => {
                writeln!(
                    f,
                    "Last run: {} ({}, {}) notified={} failed={} skipped={}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    run.trigger,
                    run.outcome,
                    run.succeeded,
                    run.failed,
                    run.skipped_total()
                )?;
                if let Some(error) = &run.error {
                    writeln!(f, "  error: {}", error)?;
                }
            }
            None => writeln!(f, "Last run: never")?,
        }

        writeln!(f)?;
        writeln!(
            f,
            "Awaiting operator: {}",
            self.escalation.awaiting_operator
        )?;
        if let Some(oldest) = self.escalation.oldest {
            writeln!(f, "  oldest since {}", oldest.format("%Y-%m-%d %H:%M UTC"))?;
        }
        for fingerprint in &self.escalation.fingerprints {
            writeln!(f, "  {}", fingerprint)?;
        }
        Ok(())
    }
}

fn write_totals(f: &mut fmt::Formatter<'_>, title: &str, totals: &Totals) -> fmt::Result {
    writeln!(f, "{}:", title)?;
    writeln!(f, "  Runs: {}", totals.runs)?;
    writeln!(f, "  Notified: {}", totals.notified)?;
    writeln!(f, "  Failed: {}", totals.failed)?;
    writeln!(f, "  Evaluation errors: {}", totals.evaluation_errors)?;
    writeln!(f, "  Permanent failures: {}", totals.permanent_failures)?;
    writeln!(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionRecord, RecordOutcome, TriggerSource};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).unwrap()
    }

    fn run(days_ago: i64, outcome: RunOutcome, succeeded: usize, failed: usize) -> RunSummary {
        let mut summary = RunSummary::new(TriggerSource::Scheduled, now() - Duration::days(days_ago));
        summary.outcome = outcome;
        summary.succeeded = succeeded;
        summary.failed = failed;
        summary
    }

    #[test]
    fn test_build_splits_week_window() {
        let runs = vec![
            run(1, RunOutcome::Completed, 2, 0),
            run(3, RunOutcome::Completed, 1, 1),
            run(10, RunOutcome::SourceUnavailable, 0, 0),
            run(12, RunOutcome::SkippedOverlap, 0, 0),
        ];
        let report = StatsReport::build(&runs, EscalationStats::default(), now());

        assert_eq!(report.total.runs, 4);
        assert_eq!(report.total.notified, 3);
        assert_eq!(report.last_week.runs, 2);
        assert_eq!(report.last_week.failed, 1);
        assert_eq!(report.outcomes.get("completed"), Some(&2));
        assert_eq!(report.last_run.as_ref().map(|r| r.succeeded), Some(2));
        // 1 clean out of 3 attempted
        let rate = report.success_rate().unwrap();
        assert!((rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_history_renders() {
        let report = StatsReport::build(&[], EscalationStats::default(), now());
        assert_eq!(report.success_rate(), None);
        let text = report.to_string();
        assert!(text.contains("Last run: never"));
        assert!(text.contains("Awaiting operator: 0"));
    }

    #[tokio::test]
    async fn test_collect_includes_parked_obligations() {
        let store = Arc::new(MemoryStore::new());
        store.record_run(&run(0, RunOutcome::Completed, 0, 1)).await.unwrap();
        store
            .record(&ActionRecord {
                fingerprint: "fp-parked".to_string(),
                acted_at: now(),
                outcome: RecordOutcome::PermanentFailure,
                attempt_count: 5,
                last_error: Some("403".to_string()),
                next_attempt_at: None,
            })
            .await
            .unwrap();

        let report = collect(store, 50, now()).await.unwrap();
        assert_eq!(report.total.runs, 1);
        assert_eq!(report.escalation.awaiting_operator, 1);
        assert!(report.to_string().contains("fp-parked"));
    }
}
