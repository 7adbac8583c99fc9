// Run coordinator
//
// One run is: Fetching -> Evaluating -> Filtering -> Acting -> Recording.
// Fetch failure and store unavailability abort the run; everything after
// Filtering fails per obligation and is aggregated into the RunSummary.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Settings;
use crate::errors::{LockError, SourceError, StoreError};
use crate::escalation::Escalation;
use crate::evaluator::RuleEvaluator;
use crate::fingerprint::short;
use crate::lock::{RunLease, RunLock};
use crate::models::{
    ActionRecord, Obligation, ObligationStatus, RawCandidate, RecordOutcome, RunOutcome, RunPhase,
    RunSummary, SkipReason, TriggerSource,
};
use crate::notifier::{ActionOutcome, Notifier};
use crate::retry::RetryPolicy;
use crate::source::SourceAdapter;
use crate::store::ObligationStore;
use crate::telemetry::{self, AlertNotifier, FailureStage, LogAlertNotifier};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Timeouts and limits for a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub fetch_timeout: Duration,
    pub act_timeout: Duration,
    /// Maximum notifier calls in flight
    pub concurrency: usize,
    pub lease_ttl: Duration,
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            fetch_timeout: Duration::from_secs(settings.source.timeout_seconds),
            act_timeout: Duration::from_secs(settings.notifier.timeout_seconds),
            concurrency: settings.notifier.concurrency,
            lease_ttl: Duration::from_secs(settings.lock.ttl_seconds),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            act_timeout: Duration::from_secs(15),
            concurrency: 4,
            lease_ttl: Duration::from_secs(900),
        }
    }
}

/// Result of acting on one obligation
#[derive(Debug)]
enum Disposition {
    Delivered,
    Transient,
    Permanent,
    CommitFailed,
    Skipped(SkipReason),
}

/// Aborts the run before Acting
enum Abort {
    Source(SourceError),
    Store(StoreError),
}

/// RunCoordinator owns one pass of the pipeline
pub struct RunCoordinator {
    source: Arc<dyn SourceAdapter>,
    evaluator: RuleEvaluator,
    store: Arc<dyn ObligationStore>,
    notifier: Arc<dyn Notifier>,
    lock: Arc<dyn RunLock>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    alerts: Arc<dyn AlertNotifier>,
    options: RunOptions,
    shutdown: watch::Receiver<bool>,
}

impl RunCoordinator {
    pub fn new(
        source: Arc<dyn SourceAdapter>,
        evaluator: RuleEvaluator,
        store: Arc<dyn ObligationStore>,
        notifier: Arc<dyn Notifier>,
        lock: Arc<dyn RunLock>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        options: RunOptions,
    ) -> Self {
        // Never signalled unless with_shutdown replaces it
        let (_tx, shutdown) = watch::channel(false);
        Self {
            source,
            evaluator,
            store,
            notifier,
            lock,
            breaker,
            retry,
            alerts: Arc::new(LogAlertNotifier),
            options,
            shutdown,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertNotifier>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Stop dispatching new actions once `shutdown` flips to true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the pipeline once at the current time
    pub async fn run_once(&self, trigger: TriggerSource) -> RunSummary {
        self.run_at(trigger, Utc::now()).await
    }

    /// Run the pipeline with an explicit evaluation clock
    #[instrument(skip(self), fields(source = %self.source.name()))]
    pub async fn run_at(&self, trigger: TriggerSource, now: DateTime<Utc>) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::new(trigger, now);

        let lease = match self
            .lock
            .try_acquire(self.source.name(), self.options.lease_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(LockError::AlreadyHeld(resource)) => {
                warn!(
                    run_id = %summary.run_id,
                    resource = %resource,
                    "Previous run still holds the lease; skipping overlapping trigger"
                );
                summary.outcome = RunOutcome::SkippedOverlap;
                summary.finished_at = Some(Utc::now());
                telemetry::record_run(summary.outcome, started.elapsed().as_secs_f64());
                return summary;
            }
            Err(e) => {
                error!(run_id = %summary.run_id, error = %e, "Failed to acquire run lease");
                summary.outcome = RunOutcome::StoreUnavailable;
                summary.error = Some(format!("run lease unavailable: {}", e));
                return self.finish(summary, started).await;
            }
        };

        info!(run_id = %summary.run_id, trigger = %trigger, "Run started");

        if let Err(abort) = self.execute_leased(&lease, &mut summary, now).await {
            match abort {
                Abort::Source(e) => {
                    error!(run_id = %summary.run_id, error = %e, "Source fetch failed; run aborted");
                    summary.outcome = RunOutcome::SourceUnavailable;
                    summary.error = Some(e.to_string());
                }
                Abort::Store(e) => {
                    error!(run_id = %summary.run_id, error = %e, "Store unavailable; run aborted");
                    summary.outcome = RunOutcome::StoreUnavailable;
                    summary.error = Some(e.to_string());
                }
            }
        }

        let summary = self.finish(summary, started).await;
        let held_for_ms = lease.held_for().as_millis() as u64;
        match lease.release().await {
            Ok(()) => debug!(held_for_ms, "Run lease released"),
            Err(e) => warn!(held_for_ms, error = %e, "Failed to release run lease; it expires with its TTL"),
        }
        summary
    }

    /// Execute while renewing the lease every third of its TTL
    async fn execute_leased(
        &self,
        lease: &RunLease,
        summary: &mut RunSummary,
        now: DateTime<Utc>,
    ) -> Result<(), Abort> {
        let ttl = self.options.lease_ttl;
        let every = (ttl / 3).max(Duration::from_secs(1));
        let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

        let work = self.execute(summary, now);
        tokio::pin!(work);
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = renewals.tick() => {
                    if let Err(e) = lease.renew(ttl).await {
                        error!(
                            resource = %lease.resource(),
                            error = %e,
                            "Failed to renew run lease; another run may start"
                        );
                    }
                }
            }
        }
    }

    async fn execute(&self, summary: &mut RunSummary, now: DateTime<Utc>) -> Result<(), Abort> {
        summary.phase_reached = RunPhase::Fetching;
        let candidates = self.fetch(now).await.map_err(Abort::Source)?;
        summary.fetched = candidates.len();

        summary.phase_reached = RunPhase::Evaluating;
        let obligations = self.evaluate_all(&candidates, now, summary);

        summary.phase_reached = RunPhase::Filtering;
        let actionable = self
            .filter(obligations, now, summary)
            .await
            .map_err(Abort::Store)?;

        summary.phase_reached = RunPhase::Acting;
        self.breaker.reset().await;
        let dispositions: Vec<(String, Disposition)> = stream::iter(actionable)
            .map(|(obligation, previous)| async move {
                let fingerprint = obligation.fingerprint.clone();
                let disposition = self.act_and_record(obligation, previous, now).await;
                (fingerprint, disposition)
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        summary.phase_reached = RunPhase::Recording;
        for (fingerprint, disposition) in dispositions {
            match disposition {
                Disposition::Delivered => summary.succeeded += 1,
                Disposition::Transient | Disposition::CommitFailed => summary.failed += 1,
                Disposition::Permanent => {
                    summary.failed += 1;
                    summary.permanent_failures.push(fingerprint);
                }
                Disposition::Skipped(reason) => summary.skip(reason),
            }
        }
        summary.permanent_failures.sort();

        Ok(())
    }

    /// Drain the whole source stream within the fetch timeout
    async fn fetch(&self, now: DateTime<Utc>) -> Result<Vec<RawCandidate>, SourceError> {
        let limit = self.options.fetch_timeout;
        let drained = tokio::time::timeout(limit, async {
            let stream = self.source.fetch(now).await?;
            stream.try_collect::<Vec<_>>().await
        })
        .await;

        match drained {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(limit.as_secs())),
        }
    }

    fn evaluate_all(
        &self,
        candidates: &[RawCandidate],
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Vec<Obligation> {
        let mut seen = HashSet::new();
        let mut obligations = Vec::with_capacity(candidates.len());

        for (index, raw) in candidates.iter().enumerate() {
            match self.evaluator.evaluate(raw, now) {
                Ok(obligation) => {
                    if seen.insert(obligation.fingerprint.clone()) {
                        obligations.push(obligation);
                    } else {
                        debug!(
                            fingerprint = %short(&obligation.fingerprint),
                            "Duplicate candidate in one fetch; keeping the first"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        index = index,
                        taxpayer_id = %raw.taxpayer_id,
                        period = %raw.period,
                        error = %e,
                        "Candidate failed evaluation"
                    );
                    summary.evaluation_errors += 1;
                    telemetry::record_failure(FailureStage::Evaluation);
                }
            }
        }

        obligations
    }

    /// Persist what was seen and keep what still needs an action, paired
    /// with its previous action record.
    ///
    /// Only an unavailable store aborts the run; any other store error fails
    /// that one obligation.
    async fn filter(
        &self,
        obligations: Vec<Obligation>,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<Vec<(Obligation, Option<ActionRecord>)>, StoreError> {
        let mut actionable = Vec::new();

        for obligation in obligations {
            let fingerprint = obligation.fingerprint.clone();
            match self.triage(obligation, now, summary).await {
                Ok(Some(pair)) => actionable.push(pair),
                Ok(None) => {}
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    warn!(
                        fingerprint = %short(&fingerprint),
                        error = %e,
                        "Store rejected obligation; continuing with the rest"
                    );
                    summary.failed += 1;
                    telemetry::record_failure(FailureStage::Commit);
                }
            }
        }

        Ok(actionable)
    }

    async fn triage(
        &self,
        obligation: Obligation,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<Option<(Obligation, Option<ActionRecord>)>, StoreError> {
        self.store.upsert_obligation(&obligation).await?;

        if obligation.status == ObligationStatus::Superseded {
            self.store.mark_superseded(&obligation.fingerprint).await?;
            summary.skip(SkipReason::Superseded);
            return Ok(None);
        }

        let previous = self.store.action_record(&obligation.fingerprint).await?;
        if let Some(record) = &previous {
            if record.is_success() {
                summary.skip(SkipReason::AlreadyHandled);
                return Ok(None);
            }
            if Escalation::is_parked(record) {
                summary.skip(SkipReason::AwaitingOperator);
                summary.awaiting_operator.push(obligation.fingerprint.clone());
                return Ok(None);
            }
            if RetryPolicy::is_backing_off(record, now) {
                summary.skip(SkipReason::BackingOff);
                return Ok(None);
            }
        }

        if !self.evaluator.is_actionable(&obligation, now) {
            summary.skip(SkipReason::NotYetDue);
            return Ok(None);
        }

        Ok(Some((obligation, previous)))
    }

    #[instrument(skip_all, fields(fingerprint = %short(&obligation.fingerprint), kind = %obligation.kind))]
    async fn act_and_record(
        &self,
        obligation: Obligation,
        previous: Option<ActionRecord>,
        now: DateTime<Utc>,
    ) -> Disposition {
        if *self.shutdown.borrow() {
            debug!("Shutdown requested; not dispatching");
            return Disposition::Skipped(SkipReason::ShuttingDown);
        }

        let attempt = RetryPolicy::next_attempt(previous.as_ref());
        let outcome = match self
            .breaker
            .act(self.notifier.as_ref(), &obligation, self.options.act_timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(open) => {
                debug!(breaker = %open.name, "Circuit open; deferring obligation");
                return Disposition::Skipped(SkipReason::CircuitOpen);
            }
        };

        let acted_at = now;
        let record = match &outcome {
            ActionOutcome::Delivered => {
                self.retry.on_success(&obligation.fingerprint, attempt, acted_at)
            }
            ActionOutcome::Transient(reason) => {
                self.retry
                    .on_transient(&obligation.fingerprint, attempt, reason, acted_at)
            }
            ActionOutcome::Permanent(reason) => {
                self.retry
                    .on_permanent(&obligation.fingerprint, attempt, reason, acted_at)
            }
        };

        if let Err(e) = self.store.record(&record).await {
            // The action may have happened; with no record the next run acts again
            error!(
                error = %e,
                outcome = %record.outcome,
                "Failed to commit action record"
            );
            telemetry::record_failure(FailureStage::Commit);
            return Disposition::CommitFailed;
        }

        match record.outcome {
            RecordOutcome::Success => {
                info!(attempt = attempt, "Obligation handled");
                telemetry::record_notified(&obligation.kind.to_string());
                Disposition::Delivered
            }
            RecordOutcome::TransientFailure => {
                warn!(
                    attempt = attempt,
                    max_attempts = self.retry.max_attempts(),
                    next_attempt_at = ?record.next_attempt_at,
                    error = record.last_error.as_deref().unwrap_or(""),
                    "Transient action failure; will retry"
                );
                telemetry::record_failure(FailureStage::Transient);
                Disposition::Transient
            }
            RecordOutcome::PermanentFailure => {
                Escalation::escalate(&record);
                telemetry::record_failure(FailureStage::Permanent);
                Disposition::Permanent
            }
        }
    }

    async fn finish(&self, mut summary: RunSummary, started: Instant) -> RunSummary {
        summary.finished_at = Some(Utc::now());

        if let Err(e) = self.store.record_run(&summary).await {
            warn!(run_id = %summary.run_id, error = %e, "Failed to store run history");
        }

        let duration = started.elapsed().as_secs_f64();
        telemetry::record_run(summary.outcome, duration);
        if summary.outcome == RunOutcome::Completed {
            telemetry::update_pending(pending_count(&summary));
        }

        if telemetry::should_trigger_alert(&summary) {
            if let Err(e) = self.alerts.send_alert(&summary).await {
                error!(run_id = %summary.run_id, error = %e, "Failed to send run alert");
            }
        }

        info!(
            run_id = %summary.run_id,
            outcome = %summary.outcome,
            phase_reached = %summary.phase_reached,
            fetched = summary.fetched,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped_total(),
            evaluation_errors = summary.evaluation_errors,
            permanent_failures = summary.permanent_failures.len(),
            awaiting_operator = summary.awaiting_operator.len(),
            duration_seconds = duration,
            "Run finished"
        );

        summary
    }
}

/// Actionable obligations left without a success record
fn pending_count(summary: &RunSummary) -> usize {
    let deferred = [
        SkipReason::BackingOff,
        SkipReason::CircuitOpen,
        SkipReason::ShuttingDown,
        SkipReason::AwaitingOperator,
    ]
    .iter()
    .filter_map(|reason| summary.skipped.get(reason))
    .sum::<usize>();
    summary.failed + deferred
}
