// Scheduler engine: turns the configured schedule and manual triggers into runs

use crate::coordinator::RunCoordinator;
use crate::errors::ScheduleError;
use crate::models::{RunSummary, Schedule, TriggerSource};
use crate::schedule::ScheduleTrigger;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub schedule: Schedule,
    /// Fire one run immediately when the loop starts
    pub run_on_startup: bool,
}

/// Main scheduler engine implementation
///
/// Each trigger spawns a run. A trigger that arrives while a run is still in
/// flight is handed to the coordinator anyway; the run lease turns it into a
/// skipped overlap.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    coordinator: Arc<RunCoordinator>,
    trigger_tx: mpsc::Sender<TriggerSource>,
    trigger_rx: Mutex<mpsc::Receiver<TriggerSource>>,
    shutdown: watch::Receiver<bool>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        coordinator: Arc<RunCoordinator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        Self {
            config,
            coordinator,
            trigger_tx,
            trigger_rx: Mutex::new(trigger_rx),
            shutdown,
        }
    }

    /// Sender for manual triggers (SIGHUP, tests)
    pub fn trigger_handle(&self) -> mpsc::Sender<TriggerSource> {
        self.trigger_tx.clone()
    }

    /// Next scheduled fire after `after`, paired with the matching deadline
    /// on the tokio clock. `None` for on-demand schedules.
    fn next_deadline(
        &self,
        after: DateTime<Utc>,
        at: Instant,
    ) -> Result<Option<(DateTime<Utc>, Instant)>, ScheduleError> {
        Ok(self.config.schedule.next_fire_time(after)?.map(|fire| {
            let wait = (fire - after).to_std().unwrap_or(Duration::ZERO);
            (fire, at + wait)
        }))
    }

    fn spawn_run(&self, runs: &mut JoinSet<RunSummary>, trigger: TriggerSource) {
        let coordinator = self.coordinator.clone();
        runs.spawn(async move { coordinator.run_once(trigger).await });
    }

    /// Run the trigger loop until shutdown, then wait for in-flight runs
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), ScheduleError> {
        info!(schedule = ?self.config.schedule, "Starting scheduler engine");

        let mut shutdown = self.shutdown.clone();
        let mut triggers = self.trigger_rx.lock().await;
        let mut runs = JoinSet::new();

        if self.config.run_on_startup {
            self.spawn_run(&mut runs, TriggerSource::Startup);
        }

        // Advanced only when the scheduled branch fires, so manual triggers
        // and run completions never shift the cadence.
        let mut next = self.next_deadline(Utc::now(), Instant::now())?;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some((fire, _)) = next {
                debug!(next_run_at = %fire, "Waiting for next scheduled run");
            }

            tokio::select! {
                _ = sleep_until_or_forever(next.map(|(_, deadline)| deadline)) => {
                    self.spawn_run(&mut runs, TriggerSource::Scheduled);
                    if let Some((fire, deadline)) = next {
                        next = self.next_deadline(fire, deadline)?;
                        // Fell behind (suspended host, stalled loop): resync to now
                        if next.is_some_and(|(_, deadline)| deadline < Instant::now()) {
                            warn!("Scheduler fell behind; skipping missed fire times");
                            next = self.next_deadline(Utc::now(), Instant::now())?;
                        }
                    }
                }
                Some(trigger) = triggers.recv() => {
                    info!(trigger = %trigger, "Manual trigger received");
                    self.spawn_run(&mut runs, trigger);
                }
                Some(finished) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "Run task failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown sender dropped, stopping scheduler");
                    }
                    break;
                }
            }
        }

        info!(in_flight = runs.len(), "Shutdown signal received, waiting for in-flight runs");
        while let Some(finished) = runs.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Run task failed");
            }
        }

        info!("Scheduler engine stopped");
        Ok(())
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
