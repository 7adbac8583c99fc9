// tax-bot binary entry point

mod cli;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use cli::{Cli, Commands};
use common::bootstrap;
use common::config::Settings;
use common::errors::StoreError;
use common::escalation::Escalation;
use common::models::{RunSummary, TriggerSource};
use common::scheduler::{SchedulerConfig, SchedulerEngine};
use common::stats;
use common::telemetry;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Configuration or startup failure
const EXIT_CONFIG: u8 = 3;
/// Fetch or store failure
const EXIT_UNAVAILABLE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logging is configured from settings, so load errors go straight to stderr
    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    ) {
        eprintln!("failed to initialize logging: {:#}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    let code = match dispatch(&cli, settings).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Startup failed");
            EXIT_CONFIG
        }
    };

    telemetry::shutdown_tracer();
    ExitCode::from(code)
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let settings = Settings::load_from_path(&cli.config_dir).with_context(|| {
        format!("failed to load configuration from {}", cli.config_dir.display())
    })?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    Ok(settings)
}

/// Run the selected command; `Err` means the bot could not start
async fn dispatch(cli: &Cli, settings: Settings) -> Result<u8> {
    match &cli.command {
        Commands::CheckConfig => {
            info!(
                source = %settings.source.name,
                schedule = ?settings.trigger.schedule,
                "Configuration is valid"
            );
            println!("configuration OK");
            Ok(0)
        }
        Commands::Once => {
            let store = bootstrap::init_store(&settings).await?;
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let coordinator = bootstrap::build_coordinator(&settings, store, shutdown_rx).await?;

            let summary = coordinator.run_once(TriggerSource::Manual).await;
            print_summary(&summary, cli.json)?;
            Ok(u8::try_from(summary.exit_code()).unwrap_or(EXIT_UNAVAILABLE))
        }
        Commands::Run => run_daemon(settings).await,
        Commands::Stats { limit } => {
            let store = bootstrap::init_store(&settings).await?;
            let limit = limit.unwrap_or(settings.observability.stats_window);
            match stats::collect(store, limit, Utc::now()).await {
                Ok(report) => {
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        print!("{}", report);
                    }
                    Ok(0)
                }
                Err(e) => {
                    error!(error = %e, "Failed to read run history");
                    Ok(EXIT_UNAVAILABLE)
                }
            }
        }
        Commands::Retry { fingerprint } => {
            let store = bootstrap::init_store(&settings).await?;
            match Escalation::new(store).manual_retry(fingerprint).await {
                Ok(previous) => {
                    println!(
                        "released {} (was {} after {} attempt(s))",
                        fingerprint, previous.outcome, previous.attempt_count
                    );
                    Ok(0)
                }
                Err(e @ (StoreError::NotFound(_) | StoreError::SuccessIsImmutable(_))) => {
                    eprintln!("{}", e);
                    Ok(1)
                }
                Err(e) => {
                    error!(error = %e, "Failed to release obligation");
                    Ok(EXIT_UNAVAILABLE)
                }
            }
        }
    }
}

async fn run_daemon(settings: Settings) -> Result<u8> {
    info!(source = %settings.source.name, "Starting tax-bot daemon");

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let store = bootstrap::init_store(&settings).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator = bootstrap::build_coordinator(&settings, store, shutdown_rx.clone()).await?;

    let engine = SchedulerEngine::new(
        SchedulerConfig {
            schedule: settings.trigger.schedule.clone(),
            run_on_startup: settings.trigger.run_on_startup,
        },
        Arc::new(coordinator),
        shutdown_rx,
    );

    spawn_manual_trigger(engine.trigger_handle());

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, finishing in-flight work");
        if shutdown_tx.send(true).is_err() {
            warn!("Scheduler already stopped");
        }
    });

    engine.start().await.context("Scheduler stopped with an error")?;
    info!("tax-bot daemon stopped");
    Ok(0)
}

#[cfg(unix)]
fn spawn_manual_trigger(trigger: mpsc::Sender<TriggerSource>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGHUP; manual trigger disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, triggering a run");
            if trigger.send(TriggerSource::Manual).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_manual_trigger(_trigger: mpsc::Sender<TriggerSource>) {}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM; only Ctrl+C stops the daemon");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "run {} {}: fetched={} notified={} failed={} skipped={} evaluation_errors={}",
        summary.run_id,
        summary.outcome,
        summary.fetched,
        summary.succeeded,
        summary.failed,
        summary.skipped_total(),
        summary.evaluation_errors
    );
    for (reason, count) in &summary.skipped {
        println!("  skipped {}: {}", reason, count);
    }
    for fingerprint in &summary.permanent_failures {
        println!("  permanent failure: {}", fingerprint);
    }
    for fingerprint in &summary.awaiting_operator {
        println!("  awaiting operator: {}", fingerprint);
    }
    if let Some(error) = &summary.error {
        println!("  error: {}", error);
    }
    Ok(())
}
