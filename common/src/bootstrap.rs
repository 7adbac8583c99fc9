// Bootstrap utilities: build the pipeline components from Settings

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{LockKind, NotifierKind, Settings, SourceKind, StoreKind};
use crate::coordinator::{RunCoordinator, RunOptions};
use crate::db::{DbPool, RedisPool};
use crate::evaluator::RuleEvaluator;
use crate::lock::{LocalRunLock, RedisRunLock, RunLock};
use crate::notifier::{LogNotifier, Notifier, TelegramNotifier, WebhookNotifier};
use crate::retry::RetryPolicy;
use crate::source::{FileSource, HttpSource, SourceAdapter};
use crate::store::{FileStore, MemoryStore, ObligationStore, PostgresStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Initialize the source adapter
///
/// # Errors
/// Returns error if the HTTP client cannot be built or a required field is missing
#[tracing::instrument(skip(settings))]
pub fn init_source(settings: &Settings) -> Result<Arc<dyn SourceAdapter>> {
    let config = &settings.source;
    let source: Arc<dyn SourceAdapter> = match config.kind {
        SourceKind::Http => {
            let url = config.url.clone().context("source.url is required for http")?;
            Arc::new(
                HttpSource::new(
                    config.name.clone(),
                    url,
                    config.bearer_token.clone(),
                    config.timeout_seconds,
                )
                .context("Failed to initialize HTTP source")?,
            )
        }
        SourceKind::File => {
            let path = config.path.clone().context("source.path is required for file")?;
            Arc::new(FileSource::new(config.name.clone(), path))
        }
    };

    info!(source = %config.name, kind = ?config.kind, "Source adapter initialized");
    Ok(source)
}

/// Initialize the notifier
///
/// # Errors
/// Returns error if the notifier configuration is incomplete
#[tracing::instrument(skip(settings))]
pub fn init_notifier(settings: &Settings) -> Result<Arc<dyn Notifier>> {
    let config = &settings.notifier;
    let notifier: Arc<dyn Notifier> = match config.kind {
        NotifierKind::Log => Arc::new(LogNotifier::new()),
        NotifierKind::Telegram => Arc::new(
            TelegramNotifier::new(
                config.telegram.api_base.clone(),
                config.telegram.bot_token.clone(),
                config.telegram.chat_id.clone(),
                config.timeout_seconds,
            )
            .context("Failed to initialize Telegram notifier")?,
        ),
        NotifierKind::Webhook => Arc::new(
            WebhookNotifier::new(
                config.webhook.url.clone(),
                config.webhook.bearer_token.clone(),
                config.timeout_seconds,
            )
            .context("Failed to initialize webhook notifier")?,
        ),
    };

    info!(notifier = notifier.name(), "Notifier initialized");
    Ok(notifier)
}

/// Initialize the obligation store, running migrations for Postgres
///
/// # Errors
/// Returns error if the store cannot be opened
#[tracing::instrument(skip(settings))]
pub async fn init_store(settings: &Settings) -> Result<Arc<dyn ObligationStore>> {
    let config = &settings.store;
    let store: Arc<dyn ObligationStore> = match config.kind {
        StoreKind::Postgres => {
            let pool = DbPool::connect(&config.database)
                .await
                .context("Failed to open obligation database")?;
            Arc::new(PostgresStore::new(pool))
        }
        StoreKind::File => {
            let path = config.path.clone().context("store.path is required for file")?;
            Arc::new(
                FileStore::open(&path)
                    .await
                    .with_context(|| format!("Failed to open state file {}", path.display()))?,
            )
        }
        StoreKind::Memory => {
            warn!("Memory store selected: handled obligations are forgotten on restart");
            Arc::new(MemoryStore::new())
        }
    };

    info!(kind = ?config.kind, "Obligation store initialized");
    Ok(store)
}

/// Initialize the run lease
///
/// # Errors
/// Returns error if Redis is configured but unreachable
#[tracing::instrument(skip(settings))]
pub async fn init_lock(settings: &Settings) -> Result<Arc<dyn RunLock>> {
    let lock: Arc<dyn RunLock> = match settings.lock.kind {
        LockKind::Local => Arc::new(LocalRunLock::new()),
        LockKind::Redis => {
            let url = settings
                .lock
                .redis_url
                .as_deref()
                .context("lock.redis_url is required for redis")?;
            let pool = RedisPool::new(url)
                .await
                .context("Failed to initialize Redis pool")?;
            pool.health_check()
                .await
                .context("Redis health check failed")?;
            Arc::new(RedisRunLock::new(pool))
        }
    };

    info!(kind = ?settings.lock.kind, "Run lock initialized");
    Ok(lock)
}

/// Build a coordinator with every component taken from settings
///
/// # Errors
/// Returns error if any component fails to initialize
pub async fn build_coordinator(
    settings: &Settings,
    store: Arc<dyn ObligationStore>,
    shutdown: watch::Receiver<bool>,
) -> Result<RunCoordinator> {
    let source = init_source(settings)?;
    let notifier = init_notifier(settings)?;
    let lock = init_lock(settings).await?;

    let coordinator = RunCoordinator::new(
        source,
        RuleEvaluator::new(&settings.rules),
        store,
        notifier,
        lock,
        CircuitBreaker::from_config("notifier", &settings.notifier.circuit_breaker),
        RetryPolicy::from_config(&settings.retry),
        RunOptions::from_settings(settings),
    )
    .with_shutdown(shutdown);

    Ok(coordinator)
}
