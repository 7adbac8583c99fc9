// Configuration management with layered configuration (.env, file, env)

use crate::models::{default_tz, deserialize_tz, serialize_tz, Schedule};
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable the Telegram token falls back to
pub const TOKEN_ENV_VAR: &str = "TAX_BOT_TOKEN";
/// Environment variable the Postgres URL falls back to
pub const DATABASE_URL_ENV_VAR: &str = "DATABASE_URL";

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub source: SourceConfig,
    pub rules: RulesConfig,
    pub notifier: NotifierConfig,
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub retry: RetryConfig,
    pub trigger: TriggerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Http,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Name used in logs and as the run lease resource
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// How long past `due_at` an obligation keeps its kind before it is `overdue`
    pub grace_period_hours: i64,
    /// How long before `due_at` an obligation becomes actionable
    pub lead_time_days: i64,
    /// Timezone plain due dates are interpreted in
    #[serde(
        default = "default_tz",
        serialize_with = "serialize_tz",
        deserialize_with = "deserialize_tz"
    )]
    pub timezone: Tz,
    #[serde(default)]
    pub default_currency: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    Log,
    Telegram,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    pub timeout_seconds: u64,
    /// Upper bound on concurrently dispatched actions within a run
    pub concurrency: usize,
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub kind: StoreKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Local,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub kind: LockKind,
    #[serde(default)]
    pub redis_url: Option<String>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub schedule: Schedule,
    /// Fire one run immediately when the daemon starts
    #[serde(default)]
    pub run_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
    /// Number of runs `stats` reads back
    pub stats_window: usize,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        load_env_file()?;

        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        let mut settings: Settings = config.try_deserialize()?;
        settings.apply_env_fallbacks(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Fill secrets left empty by the config layers from their well-known
    /// environment variables.
    pub fn apply_env_fallbacks<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.notifier.telegram.bot_token.is_empty() {
            if let Some(token) = lookup(TOKEN_ENV_VAR).filter(|t| !t.is_empty()) {
                self.notifier.telegram.bot_token = token;
            }
        }
        if self.store.database.url.is_empty() {
            if let Some(url) = lookup(DATABASE_URL_ENV_VAR).filter(|u| !u.is_empty()) {
                self.store.database.url = url;
            }
        }
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.source.name.trim().is_empty() {
            return Err("Source name cannot be empty".to_string());
        }
        match self.source.kind {
            SourceKind::Http if self.source.url.as_deref().map_or(true, str::is_empty) => {
                return Err("Source URL is required when source kind is 'http'".to_string());
            }
            SourceKind::File if self.source.path.is_none() => {
                return Err("Source path is required when source kind is 'file'".to_string());
            }
            _ => {}
        }
        if self.source.timeout_seconds == 0 {
            return Err("Source timeout_seconds must be greater than 0".to_string());
        }

        if self.rules.grace_period_hours < 0 {
            return Err("Rules grace_period_hours cannot be negative".to_string());
        }
        if self.rules.lead_time_days < 0 {
            return Err("Rules lead_time_days cannot be negative".to_string());
        }

        if self.notifier.timeout_seconds == 0 {
            return Err("Notifier timeout_seconds must be greater than 0".to_string());
        }
        if self.notifier.concurrency == 0 {
            return Err("Notifier concurrency must be greater than 0".to_string());
        }
        if self.notifier.circuit_breaker.failure_threshold == 0 {
            return Err("Circuit breaker failure_threshold must be greater than 0".to_string());
        }
        match self.notifier.kind {
            NotifierKind::Telegram => {
                if self.notifier.telegram.bot_token.is_empty() {
                    return Err(format!(
                        "Telegram bot token is required (notifier.telegram.bot_token or {})",
                        TOKEN_ENV_VAR
                    ));
                }
                if self.notifier.telegram.chat_id.is_empty() {
                    return Err("Telegram chat_id cannot be empty".to_string());
                }
            }
            NotifierKind::Webhook if self.notifier.webhook.url.is_empty() => {
                return Err("Webhook URL cannot be empty".to_string());
            }
            _ => {}
        }

        match self.store.kind {
            StoreKind::Postgres => {
                if self.store.database.url.is_empty() {
                    return Err(format!(
                        "Database URL is required (store.database.url or {})",
                        DATABASE_URL_ENV_VAR
                    ));
                }
                if self.store.database.max_connections == 0 {
                    return Err("Database max_connections must be greater than 0".to_string());
                }
            }
            StoreKind::File if self.store.path.is_none() => {
                return Err("Store path is required when store kind is 'file'".to_string());
            }
            _ => {}
        }

        if self.lock.kind == LockKind::Redis
            && self.lock.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return Err("Redis URL is required when lock kind is 'redis'".to_string());
        }
        if self.lock.ttl_seconds == 0 {
            return Err("Lock ttl_seconds must be greater than 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("Retry max_attempts must be greater than 0".to_string());
        }
        if self.retry.base_delay_seconds > self.retry.max_delay_seconds {
            return Err("Retry base_delay_seconds cannot exceed max_delay_seconds".to_string());
        }

        crate::schedule::validate(&self.trigger.schedule).map_err(|e| e.to_string())?;

        Ok(())
    }
}

/// Load `.env` from the working directory if present. A missing file is fine;
/// a malformed one is a configuration error.
fn load_env_file() -> Result<(), ConfigError> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(dotenvy::Error::Io(_)) => Ok(()),
        Err(e) => Err(ConfigError::Message(format!("Invalid .env file: {}", e))),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                kind: SourceKind::File,
                name: "obligations".to_string(),
                url: None,
                path: Some(PathBuf::from("data/obligations.json")),
                bearer_token: None,
                timeout_seconds: 30,
            },
            rules: RulesConfig {
                grace_period_hours: 24,
                lead_time_days: 7,
                timezone: chrono_tz::UTC,
                default_currency: None,
            },
            notifier: NotifierConfig {
                kind: NotifierKind::Log,
                timeout_seconds: 10,
                concurrency: 4,
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 5,
                    timeout_seconds: 60,
                },
                telegram: TelegramConfig {
                    api_base: default_telegram_api(),
                    ..Default::default()
                },
                webhook: WebhookConfig::default(),
            },
            store: StoreConfig {
                kind: StoreKind::File,
                path: Some(PathBuf::from("data/state.json")),
                database: DatabaseConfig {
                    url: String::new(),
                    max_connections: 5,
                    min_connections: 1,
                    connect_timeout_seconds: 30,
                },
            },
            lock: LockConfig {
                kind: LockKind::Local,
                redis_url: None,
                ttl_seconds: 900,
            },
            retry: RetryConfig {
                max_attempts: 5,
                base_delay_seconds: 60,
                max_delay_seconds: 6 * 3600,
            },
            trigger: TriggerConfig {
                schedule: Schedule::Interval {
                    interval_seconds: 3600,
                },
                run_on_startup: true,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
                tracing_endpoint: None,
                stats_window: 50,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_requires_token_for_telegram() {
        let mut settings = Settings::default();
        settings.notifier.kind = NotifierKind::Telegram;
        settings.notifier.telegram.chat_id = "42".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.contains(TOKEN_ENV_VAR));
    }

    #[test]
    fn test_validation_catches_http_source_without_url() {
        let mut settings = Settings::default();
        settings.source.kind = SourceKind::Http;
        settings.source.url = None;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_max_attempts() {
        let mut settings = Settings::default();
        settings.retry.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_cron() {
        let mut settings = Settings::default();
        settings.trigger.schedule = Schedule::Cron {
            expression: "not a cron".to_string(),
            timezone: chrono_tz::UTC,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_redis_lock_without_url() {
        let mut settings = Settings::default();
        settings.lock.kind = LockKind::Redis;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_env_fallbacks_fill_empty_secrets_only() {
        let env: HashMap<&str, &str> = [
            (TOKEN_ENV_VAR, "123:abc"),
            (DATABASE_URL_ENV_VAR, "postgresql://localhost/taxbot"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let mut settings = Settings::default();
        settings.apply_env_fallbacks(lookup);
        assert_eq!(settings.notifier.telegram.bot_token, "123:abc");
        assert_eq!(settings.store.database.url, "postgresql://localhost/taxbot");

        let mut settings = Settings::default();
        settings.notifier.telegram.bot_token = "from-file".to_string();
        settings.apply_env_fallbacks(lookup);
        assert_eq!(settings.notifier.telegram.bot_token, "from-file");
    }

    #[test]
    fn test_load_from_directory_with_default_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
[source]
kind = "file"
name = "feed"
path = "feed.json"
timeout_seconds = 5

[rules]
grace_period_hours = 12
lead_time_days = 3
timezone = "Europe/Budapest"
default_currency = "HUF"

[notifier]
kind = "log"
timeout_seconds = 5
concurrency = 2

[notifier.circuit_breaker]
failure_threshold = 3
timeout_seconds = 30

[store]
kind = "memory"

[store.database]
max_connections = 5
min_connections = 1
connect_timeout_seconds = 10

[lock]
kind = "local"
ttl_seconds = 60

[retry]
max_attempts = 3
base_delay_seconds = 10
max_delay_seconds = 600

[trigger]
run_on_startup = false

[trigger.schedule]
mode = "daily"
time = "08:00"
timezone = "Europe/Budapest"

[observability]
log_level = "debug"
stats_window = 20
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.source.name, "feed");
        assert_eq!(settings.rules.timezone, chrono_tz::Europe::Budapest);
        assert_eq!(settings.store.kind, StoreKind::Memory);
        assert_eq!(
            settings.trigger.schedule,
            Schedule::Daily {
                time: "08:00".to_string(),
                timezone: chrono_tz::Europe::Budapest,
            }
        );
        assert!(settings.validate().is_ok());
    }
}
