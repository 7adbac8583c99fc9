// Error handling framework
// One enum per concern; per-obligation errors never abort a run, run-level ones do.

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid time of day '{0}', expected HH:MM")]
    InvalidTimeOfDay(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No next execution time available for {schedule_type} schedule")]
    NoNextExecution { schedule_type: String },
}

/// Fetch-level errors. Every variant means "could not check", never "nothing due".
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source '{source_name}' unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("Source fetch timed out after {0} seconds")]
    Timeout(u64),

    #[error("Source payload could not be normalized: {0}")]
    InvalidPayload(String),
}

/// A single candidate failed normalization; the candidate is skipped, others proceed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unknown obligation kind: {0}")]
    UnknownKind(String),

    #[error("Invalid date for {field}: '{value}'")]
    InvalidDate { field: String, value: String },

    #[error("Invalid decimal for {field}: '{value}'")]
    InvalidAmount { field: String, value: String },

    #[error("Negative amount for {field}: {value}")]
    NegativeAmount { field: String, value: String },

    #[error("Amount {value} exceeds the largest storable amount {limit}")]
    AmountOutOfRange { value: String, limit: String },
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Dedup/state store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to commit action record for {fingerprint}: {reason}")]
    CommitFailed { fingerprint: String, reason: String },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Refusing to overwrite successful action record for {0}")]
    SuccessIsImmutable(String),
}

/// Run lease errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Run lease already held for resource: {0}")]
    AlreadyHeld(String),

    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Lease no longer owned: {0}")]
    NotOwned(String),
}

/// Notifier construction errors. Delivery failures are reported as outcomes, not errors.
#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("Invalid notifier configuration: {0}")]
    Configuration(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => DatabaseError::QueryFailed(db_err.message().to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseError::ConnectionFailed(err.to_string())
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::DatabaseError(err.to_string()),
        }
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::ConnectionFailed(msg) | DatabaseError::HealthCheckFailed(msg) => {
                StoreError::Unavailable(msg)
            }
            other => StoreError::DatabaseError(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationFailed(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::FileSystemError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidJson(err.to_string())
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::RedisError(err.to_string())
    }
}

impl From<reqwest::Error> for NotifierError {
    fn from(err: reqwest::Error) -> Self {
        NotifierError::HttpClient(err.to_string())
    }
}

impl StoreError {
    /// Whether the whole store is gone, as opposed to a single failed write
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::FileSystemError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_source_timeout_display() {
        let err = SourceError::Timeout(30);
        assert!(err.to_string().contains("30 seconds"));
    }

    #[test]
    fn test_store_error_unavailable_classification() {
        assert!(StoreError::Unavailable("down".to_string()).is_unavailable());
        assert!(!StoreError::CommitFailed {
            fingerprint: "abc".to_string(),
            reason: "constraint".to_string(),
        }
        .is_unavailable());
    }

    #[test]
    fn test_database_connection_error_maps_to_unavailable() {
        let err: StoreError = DatabaseError::ConnectionFailed("refused".to_string()).into();
        assert!(err.is_unavailable());
    }
}
