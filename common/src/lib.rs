// Common library for the tax bot: pipeline components shared by the binary
// and the integration tests

pub mod bootstrap;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod errors;
pub mod escalation;
pub mod evaluator;
pub mod fingerprint;
pub mod lock;
pub mod models;
pub mod notifier;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod source;
pub mod stats;
pub mod store;
pub mod telemetry;
