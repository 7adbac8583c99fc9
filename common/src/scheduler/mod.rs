// Scheduler module: drives the run coordinator from the trigger schedule

pub mod engine;

pub use engine::{SchedulerConfig, SchedulerEngine};
