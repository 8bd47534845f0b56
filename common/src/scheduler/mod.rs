// Scheduler module: single-worker polling loop

pub mod engine;

pub use engine::{SchedulerConfig, WorkerScheduler};
