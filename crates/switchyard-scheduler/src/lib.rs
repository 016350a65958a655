//! # Switchyard Scheduler
//!
//! The per-session dispatch queue and the cron scheduling engine.
//!
//! ## Architecture
//! ```text
//! DispatchQueue
//!   ├── per-session pending list, ordered (priority ↑, enqueued_at ↑)
//!   ├── at most one active unit per session → UnitExecutor
//!   └── TTL expiry before promotion, bounded retry on retryable failures
//!
//! CronEngine (tokio interval)
//!   ├── CronJob: cron "0 8 * * *" | every "30m" | at "2026-11-01T09:00:00Z"
//!   ├── fire → pending RunRecord → UnitOfWork → CronDispatcher
//!   ├── completion (or timeout) → terminal RunRecord
//!   └── at / deleteAfterRun → remove, otherwise reschedule
//! ```

pub mod cron;
pub mod engine;
pub mod error;
pub mod job;
pub mod persistence;
pub mod queue;
pub mod store;

pub use engine::{CronDispatcher, CronEngine, EngineSettings, EngineStatus, JobView, spawn_scheduler};
pub use error::EngineError;
pub use job::{CronJob, JobPatch, JobSpec, LastRun, RunRecord, RunStatus, Schedule, ScheduleKind};
pub use persistence::RunHistory;
pub use queue::{DispatchQueue, Execution, QueueStats, SessionQueueStats, UnitExecutor};
pub use store::JobStore;
