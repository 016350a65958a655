//! # Switchyard Pool
//!
//! Owns the long-lived agent worker processes. Each worker is bound to at
//! most one session key; the binding survives between turns so the next
//! message on a conversation lands in the same process and context.
//!
//! ## Architecture
//! ```text
//! WorkerPool
//!   ├── acquire(key, profile) → WorkerLease   (reuse bound → adopt unbound → evict LRU idle → spawn)
//!   ├── release(lease)                        (busy → idle, binding kept)
//!   ├── maintenance()                         (reap dead, evict idle past timeout, top up to min)
//!   └── Launcher ── ProcessLauncher ── StdioWorker (JSON lines over stdin/stdout)
//! ```

pub mod error;
pub mod pool;
pub mod process;
pub mod profile;
pub mod worker;

pub use error::PoolError;
pub use pool::{PoolStats, WorkerInfo, WorkerLease, WorkerPool, spawn_maintenance};
pub use process::{ProcessLauncher, StdioWorker};
pub use profile::CapabilityProfile;
pub use worker::{Launcher, WorkerEvent, WorkerProcess, WorkerState};
