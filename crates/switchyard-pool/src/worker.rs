//! Worker lifecycle state and the seams between the pool and a worker process.

use async_trait::async_trait;
use serde::Serialize;
use switchyard_core::Result;
use tokio::sync::mpsc;

use crate::profile::CapabilityProfile;

/// Lifecycle of a pooled worker.
///
/// ```text
/// spawned → idle ⇄ busy
///   │        ├──→ evicted
///   └────────┴──→ dead      (busy → dead too)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Process starting; slot reserved.
    Spawned,
    /// Alive, waiting for work.
    Idle,
    /// Executing exactly one unit.
    Busy,
    /// Removed by the pool (idle timeout or capacity pressure).
    Evicted,
    /// Process exited.
    Dead,
}

impl WorkerState {
    /// Whether `self → next` is a legal transition. Busy workers are never evicted.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Spawned, Idle)
                | (Spawned, Busy)
                | (Spawned, Dead)
                | (Idle, Busy)
                | (Idle, Evicted)
                | (Idle, Dead)
                | (Busy, Idle)
                | (Busy, Dead)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Evicted | WorkerState::Dead)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Spawned => write!(f, "spawned"),
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Busy => write!(f, "busy"),
            WorkerState::Evicted => write!(f, "evicted"),
            WorkerState::Dead => write!(f, "dead"),
        }
    }
}

/// Streamed output while a worker executes a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Delta(String),
}

/// A running worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;

    /// Run one prompt to completion, forwarding streamed events if a sink is given.
    async fn prompt(
        &mut self,
        text: &str,
        events: Option<mpsc::UnboundedSender<WorkerEvent>>,
    ) -> Result<String>;

    /// Stop the process and reap it.
    async fn stop(&mut self);
}

/// Starts worker processes for the pool.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, worker_id: &str, profile: &CapabilityProfile) -> Result<Box<dyn WorkerProcess>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_never_evicted() {
        assert!(!WorkerState::Busy.can_transition_to(WorkerState::Evicted));
        assert!(WorkerState::Idle.can_transition_to(WorkerState::Evicted));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for next in [
            WorkerState::Spawned,
            WorkerState::Idle,
            WorkerState::Busy,
            WorkerState::Evicted,
            WorkerState::Dead,
        ] {
            assert!(!WorkerState::Dead.can_transition_to(next));
            assert!(!WorkerState::Evicted.can_transition_to(next));
        }
        assert!(WorkerState::Dead.is_terminal());
    }
}
