//! Units of work: what the dispatch queue holds and workers execute.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::completion::Responder;
use crate::types::MessageSource;

/// Callback a channel adapter supplies to show a typing indicator.
pub type TypingHook = Arc<dyn Fn() + Send + Sync>;

/// Where a cron job's turn runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Dedicated `cron:{id}` session.
    #[default]
    Isolated,
    /// The target agent's main session.
    Main,
}

/// What happens to a cron run's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    /// Summarised back to the agent's main conversation.
    #[default]
    Announce,
    /// Sent as-is to the configured destination.
    Direct,
    /// Recorded in run history only.
    Silent,
}

/// Origin of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkKind {
    Chat,
    Webhook,
    Cron {
        job_id: String,
        mode: JobMode,
        delivery: DeliveryPolicy,
    },
}

impl WorkKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkKind::Chat => "chat",
            WorkKind::Webhook => "webhook",
            WorkKind::Cron { .. } => "cron",
        }
    }
}

/// What the worker is asked to do.
#[derive(Debug, Clone)]
pub struct WorkPayload {
    pub text: String,
    /// Agent whose capability profile the worker runs with.
    pub agent_id: String,
    pub kind: WorkKind,
    pub source: Option<MessageSource>,
}

/// One schedulable payload with its priority, TTL, and completion handle.
pub struct UnitOfWork {
    pub id: String,
    pub payload: WorkPayload,
    /// Lower runs first.
    pub priority: i32,
    pub enqueued_at: Instant,
    /// `None` = never expires.
    pub ttl: Option<Duration>,
    pub source_label: String,
    pub responder: Responder,
    pub typing: Option<TypingHook>,
}

impl UnitOfWork {
    pub fn new(payload: WorkPayload, priority: i32, source_label: impl Into<String>, responder: Responder) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            priority,
            enqueued_at: Instant::now(),
            ttl: None,
            source_label: source_label.into(),
            responder,
            typing: None,
        }
    }

    /// Set a TTL; zero means no expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    pub fn with_typing(mut self, typing: TypingHook) -> Self {
        self.typing = Some(typing);
        self
    }

    /// Time left before the unit expires. `None` if it never does.
    pub fn remaining_ttl(&self, now: Instant) -> Option<Duration> {
        self.ttl
            .map(|ttl| ttl.saturating_sub(now.saturating_duration_since(self.enqueued_at)))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.enqueued_at) >= ttl)
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("kind", &self.payload.kind)
            .field("priority", &self.priority)
            .field("ttl", &self.ttl)
            .field("source_label", &self.source_label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completion;

    fn payload() -> WorkPayload {
        WorkPayload {
            text: "hi".into(),
            agent_id: "main".into(),
            kind: WorkKind::Chat,
            source: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let (responder, _completion) = completion();
        let unit = UnitOfWork::new(payload(), 1, "test", responder).with_ttl(Duration::from_secs(2));
        assert!(!unit.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(unit.remaining_ttl(Instant::now()), Some(Duration::from_millis(1_500)));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(unit.is_expired(Instant::now()));
        assert_eq!(unit.remaining_ttl(Instant::now()), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let (responder, _completion) = completion();
        let unit = UnitOfWork::new(payload(), 1, "test", responder).with_ttl(Duration::ZERO);
        assert!(unit.ttl.is_none());
        assert!(!unit.is_expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn test_policy_serde() {
        assert_eq!(serde_json::to_string(&DeliveryPolicy::Silent).unwrap(), "\"silent\"");
        let mode: JobMode = serde_json::from_str("\"main\"").unwrap();
        assert_eq!(mode, JobMode::Main);
    }
}
