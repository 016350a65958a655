//! Dispatcher: the one entry point that turns an event into queued work.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use switchyard_core::config::{QueueConfig, RoutingConfig};
use switchyard_core::routing::{default_agent, webhook_session_key};
use switchyard_core::{
    ChatType, MessageSource, Responder, SessionKey, SwitchyardConfig, TypingHook, UnitOfWork, WorkKind,
    WorkPayload, resolve,
};
use switchyard_scheduler::{CronDispatcher, DispatchQueue};

/// A message from a channel adapter.
pub struct InboundMessage {
    pub source: MessageSource,
    pub text: String,
    /// Must be resolved exactly once, with an error reply on failure.
    pub responder: Responder,
    pub typing: Option<TypingHook>,
}

/// Where an accepted unit went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatched {
    pub session_key: SessionKey,
    pub agent_id: String,
    pub priority: i32,
}

/// The session queue turned the unit away.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Too many messages queued. Please wait.")]
pub struct Backpressure {
    pub session_key: SessionKey,
}

pub struct Dispatcher {
    routing: RoutingConfig,
    queue_config: QueueConfig,
    queue: DispatchQueue,
}

impl Dispatcher {
    pub fn new(config: &SwitchyardConfig, queue: DispatchQueue) -> Self {
        Self {
            routing: config.routing.clone(),
            queue_config: config.queue.clone(),
            queue,
        }
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Route a channel message and enqueue it on its session.
    pub async fn dispatch(&self, msg: InboundMessage) -> Result<Dispatched, Backpressure> {
        let route = resolve(&msg.source, &msg.text, &self.routing);
        let priority = self.priority_for(&msg.source);
        let payload = WorkPayload {
            text: route.stripped_text,
            agent_id: route.target_agent_id.clone(),
            kind: WorkKind::Chat,
            source: Some(msg.source.clone()),
        };
        let mut unit = UnitOfWork::new(payload, priority, msg.source.label(), msg.responder);
        if let Some(typing) = msg.typing {
            unit = unit.with_typing(typing);
        }
        self.admit(route.session_key, route.target_agent_id, unit).await
    }

    /// Enqueue a webhook wake on a fresh single-use session.
    ///
    /// `agent_id` must already be known to be configured; `None` targets the default agent.
    pub async fn dispatch_webhook(
        &self,
        text: String,
        agent_id: Option<String>,
        responder: Responder,
    ) -> Result<Dispatched, Backpressure> {
        let agent_id = agent_id.unwrap_or_else(|| default_agent(&self.routing));
        let priority = self.queue_config.priority.webhook;
        let payload = WorkPayload {
            text,
            agent_id: agent_id.clone(),
            kind: WorkKind::Webhook,
            source: None,
        };
        let unit = UnitOfWork::new(payload, priority, "webhook", responder);
        self.admit(webhook_session_key(), agent_id, unit).await
    }

    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.routing.agent(agent_id).is_some()
    }

    /// Lower runs first. Allowlisted senders get a bonus.
    fn priority_for(&self, source: &MessageSource) -> i32 {
        let weights = &self.queue_config.priority;
        let base = match source.chat_type {
            ChatType::Direct => weights.dm,
            ChatType::Group | ChatType::Channel => weights.group,
        };
        if self.routing.is_allowlisted(&source.sender_id) {
            base - weights.allowlist_bonus
        } else {
            base
        }
    }

    async fn admit(
        &self,
        session_key: SessionKey,
        agent_id: String,
        unit: UnitOfWork,
    ) -> Result<Dispatched, Backpressure> {
        let unit = unit.with_ttl(Duration::from_millis(self.queue_config.default_ttl_ms));
        let dispatched = Dispatched {
            session_key: session_key.clone(),
            agent_id,
            priority: unit.priority,
        };
        if self.queue.enqueue(session_key.clone(), unit).await {
            Ok(dispatched)
        } else {
            Err(Backpressure { session_key })
        }
    }
}

#[async_trait]
impl CronDispatcher for Dispatcher {
    async fn submit(&self, session_key: SessionKey, unit: UnitOfWork) -> bool {
        let unit = unit.with_ttl(Duration::from_millis(self.queue_config.default_ttl_ms));
        self.queue.enqueue(session_key, unit).await
    }
}
