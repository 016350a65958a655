//! Runs promoted units on pooled workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::config::{AgentConfig, PoolConfig, RoutingConfig};
use switchyard_core::{Reply, SessionKey, SwitchyardConfig, UnitOfWork};
use switchyard_pool::{CapabilityProfile, WorkerEvent, WorkerPool};
use switchyard_scheduler::{Execution, UnitExecutor};
use tokio::sync::mpsc;

/// [`UnitExecutor`] backed by the worker pool.
pub struct PoolExecutor {
    pool: Arc<WorkerPool>,
    routing: RoutingConfig,
    pool_config: PoolConfig,
}

impl PoolExecutor {
    pub fn new(pool: Arc<WorkerPool>, config: &SwitchyardConfig) -> Self {
        Self {
            pool,
            routing: config.routing.clone(),
            pool_config: config.pool.clone(),
        }
    }

    fn profile_for(&self, agent_id: &str) -> CapabilityProfile {
        match self.routing.agent(agent_id) {
            Some(agent) => CapabilityProfile::for_agent(agent, &self.pool_config),
            None => CapabilityProfile::for_agent(&AgentConfig::named(agent_id), &self.pool_config),
        }
    }
}

#[async_trait]
impl UnitExecutor for PoolExecutor {
    async fn execute(&self, session_key: &SessionKey, unit: UnitOfWork) -> Execution {
        let profile = self.profile_for(&unit.payload.agent_id);
        // A full pool parks the unit until a worker frees up or its TTL runs out.
        let wait = unit
            .remaining_ttl(tokio::time::Instant::now())
            .unwrap_or(Duration::from_millis(self.pool_config.acquire_wait_ms));
        let acquired = self
            .pool
            .acquire_or_wait(session_key, &profile, unit.priority, wait)
            .await;
        let mut lease = match acquired {
            Ok(lease) => lease,
            Err(e) if e.is_retryable() => return Execution::Retry(unit, e.to_string()),
            Err(e) => {
                tracing::warn!("⚠️ {} cannot run on {session_key}: {e}", unit.id);
                unit.responder.respond(Reply::error(e.to_string()));
                return Execution::Done;
            }
        };

        // Streamed deltas keep the typing indicator alive.
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let typing = unit.typing.clone();
        if let Some(typing) = &typing {
            typing();
        }
        let relay = tokio::spawn(async move {
            let mut deltas = 0usize;
            while let Some(WorkerEvent::Delta(_)) = events_rx.recv().await {
                deltas += 1;
                if let Some(typing) = &typing {
                    typing();
                }
            }
            deltas
        });

        tracing::debug!(
            "▶️ {} on {} (worker {}, {})",
            unit.id,
            session_key,
            lease.worker_id(),
            unit.payload.kind.label()
        );
        let result = lease.prompt(&unit.payload.text, Some(events_tx)).await;
        self.pool.release(lease).await;
        let deltas = relay.await.unwrap_or(0);

        let reply = match result {
            Ok(text) => {
                tracing::info!(
                    "✅ {} done on {session_key} ({} chars, {deltas} deltas)",
                    unit.id,
                    text.len()
                );
                Reply::Text(text)
            }
            Err(e) => {
                tracing::warn!("❌ {} failed on {session_key}: {e}", unit.id);
                Reply::error(e.to_string())
            }
        };
        if !unit.responder.respond(reply) {
            tracing::debug!("📭 Reply for {} dropped, caller is gone", unit.id);
        }
        Execution::Done
    }
}
