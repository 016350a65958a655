//! Dispatch queue: per-session priority queues with one active unit per session.
//!
//! Each session drains independently: when a session has no active unit, its
//! head is handed to the [`UnitExecutor`] on a fresh task. When that unit
//! finishes, the next head for the same session is promoted. Different
//! sessions run concurrently, bounded only by what the executor allows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use switchyard_core::config::QueueConfig;
use switchyard_core::{Reply, SessionKey, UnitOfWork};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Result of handing a unit to the executor.
pub enum Execution {
    /// The unit ran and its responder has been resolved.
    Done,
    /// Transient failure (e.g. no worker available); the unit comes back for another try.
    Retry(UnitOfWork, String),
}

/// Runs a promoted unit to completion.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(&self, session_key: &SessionKey, unit: UnitOfWork) -> Execution;
}

struct Queued {
    seq: u64,
    unit: UnitOfWork,
}

impl Queued {
    fn order(&self) -> (i32, Instant, u64) {
        (self.unit.priority, self.unit.enqueued_at, self.seq)
    }
}

#[derive(Default)]
struct SessionQueue {
    pending: Vec<Queued>,
    active: bool,
    processed: u64,
}

#[derive(Default)]
struct QueueState {
    sessions: HashMap<SessionKey, SessionQueue>,
    total_pending: usize,
    next_seq: u64,
    rejected: u64,
    expired: u64,
}

struct Inner {
    config: QueueConfig,
    executor: Arc<dyn UnitExecutor>,
    state: Mutex<QueueState>,
}

/// Per-session ordered dispatch queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<Inner>,
}

impl DispatchQueue {
    pub fn new(config: QueueConfig, executor: Arc<dyn UnitExecutor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Admit a unit. `false` when the session (or the whole queue) is full.
    pub async fn enqueue(&self, session_key: SessionKey, unit: UnitOfWork) -> bool {
        let mut state = self.inner.state.lock().await;

        let session_len = state
            .sessions
            .get(&session_key)
            .map(|q| q.pending.len())
            .unwrap_or(0);
        if session_len >= self.inner.config.max_per_session {
            state.rejected += 1;
            tracing::warn!(
                "🚫 Queue full for {} ({} pending), rejecting {}",
                session_key,
                session_len,
                unit.source_label
            );
            return false;
        }
        if state.total_pending >= self.inner.config.global_max_pending {
            state.rejected += 1;
            tracing::warn!(
                "🚫 Global queue limit reached ({}), rejecting {}",
                state.total_pending,
                unit.source_label
            );
            return false;
        }

        state.next_seq += 1;
        let entry = Queued {
            seq: state.next_seq,
            unit,
        };
        tracing::debug!(
            "📥 Enqueue {} on {} (priority {}, {})",
            entry.unit.id,
            session_key,
            entry.unit.priority,
            entry.unit.source_label
        );

        let queue = state.sessions.entry(session_key.clone()).or_default();
        let pos = queue.pending.partition_point(|q| q.order() <= entry.order());
        queue.pending.insert(pos, entry);
        state.total_pending += 1;

        self.inner.promote(&mut state, &session_key);
        true
    }

    /// Drop idle sessions with nothing queued. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, q| q.active || !q.pending.is_empty());
        before - state.sessions.len()
    }

    pub async fn pending_for(&self, session_key: &SessionKey) -> usize {
        let state = self.inner.state.lock().await;
        state.sessions.get(session_key).map(|q| q.pending.len()).unwrap_or(0)
    }

    pub async fn is_active(&self, session_key: &SessionKey) -> bool {
        let state = self.inner.state.lock().await;
        state.sessions.get(session_key).is_some_and(|q| q.active)
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let mut details: Vec<SessionQueueStats> = state
            .sessions
            .iter()
            .map(|(key, q)| SessionQueueStats {
                session_key: key.clone(),
                pending: q.pending.len(),
                active: q.active,
                processed: q.processed,
            })
            .collect();
        details.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        QueueStats {
            sessions: state.sessions.len(),
            total_pending: state.total_pending,
            active_sessions: details.iter().filter(|d| d.active).count(),
            rejected: state.rejected,
            expired: state.expired,
            details,
        }
    }
}

impl Inner {
    /// Start the session's head unit if the session is idle. Expired units are dropped first.
    fn promote(self: &Arc<Self>, state: &mut QueueState, session_key: &SessionKey) {
        let Some(queue) = state.sessions.get_mut(session_key) else {
            return;
        };
        if queue.active {
            return;
        }

        let now = Instant::now();
        let before = queue.pending.len();
        queue.pending.retain(|q| {
            let expired = q.unit.is_expired(now);
            if expired {
                tracing::debug!("⌛ Dropping expired {} on {}", q.unit.id, session_key);
            }
            !expired
        });
        let expired = before - queue.pending.len();

        let next = if queue.pending.is_empty() {
            None
        } else {
            queue.active = true;
            Some(queue.pending.remove(0).unit)
        };

        state.expired += expired as u64;
        state.total_pending -= expired + usize::from(next.is_some());

        if let Some(unit) = next {
            let inner = Arc::clone(self);
            let key = session_key.clone();
            tokio::spawn(async move { inner.run(key, unit).await });
        }
    }

    async fn run(self: Arc<Self>, session_key: SessionKey, unit: UnitOfWork) {
        let this = Arc::clone(&self);
        let key = session_key.clone();
        // Inner task so a panicking executor still frees the session.
        let handle = tokio::spawn(async move { this.execute_with_retry(&key, unit).await });
        if let Err(e) = handle.await {
            tracing::error!("❌ Unit on {} aborted: {e}", session_key);
        }

        let mut state = self.state.lock().await;
        if let Some(queue) = state.sessions.get_mut(&session_key) {
            queue.active = false;
            queue.processed += 1;
        }
        self.promote(&mut state, &session_key);
    }

    async fn execute_with_retry(&self, session_key: &SessionKey, mut unit: UnitOfWork) {
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut attempt = 0u32;
        loop {
            match self.executor.execute(session_key, unit).await {
                Execution::Done => return,
                Execution::Retry(returned, reason) => {
                    attempt += 1;
                    if attempt > self.config.acquire_retries {
                        tracing::warn!(
                            "⚠️ Giving up on {} for {} after {} attempts: {reason}",
                            returned.id,
                            session_key,
                            attempt
                        );
                        returned
                            .responder
                            .respond(Reply::error(format!("No worker available: {reason}")));
                        return;
                    }
                    tracing::info!(
                        "🔁 Retrying {} for {} in {}ms ({reason})",
                        returned.id,
                        session_key,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    unit = returned;
                }
            }
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub sessions: usize,
    pub total_pending: usize,
    pub active_sessions: usize,
    /// Units turned away by capacity limits.
    pub rejected: u64,
    /// Units dropped because their TTL ran out before they started.
    pub expired: u64,
    pub details: Vec<SessionQueueStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionQueueStats {
    pub session_key: SessionKey,
    pub pending: usize,
    pub active: bool,
    pub processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use switchyard_core::{Completion, WorkKind, WorkPayload, completion};

    /// Records execution order and the peak number of concurrent units per session.
    #[derive(Default)]
    struct Recorder {
        delay_ms: u64,
        log: std::sync::Mutex<Vec<String>>,
        in_flight: std::sync::Mutex<HashMap<SessionKey, usize>>,
        peak_per_session: AtomicUsize,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl UnitExecutor for Recorder {
        async fn execute(&self, session_key: &SessionKey, unit: UnitOfWork) -> Execution {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Execution::Retry(unit, "pool at capacity".into());
            }

            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let n = in_flight.entry(session_key.clone()).or_default();
                *n += 1;
                self.peak_per_session.fetch_max(*n, Ordering::SeqCst);
            }
            self.log.lock().unwrap().push(unit.payload.text.clone());
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            *self.in_flight.lock().unwrap().get_mut(session_key).unwrap() -= 1;

            unit.responder.respond(Reply::Text(unit.payload.text.clone()));
            Execution::Done
        }
    }

    fn config(max_per_session: usize) -> QueueConfig {
        QueueConfig {
            max_per_session,
            global_max_pending: 100,
            retry_backoff_ms: 5,
            ..Default::default()
        }
    }

    fn unit(text: &str, priority: i32) -> (UnitOfWork, Completion) {
        let (responder, completion) = completion();
        let payload = WorkPayload {
            text: text.into(),
            agent_id: "main".into(),
            kind: WorkKind::Chat,
            source: None,
        };
        (UnitOfWork::new(payload, priority, "test", responder), completion)
    }

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s)
    }

    #[tokio::test]
    async fn test_priority_then_fifo_within_session() {
        let exec = Arc::new(Recorder {
            delay_ms: 20,
            ..Default::default()
        });
        let queue = DispatchQueue::new(config(10), exec.clone());

        let (first, _c0) = unit("first", 5);
        assert!(queue.enqueue(key("s"), first).await);
        let mut completions = Vec::new();
        for (text, prio) in [("b", 5), ("c", 1), ("d", 5), ("e", 1)] {
            let (u, c) = unit(text, prio);
            assert!(queue.enqueue(key("s"), u).await);
            completions.push(c);
        }
        for c in completions {
            c.wait().await.unwrap();
        }

        assert_eq!(*exec.log.lock().unwrap(), vec!["first", "c", "e", "b", "d"]);
        assert_eq!(exec.peak_per_session.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sessions_drain_concurrently() {
        let exec = Arc::new(Recorder {
            delay_ms: 100,
            ..Default::default()
        });
        let queue = DispatchQueue::new(config(10), exec.clone());

        let started = Instant::now();
        let mut completions = Vec::new();
        for s in ["a", "b", "c", "d"] {
            let (u, c) = unit(s, 1);
            assert!(queue.enqueue(key(s), u).await);
            completions.push(c);
        }
        for c in completions {
            c.wait().await.unwrap();
        }
        // Serial execution would take 400ms.
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_backpressure_returns_false_and_keeps_order() {
        let exec = Arc::new(Recorder {
            delay_ms: 30,
            ..Default::default()
        });
        let queue = DispatchQueue::new(config(2), exec.clone());

        let (running, _c) = unit("running", 1);
        assert!(queue.enqueue(key("s"), running).await);
        let (a, ca) = unit("a", 1);
        let (b, cb) = unit("b", 1);
        assert!(queue.enqueue(key("s"), a).await);
        assert!(queue.enqueue(key("s"), b).await);

        let (overflow, c_over) = unit("overflow", 0);
        assert!(!queue.enqueue(key("s"), overflow).await);
        assert_eq!(c_over.wait().await, None);

        assert_eq!(ca.wait().await, Some(Reply::Text("a".into())));
        assert_eq!(cb.wait().await, Some(Reply::Text("b".into())));
        assert_eq!(*exec.log.lock().unwrap(), vec!["running", "a", "b"]);
        assert_eq!(queue.stats().await.rejected, 1);
    }

    #[tokio::test]
    async fn test_global_limit() {
        let exec = Arc::new(Recorder {
            delay_ms: 50,
            ..Default::default()
        });
        let mut cfg = config(10);
        cfg.global_max_pending = 1;
        let queue = DispatchQueue::new(cfg, exec);

        let (a, _ca) = unit("a", 1);
        let (b, _cb) = unit("b", 1);
        let (c, _cc) = unit("c", 1);
        assert!(queue.enqueue(key("s1"), a).await); // promoted straight away
        assert!(queue.enqueue(key("s1"), b).await); // waits
        assert!(!queue.enqueue(key("s2"), c).await);
    }

    #[tokio::test]
    async fn test_expired_units_are_dropped_silently() {
        let exec = Arc::new(Recorder {
            delay_ms: 80,
            ..Default::default()
        });
        let queue = DispatchQueue::new(config(10), exec.clone());

        let (blocker, c_blocker) = unit("blocker", 1);
        assert!(queue.enqueue(key("s"), blocker).await);
        let (stale, c_stale) = unit("stale", 1);
        let stale = stale.with_ttl(Duration::from_millis(20));
        assert!(queue.enqueue(key("s"), stale).await);
        let (fresh, c_fresh) = unit("fresh", 1);
        assert!(queue.enqueue(key("s"), fresh).await);

        c_blocker.wait().await.unwrap();
        assert_eq!(c_fresh.wait().await, Some(Reply::Text("fresh".into())));
        assert_eq!(c_stale.wait().await, None);
        assert_eq!(*exec.log.lock().unwrap(), vec!["blocker", "fresh"]);
        assert_eq!(queue.stats().await.expired, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried_by_queue() {
        let exec = Arc::new(Recorder::default());
        exec.failures_left.store(2, Ordering::SeqCst);
        let queue = DispatchQueue::new(config(10), exec.clone());

        let (u, c) = unit("hello", 1);
        assert!(queue.enqueue(key("s"), u).await);
        assert_eq!(c.wait().await, Some(Reply::Text("hello".into())));
    }

    #[tokio::test]
    async fn test_retries_exhausted_resolve_with_error() {
        let exec = Arc::new(Recorder::default());
        exec.failures_left.store(10, Ordering::SeqCst);
        let mut cfg = config(10);
        cfg.acquire_retries = 2;
        let queue = DispatchQueue::new(cfg, exec.clone());

        let (u, c) = unit("hello", 1);
        assert!(queue.enqueue(key("s"), u).await);
        let reply = c.wait().await.unwrap();
        assert!(reply.is_error());
        assert!(reply.text().contains("pool at capacity"));

        // The session is free again afterwards.
        exec.failures_left.store(0, Ordering::SeqCst);
        let (u, c) = unit("again", 1);
        assert!(queue.enqueue(key("s"), u).await);
        assert_eq!(c.wait().await, Some(Reply::Text("again".into())));
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let exec = Arc::new(Recorder {
            delay_ms: 10,
            ..Default::default()
        });
        let queue = DispatchQueue::new(config(10), exec);
        let (u, c) = unit("x", 1);
        queue.enqueue(key("s"), u).await;
        assert!(queue.is_active(&key("s")).await);
        c.wait().await.unwrap();

        // Let the runner task flip the session back to idle.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = queue.stats().await;
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.details[0].processed, 1);
        assert_eq!(queue.pending_for(&key("s")).await, 0);
        assert_eq!(queue.cleanup().await, 1);
        assert_eq!(queue.stats().await.sessions, 0);
    }
}
