//! Worker pool: bounded table of session-bound workers.
//!
//! The pool is the only owner of worker processes. While a worker is busy its
//! process lives inside a [`WorkerLease`] handed to the caller; `release` moves
//! it back. A busy slot therefore has no process for anyone else to touch,
//! which is what keeps eviction away from busy workers.
//!
//! When every slot is busy, [`WorkerPool::acquire_or_wait`] parks the caller on
//! a waiting list ordered by priority. Each freed worker wakes one waiter.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use switchyard_core::SessionKey;
use switchyard_core::config::PoolConfig;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;

use crate::error::PoolError;
use crate::profile::CapabilityProfile;
use crate::worker::{Launcher, WorkerEvent, WorkerProcess, WorkerState};

/// Exclusive use of one worker for one unit of work.
pub struct WorkerLease {
    worker_id: String,
    session_key: SessionKey,
    pid: Option<u32>,
    process: Box<dyn WorkerProcess>,
}

impl WorkerLease {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Execute a prompt on the leased worker.
    pub async fn prompt(
        &mut self,
        text: &str,
        events: Option<mpsc::UnboundedSender<WorkerEvent>>,
    ) -> Result<String, PoolError> {
        self.process
            .prompt(text, events)
            .await
            .map_err(|e| PoolError::Worker(e.to_string()))
    }
}

/// Snapshot of one worker, safe to hand out.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub session_key: Option<SessionKey>,
    pub state: WorkerState,
    pub profile_signature: String,
    pub idle_ms: u64,
}

/// Pool counters by state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub spawning: usize,
    pub idle: usize,
    pub busy: usize,
    pub unbound: usize,
    pub max_capacity: usize,
    pub spawned_total: u64,
    pub evicted_total: u64,
    pub dead_total: u64,
    /// Callers parked until a worker frees up.
    pub waiting: usize,
    pub waited_total: u64,
    pub wait_expired_total: u64,
}

struct Waiter {
    seq: u64,
    priority: i32,
    wake: oneshot::Sender<()>,
}

struct Slot {
    id: String,
    pid: Option<u32>,
    session_key: Option<SessionKey>,
    profile: CapabilityProfile,
    state: WorkerState,
    last_activity: Instant,
    /// `None` while spawning or leased out.
    process: Option<Box<dyn WorkerProcess>>,
}

impl Slot {
    fn transition(&mut self, next: WorkerState) -> Result<(), PoolError> {
        if !self.state.can_transition_to(next) {
            return Err(PoolError::Worker(format!(
                "worker {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        tracing::trace!("Worker {}: {} → {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(|p| p.is_alive())
    }

    fn info(&self, now: Instant) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            pid: self.pid,
            session_key: self.session_key.clone(),
            state: self.state,
            profile_signature: self.profile.signature.clone(),
            idle_ms: match self.state {
                WorkerState::Idle => now.saturating_duration_since(self.last_activity).as_millis() as u64,
                _ => 0,
            },
        }
    }
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    next_id: u64,
    stopped: bool,
    spawned_total: u64,
    evicted_total: u64,
    dead_total: u64,
    /// Lowest priority value first, FIFO within a priority.
    waiters: Vec<Waiter>,
    next_waiter: u64,
    waited_total: u64,
    wait_expired_total: u64,
}

impl PoolState {
    fn position(&self, worker_id: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.id == worker_id)
    }

    /// Remove a slot, recording its terminal state. Returns its process for stopping.
    fn retire(&mut self, idx: usize, terminal: WorkerState) -> Option<Box<dyn WorkerProcess>> {
        let mut slot = self.slots.remove(idx);
        if let Err(e) = slot.transition(terminal) {
            tracing::error!("❌ {e}");
        }
        match terminal {
            WorkerState::Evicted => self.evicted_total += 1,
            _ => self.dead_total += 1,
        }
        tracing::info!(
            "🧹 Worker {} {} (session: {})",
            slot.id,
            terminal,
            slot.session_key.as_ref().map(|k| k.as_str()).unwrap_or("-")
        );
        slot.process.take()
    }

    fn enqueue_waiter(&mut self, seq: u64, priority: i32) -> oneshot::Receiver<()> {
        let (wake, rx) = oneshot::channel();
        let idx = self
            .waiters
            .iter()
            .position(|w| (w.priority, w.seq) > (priority, seq))
            .unwrap_or(self.waiters.len());
        self.waiters.insert(idx, Waiter { seq, priority, wake });
        rx
    }

    /// Hand a freed worker to the first waiter still listening.
    fn wake_next(&mut self) {
        while !self.waiters.is_empty() {
            let waiter = self.waiters.remove(0);
            if waiter.wake.send(()).is_ok() {
                return;
            }
        }
    }

    /// Returns false if the waiter was already woken.
    fn remove_waiter(&mut self, seq: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.seq != seq);
        self.waiters.len() != before
    }

    fn reserve(&mut self, session_key: Option<SessionKey>, profile: &CapabilityProfile) -> String {
        self.next_id += 1;
        let id = format!("worker-{}", self.next_id);
        self.slots.push(Slot {
            id: id.clone(),
            pid: None,
            session_key,
            profile: profile.clone(),
            state: WorkerState::Spawned,
            last_activity: Instant::now(),
            process: None,
        });
        id
    }
}

enum Plan {
    Leased(WorkerLease),
    Spawn(String),
    Wait(oneshot::Receiver<()>),
    Fail(PoolError),
}

enum Attempt {
    Leased(WorkerLease),
    Waiting(oneshot::Receiver<()>),
}

/// Bounded pool of session-bound workers.
pub struct WorkerPool {
    config: PoolConfig,
    launcher: Arc<dyn Launcher>,
    /// Profile used for prewarmed, unbound workers.
    default_profile: CapabilityProfile,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn Launcher>, default_profile: CapabilityProfile) -> Self {
        Self {
            config,
            launcher,
            default_profile,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Lease a worker bound to `session_key`, spawning one if needed.
    ///
    /// Fails with [`PoolError::AtCapacity`] when every slot is busy.
    pub async fn acquire(
        &self,
        session_key: &SessionKey,
        profile: &CapabilityProfile,
    ) -> Result<WorkerLease, PoolError> {
        match self.attempt(session_key, profile, None).await? {
            Attempt::Leased(lease) => Ok(lease),
            Attempt::Waiting(_) => Err(PoolError::AtCapacity { max: self.config.max }),
        }
    }

    /// Like [`acquire`](Self::acquire), but when every slot is busy, wait up to
    /// `wait` for one to free up. Lower `priority` values are served first.
    pub async fn acquire_or_wait(
        &self,
        session_key: &SessionKey,
        profile: &CapabilityProfile,
        priority: i32,
        wait: Duration,
    ) -> Result<WorkerLease, PoolError> {
        let started = Instant::now();
        let deadline = started + wait;
        let seq = {
            let mut state = self.state.lock().await;
            state.next_waiter += 1;
            state.next_waiter
        };
        let mut parked = false;

        loop {
            let wake = match self.attempt(session_key, profile, Some((seq, priority))).await? {
                Attempt::Leased(lease) => {
                    if parked {
                        tracing::info!(
                            "⏳ {} got {} after waiting {}ms",
                            session_key,
                            lease.worker_id,
                            started.elapsed().as_millis()
                        );
                    }
                    return Ok(lease);
                }
                Attempt::Waiting(wake) => wake,
            };
            if !parked {
                parked = true;
                self.state.lock().await.waited_total += 1;
                tracing::info!("⏳ Pool full, {} waiting for a worker (priority {priority})", session_key);
            }

            match tokio::time::timeout_at(deadline, wake).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(PoolError::Stopped),
                Err(_) => {
                    let mut state = self.state.lock().await;
                    if !state.remove_waiter(seq) {
                        // Woken just as the deadline passed; pass the worker on.
                        state.wake_next();
                    }
                    state.wait_expired_total += 1;
                    tracing::warn!("⌛ {} gave up waiting for a worker after {}ms", session_key, wait.as_millis());
                    return Err(PoolError::WaitTimeout {
                        waited_ms: wait.as_millis() as u64,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        session_key: &SessionKey,
        profile: &CapabilityProfile,
        wait_as: Option<(u64, i32)>,
    ) -> Result<Attempt, PoolError> {
        let mut to_stop = Vec::new();
        let plan = {
            let mut state = self.state.lock().await;
            match self.plan_acquire(&mut state, session_key, profile, &mut to_stop) {
                Plan::Fail(PoolError::AtCapacity { max }) => match wait_as {
                    Some((seq, priority)) => {
                        state.remove_waiter(seq);
                        if state.waiters.len() >= self.config.max_waiting {
                            Plan::Fail(PoolError::WaitListFull {
                                max: self.config.max_waiting,
                            })
                        } else {
                            Plan::Wait(state.enqueue_waiter(seq, priority))
                        }
                    }
                    None => Plan::Fail(PoolError::AtCapacity { max }),
                },
                plan => plan,
            }
        };
        stop_all(to_stop).await;

        let worker_id = match plan {
            Plan::Leased(lease) => {
                tracing::debug!("♻️ Reusing {} for {}", lease.worker_id, session_key);
                return Ok(Attempt::Leased(lease));
            }
            Plan::Wait(wake) => return Ok(Attempt::Waiting(wake)),
            Plan::Fail(e) => return Err(e),
            Plan::Spawn(id) => id,
        };

        tracing::info!("🚀 Spawning {} for {}", worker_id, session_key);
        match self.launcher.launch(&worker_id, profile).await {
            Ok(process) => self
                .finish_spawn(&worker_id, session_key, process)
                .await
                .map(Attempt::Leased),
            Err(e) => {
                let mut state = self.state.lock().await;
                if let Some(idx) = state.position(&worker_id) {
                    state.slots.remove(idx);
                    state.wake_next();
                }
                tracing::warn!("⚠️ Spawn of {} failed: {e}", worker_id);
                Err(PoolError::Spawn(e.to_string()))
            }
        }
    }

    fn plan_acquire(
        &self,
        state: &mut PoolState,
        session_key: &SessionKey,
        profile: &CapabilityProfile,
        to_stop: &mut Vec<Box<dyn WorkerProcess>>,
    ) -> Plan {
        if state.stopped {
            return Plan::Fail(PoolError::Stopped);
        }

        // 1. Worker already bound to this session.
        if let Some(idx) = state
            .slots
            .iter()
            .position(|s| s.session_key.as_ref() == Some(session_key))
        {
            let slot = &mut state.slots[idx];
            let current = slot.state;
            match current {
                WorkerState::Spawned | WorkerState::Busy => {
                    return Plan::Fail(PoolError::SessionBusy(session_key.to_string()));
                }
                WorkerState::Idle if !slot.is_alive() => {
                    to_stop.extend(state.retire(idx, WorkerState::Dead));
                }
                WorkerState::Idle if !slot.profile.matches(profile) => {
                    tracing::info!("🔄 Profile changed for {}, respawning", session_key);
                    to_stop.extend(state.retire(idx, WorkerState::Evicted));
                }
                WorkerState::Idle => {
                    return match lease(slot, session_key) {
                        Ok(lease) => Plan::Leased(lease),
                        Err(e) => Plan::Fail(e),
                    };
                }
                WorkerState::Evicted | WorkerState::Dead => {}
            }
        }

        // 2. Prewarmed worker with a matching profile.
        if let Some(slot) = state.slots.iter_mut().find(|s| {
            s.session_key.is_none() && s.state == WorkerState::Idle && s.profile.matches(profile)
        }) && slot.is_alive()
        {
            slot.session_key = Some(session_key.clone());
            return match lease(slot, session_key) {
                Ok(lease) => Plan::Leased(lease),
                Err(e) => Plan::Fail(e),
            };
        }

        // 3. Make room by evicting the least-recently-active idle worker of another session.
        if state.slots.len() >= self.config.max {
            let victim = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == WorkerState::Idle && s.session_key.as_ref() != Some(session_key))
                .min_by_key(|(_, s)| s.last_activity)
                .map(|(idx, _)| idx);
            match victim {
                Some(idx) => to_stop.extend(state.retire(idx, WorkerState::Evicted)),
                None => {
                    tracing::warn!("⚠️ Pool at capacity ({}), no idle worker to evict", self.config.max);
                    return Plan::Fail(PoolError::AtCapacity { max: self.config.max });
                }
            }
        }

        // 4. Reserve a slot; the process starts outside the lock.
        Plan::Spawn(state.reserve(Some(session_key.clone()), profile))
    }

    async fn finish_spawn(
        &self,
        worker_id: &str,
        session_key: &SessionKey,
        mut process: Box<dyn WorkerProcess>,
    ) -> Result<WorkerLease, PoolError> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(worker_id) else {
            drop(state);
            process.stop().await;
            return Err(PoolError::Stopped);
        };
        state.spawned_total += 1;
        let slot = &mut state.slots[idx];
        slot.pid = process.pid();
        slot.transition(WorkerState::Busy)?;
        slot.last_activity = Instant::now();
        Ok(WorkerLease {
            worker_id: worker_id.to_string(),
            session_key: session_key.clone(),
            pid: slot.pid,
            process,
        })
    }

    /// Return a leased worker. It stays bound to its session.
    pub async fn release(&self, lease: WorkerLease) {
        let WorkerLease {
            worker_id,
            session_key,
            mut process,
            ..
        } = lease;
        let alive = process.is_alive();

        let mut state = self.state.lock().await;
        match state.position(&worker_id) {
            Some(idx) if alive => {
                let slot = &mut state.slots[idx];
                if let Err(e) = slot.transition(WorkerState::Idle) {
                    tracing::error!("❌ {e}");
                }
                slot.process = Some(process);
                slot.last_activity = Instant::now();
                state.wake_next();
                tracing::debug!("Worker {} idle (session: {})", worker_id, session_key);
            }
            Some(idx) => {
                state.retire(idx, WorkerState::Dead);
                state.wake_next();
                drop(state);
                tracing::warn!("⚠️ Worker {} died while serving {}", worker_id, session_key);
                process.stop().await;
            }
            None => {
                drop(state);
                process.stop().await;
            }
        }
    }

    /// Non-creating lookup of the worker bound to a session.
    pub async fn get_for_session(&self, session_key: &SessionKey) -> Option<WorkerInfo> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .slots
            .iter()
            .find(|s| s.session_key.as_ref() == Some(session_key))
            .map(|s| s.info(now))
    }

    pub async fn get_by_pid(&self, pid: u32) -> Option<WorkerInfo> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .slots
            .iter()
            .find(|s| s.pid == Some(pid))
            .map(|s| s.info(now))
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state.slots.iter().map(|s| s.info(now)).collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let mut stats = PoolStats {
            total: state.slots.len(),
            max_capacity: self.config.max,
            spawned_total: state.spawned_total,
            evicted_total: state.evicted_total,
            dead_total: state.dead_total,
            waiting: state.waiters.len(),
            waited_total: state.waited_total,
            wait_expired_total: state.wait_expired_total,
            ..Default::default()
        };
        for slot in &state.slots {
            match slot.state {
                WorkerState::Spawned => stats.spawning += 1,
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Evicted | WorkerState::Dead => {}
            }
            if slot.session_key.is_none() {
                stats.unbound += 1;
            }
        }
        stats
    }

    /// Reap dead workers, evict idle ones past the timeout, and top up to `min`.
    pub async fn maintenance(&self) {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let mut to_stop = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.stopped {
                return;
            }

            let mut idx = 0;
            while idx < state.slots.len() {
                let slot = &mut state.slots[idx];
                if slot.state == WorkerState::Idle && !slot.is_alive() {
                    to_stop.extend(state.retire(idx, WorkerState::Dead));
                    state.wake_next();
                } else {
                    idx += 1;
                }
            }

            let now = Instant::now();
            let mut expired: Vec<(Instant, String)> = state
                .slots
                .iter()
                .filter(|s| {
                    s.state == WorkerState::Idle
                        && now.saturating_duration_since(s.last_activity) >= idle_timeout
                })
                .map(|s| (s.last_activity, s.id.clone()))
                .collect();
            expired.sort();

            let excess = state.slots.len().saturating_sub(self.config.min);
            for (_, id) in expired.into_iter().take(excess) {
                if let Some(idx) = state.position(&id) {
                    to_stop.extend(state.retire(idx, WorkerState::Evicted));
                    state.wake_next();
                }
            }
        }
        stop_all(to_stop).await;
        self.ensure_min().await;
    }

    /// Prewarm unbound workers until the pool holds `min`.
    pub async fn ensure_min(&self) {
        loop {
            let worker_id = {
                let mut state = self.state.lock().await;
                if state.stopped || state.slots.len() >= self.config.min {
                    return;
                }
                state.reserve(None, &self.default_profile)
            };

            match self.launcher.launch(&worker_id, &self.default_profile).await {
                Ok(mut process) => {
                    let mut state = self.state.lock().await;
                    let Some(idx) = state.position(&worker_id) else {
                        drop(state);
                        process.stop().await;
                        return;
                    };
                    state.spawned_total += 1;
                    let slot = &mut state.slots[idx];
                    slot.pid = process.pid();
                    slot.process = Some(process);
                    slot.last_activity = Instant::now();
                    if let Err(e) = slot.transition(WorkerState::Idle) {
                        tracing::error!("❌ {e}");
                    }
                    tracing::info!("🔥 Prewarmed {}", worker_id);
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    if let Some(idx) = state.position(&worker_id) {
                        state.slots.remove(idx);
                        state.wake_next();
                    }
                    tracing::warn!("⚠️ Prewarm failed: {e}");
                    return;
                }
            }
        }
    }

    /// Stop every worker. Leased workers are stopped when released.
    pub async fn shutdown(&self) {
        let processes: Vec<_> = {
            let mut state = self.state.lock().await;
            state.stopped = true;
            // Dropping the wake senders fails every waiter with `Stopped`.
            state.waiters.clear();
            state.slots.drain(..).filter_map(|mut s| s.process.take()).collect()
        };
        tracing::info!("🛑 Stopping {} pooled workers", processes.len());
        stop_all(processes).await;
    }
}

/// Run maintenance on the configured interval until the pool shuts down.
pub fn spawn_maintenance(pool: Arc<WorkerPool>) -> tokio::task::JoinHandle<()> {
    let every = Duration::from_millis(pool.config.maintenance_interval_ms.max(100));
    tokio::spawn(async move {
        tracing::info!("⏱️ Pool maintenance every {}ms", every.as_millis());
        pool.ensure_min().await;
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if pool.state.lock().await.stopped {
                break;
            }
            pool.maintenance().await;
        }
    })
}

fn lease(slot: &mut Slot, session_key: &SessionKey) -> Result<WorkerLease, PoolError> {
    let process = slot
        .process
        .take()
        .ok_or_else(|| PoolError::Worker(format!("worker {} has no process", slot.id)))?;
    slot.transition(WorkerState::Busy)?;
    slot.last_activity = Instant::now();
    Ok(WorkerLease {
        worker_id: slot.id.clone(),
        session_key: session_key.clone(),
        pid: slot.pid,
        process,
    })
}

async fn stop_all(processes: Vec<Box<dyn WorkerProcess>>) {
    futures::future::join_all(processes.into_iter().map(|mut process| async move {
        process.stop().await;
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use switchyard_core::{Result, SwitchyardError};

    struct FakeProcess {
        id: String,
        pid: u32,
        alive: Arc<AtomicBool>,
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn prompt(
            &mut self,
            text: &str,
            events: Option<mpsc::UnboundedSender<WorkerEvent>>,
        ) -> Result<String> {
            if let Some(tx) = events {
                let _ = tx.send(WorkerEvent::Delta("…".into()));
            }
            Ok(format!("{}:{}", self.id, text))
        }

        async fn stop(&mut self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: AtomicU32,
        fail: AtomicBool,
        handles: std::sync::Mutex<Vec<(String, Arc<AtomicBool>)>>,
    }

    impl FakeLauncher {
        fn launches(&self) -> u32 {
            self.launched.load(Ordering::SeqCst)
        }

        fn kill(&self, worker_id: &str) {
            let handles = self.handles.lock().unwrap();
            let (_, alive) = handles.iter().find(|(id, _)| id == worker_id).unwrap();
            alive.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, worker_id: &str, _profile: &CapabilityProfile) -> Result<Box<dyn WorkerProcess>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SwitchyardError::Worker("no such binary".into()));
            }
            let n = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
            let alive = Arc::new(AtomicBool::new(true));
            self.handles
                .lock()
                .unwrap()
                .push((worker_id.to_string(), alive.clone()));
            Ok(Box::new(FakeProcess {
                id: worker_id.to_string(),
                pid: 1000 + n,
                alive,
            }))
        }
    }

    fn profile(role: &str) -> CapabilityProfile {
        CapabilityProfile::new(role, None, vec![], BTreeMap::new(), "fake")
    }

    fn pool(max: usize, min: usize) -> (Arc<WorkerPool>, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::default());
        let config = PoolConfig {
            max,
            min,
            idle_timeout_ms: 1_000,
            ..Default::default()
        };
        let pool = Arc::new(WorkerPool::new(config, launcher.clone(), profile("main")));
        (pool, launcher)
    }

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s)
    }

    #[tokio::test]
    async fn test_binding_persists_across_release() {
        let (pool, launcher) = pool(2, 0);
        let mut lease = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        let first = lease.worker_id().to_string();
        assert_eq!(lease.prompt("hi", None).await.unwrap(), format!("{first}:hi"));
        pool.release(lease).await;

        let info = pool.get_for_session(&key("a")).await.unwrap();
        assert_eq!(info.state, WorkerState::Idle);

        let lease = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        assert_eq!(lease.worker_id(), first);
        assert_eq!(launcher.launches(), 1);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn test_same_session_never_gets_two_workers() {
        let (pool, _) = pool(4, 0);
        let lease = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        let second = pool.acquire(&key("a"), &profile("main")).await;
        assert!(matches!(second, Err(PoolError::SessionBusy(_))));
        pool.release(lease).await;
        assert!(pool.acquire(&key("a"), &profile("main")).await.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent_idle_other_session() {
        let (pool, launcher) = pool(2, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        pool.release(a).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = pool.acquire(&key("b"), &profile("main")).await.unwrap();
        pool.release(b).await;

        let c = pool.acquire(&key("c"), &profile("main")).await.unwrap();
        assert!(pool.get_for_session(&key("a")).await.is_none());
        assert!(pool.get_for_session(&key("b")).await.is_some());
        assert_eq!(launcher.launches(), 3);

        let stats = pool.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.evicted_total, 1);
        pool.release(c).await;
    }

    #[tokio::test]
    async fn test_busy_workers_are_never_evicted() {
        let (pool, _) = pool(2, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        let b = pool.acquire(&key("b"), &profile("main")).await.unwrap();

        let err = pool.acquire(&key("c"), &profile("main")).await.err().unwrap();
        assert!(matches!(err, PoolError::AtCapacity { max: 2 }));
        assert!(err.is_retryable());
        assert_eq!(pool.get_for_session(&key("a")).await.unwrap().state, WorkerState::Busy);

        pool.release(a).await;
        pool.release(b).await;
        assert!(pool.acquire(&key("c"), &profile("main")).await.is_ok());
    }

    #[tokio::test]
    async fn test_profile_change_respawns() {
        let (pool, launcher) = pool(2, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        let first = a.worker_id().to_string();
        pool.release(a).await;

        let a = pool.acquire(&key("a"), &profile("ops")).await.unwrap();
        assert_ne!(a.worker_id(), first);
        assert_eq!(launcher.launches(), 2);
        pool.release(a).await;
    }

    #[tokio::test]
    async fn test_dead_worker_is_replaced() {
        let (pool, launcher) = pool(2, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        let first = a.worker_id().to_string();
        pool.release(a).await;

        launcher.kill(&first);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        assert_ne!(a.worker_id(), first);
        assert_eq!(pool.stats().await.dead_total, 1);
        pool.release(a).await;
    }

    #[tokio::test]
    async fn test_release_of_dead_worker_unbinds() {
        let (pool, launcher) = pool(2, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        launcher.kill(a.worker_id());
        pool.release(a).await;
        assert!(pool.get_for_session(&key("a")).await.is_none());
        assert_eq!(pool.stats().await.dead_total, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_not_retried() {
        let (pool, launcher) = pool(2, 0);
        launcher.fail.store(true, Ordering::SeqCst);
        let err = pool.acquire(&key("a"), &profile("main")).await.err().unwrap();
        assert!(matches!(err, PoolError::Spawn(_)));
        assert_eq!(pool.stats().await.total, 0);

        launcher.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire(&key("a"), &profile("main")).await.is_ok());
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_lookup_by_pid() {
        let (pool, _) = pool(2, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        let pid = a.pid().unwrap();
        let info = pool.get_by_pid(pid).await.unwrap();
        assert_eq!(info.session_key, Some(key("a")));
        assert!(pool.get_by_pid(1).await.is_none());
        pool.release(a).await;
    }

    #[tokio::test]
    async fn test_prewarmed_worker_is_adopted() {
        let (pool, launcher) = pool(3, 1);
        pool.ensure_min().await;
        let stats = pool.stats().await;
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.unbound, 1);

        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        assert_eq!(launcher.launches(), 1);
        assert_eq!(pool.stats().await.unbound, 0);
        pool.release(a).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_evicts_idle_beyond_min() {
        let (pool, launcher) = pool(4, 1);
        for k in ["a", "b"] {
            let lease = pool.acquire(&key(k), &profile("main")).await.unwrap();
            pool.release(lease).await;
        }
        tokio::time::advance(Duration::from_millis(1_500)).await;
        pool.maintenance().await;

        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.evicted_total, 1);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (pool, _) = pool(2, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        pool.release(a).await;
        pool.shutdown().await;
        assert_eq!(pool.stats().await.total, 0);
        assert!(matches!(
            pool.acquire(&key("a"), &profile("main")).await,
            Err(PoolError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_sessions_run_in_parallel() {
        let (pool, _) = pool(4, 0);
        let mut tasks = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let k = key(&format!("s{i}"));
                let mut lease = pool.acquire(&k, &profile("main")).await.unwrap();
                let out = lease.prompt("x", None).await.unwrap();
                pool.release(lease).await;
                out
            }));
        }
        let mut workers = std::collections::HashSet::new();
        for t in tasks {
            workers.insert(t.await.unwrap());
        }
        assert_eq!(workers.len(), 4);
    }

    #[tokio::test]
    async fn test_full_pool_waiter_gets_released_worker() {
        let (pool, _launcher) = pool(1, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        assert!(matches!(
            pool.acquire(&key("b"), &profile("main")).await,
            Err(PoolError::AtCapacity { max: 1 })
        ));

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_or_wait(&key("b"), &profile("main"), 5, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().await.waiting, 1);

        pool.release(a).await;
        let b = waiting.await.unwrap().unwrap();
        assert_eq!(b.session_key(), &key("b"));
        assert!(pool.get_for_session(&key("a")).await.is_none());

        let stats = pool.stats().await;
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.waited_total, 1);
        pool.release(b).await;
    }

    #[tokio::test]
    async fn test_waiters_are_served_by_priority() {
        let (pool, _launcher) = pool(1, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (name, priority) in [("low", 7), ("high", 1)] {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool
                    .acquire_or_wait(&key(name), &profile("main"), priority, Duration::from_secs(5))
                    .await
                    .unwrap();
                order.lock().unwrap().push(name);
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.release(lease).await;
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.stats().await.waiting, 2);

        pool.release(a).await;
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_wait_expires_and_is_counted() {
        let (pool, _launcher) = pool(1, 0);
        let a = pool.acquire(&key("a"), &profile("main")).await.unwrap();

        let err = pool
            .acquire_or_wait(&key("b"), &profile("main"), 1, Duration::from_millis(30))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::WaitTimeout { waited_ms: 30 }));
        assert!(!err.is_retryable());

        let stats = pool.stats().await;
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.wait_expired_total, 1);

        // A later release finds nobody waiting and the worker simply idles.
        pool.release(a).await;
        assert_eq!(pool.stats().await.idle, 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters() {
        let (pool, _launcher) = pool(1, 0);
        let _a = pool.acquire(&key("a"), &profile("main")).await.unwrap();
        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_or_wait(&key("b"), &profile("main"), 1, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;
        assert!(matches!(waiting.await.unwrap(), Err(PoolError::Stopped)));
    }
}
