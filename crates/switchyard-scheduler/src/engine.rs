//! Cron engine: owns the job table, fires jobs, and tracks every run to a
//! terminal status.
//!
//! A run is `pending` from the moment it fires until the dispatched unit's
//! responder is resolved or the run timeout elapses. Hand-off to the queue
//! never completes a run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use switchyard_core::completion::CompletionOutcome;
use switchyard_core::routing::{cron_session_key, main_session_key};
use switchyard_core::{
    DeliveryPolicy, JobMode, Reply, SessionKey, SwitchyardConfig, UnitOfWork, WorkKind, WorkPayload,
    completion,
};
use tokio::sync::Mutex;

use crate::cron;
use crate::error::EngineError;
use crate::job::{CronJob, JobPatch, JobSpec, LastRun, RunRecord, RunStatus, Schedule, ScheduleKind, ScheduleSpec};
use crate::persistence::{RunFinish, RunHistory};
use crate::store::JobStore;

const MAX_TASK_CHARS: usize = 2_000;
const DEFAULT_HISTORY_QUERY: usize = 20;
const MAX_HISTORY_QUERY: usize = 100;
const PREVIEW_CHARS: usize = 200;

/// Where fired jobs go. Implemented by the gateway's dispatcher.
#[async_trait]
pub trait CronDispatcher: Send + Sync {
    /// Enqueue a fired job's unit. `false` means the queue turned it away.
    async fn submit(&self, session_key: SessionKey, unit: UnitOfWork) -> bool;
}

/// Engine knobs, pulled from the gateway config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub run_timeout: Duration,
    pub history_limit: usize,
    pub default_timezone: String,
    pub cron_priority: i32,
    pub default_agent: String,
    pub agents: Vec<String>,
}

impl EngineSettings {
    pub fn from_config(config: &SwitchyardConfig) -> Self {
        Self {
            run_timeout: Duration::from_millis(config.scheduler.run_timeout_ms),
            history_limit: config.scheduler.history_limit.max(1),
            default_timezone: config.scheduler.default_timezone.clone(),
            cron_priority: config.queue.priority.cron,
            default_agent: switchyard_core::routing::default_agent(&config.routing),
            agents: config.routing.agents.iter().map(|a| a.id.clone()).collect(),
        }
    }
}

/// A job as reported to API callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    #[serde(flatten)]
    pub job: CronJob,
    pub status: &'static str,
    pub last_run: Option<LastRun>,
    /// A run is pending right now.
    pub running: bool,
}

/// Job counts.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub total: usize,
    pub active: usize,
    pub paused: usize,
    pub running: usize,
}

enum RunEnd {
    Replied(Reply),
    TimedOut(Duration),
    Rejected,
}

/// Identifies one run and the job instance it fired for.
struct RunTicket {
    job_id: String,
    instance: DateTime<Utc>,
    run_id: i64,
    triggered_at: DateTime<Utc>,
}

struct JobTable {
    jobs: Vec<CronJob>,
    /// job id → run id of its pending run.
    pending: HashMap<String, i64>,
}

struct EngineInner {
    settings: EngineSettings,
    table: Mutex<JobTable>,
    history: Mutex<RunHistory>,
    store: JobStore,
    dispatcher: Arc<dyn CronDispatcher>,
}

/// The cron scheduling engine. Cheap to clone.
#[derive(Clone)]
pub struct CronEngine {
    inner: Arc<EngineInner>,
}

impl CronEngine {
    /// Open the engine over `{data_dir}/cron`, recovering jobs and resolving stale runs.
    pub fn open(
        settings: EngineSettings,
        data_dir: &Path,
        dispatcher: Arc<dyn CronDispatcher>,
    ) -> Result<Self, EngineError> {
        let cron_dir = data_dir.join("cron");
        let store = JobStore::new(&cron_dir)?;
        let history = RunHistory::open(&cron_dir.join("runs.db"))?;
        history.recover_pending()?;

        let now = Utc::now();
        let mut jobs = store.load()?;
        for job in jobs.iter_mut() {
            let stale = job.next_run.is_none_or(|t| t < now);
            if job.schedule.kind != ScheduleKind::At && stale {
                job.next_run = cron::next_fire(&job.schedule, now, &settings.default_timezone);
            } else if job.schedule.kind == ScheduleKind::At && job.next_run.is_none() {
                job.next_run = cron::parse_at(&job.schedule.expr).ok();
            }
        }
        tracing::info!("📅 Loaded {} cron jobs from {}", jobs.len(), store.path().display());

        Ok(Self {
            inner: Arc::new(EngineInner {
                settings,
                table: Mutex::new(JobTable {
                    jobs,
                    pending: HashMap::new(),
                }),
                history: Mutex::new(history),
                store,
                dispatcher,
            }),
        })
    }

    /// Validate and add a job.
    ///
    /// Checks run in order and the first failure wins: id, schedule, task, agent.
    pub async fn add_job(&self, spec: JobSpec) -> Result<CronJob, EngineError> {
        let now = Utc::now();
        let mut table = self.inner.table.lock().await;

        let id = spec.id.unwrap_or_default();
        if !valid_id(&id) {
            return Err(EngineError::validation(
                "id",
                "alphanumeric/hyphens/underscores, 1-64 chars",
            ));
        }
        if table.jobs.iter().any(|j| j.id == id) {
            return Err(EngineError::Conflict(format!("job \"{id}\" already exists")));
        }
        let schedule = self.check_schedule(spec.schedule, now)?;
        let task = check_task(spec.task)?;
        let target_agent_id = self.check_agent(spec.target_agent_id)?;
        let mode = parse_mode(spec.mode)?.unwrap_or_default();
        let delivery_policy = parse_delivery(spec.delivery_policy)?.unwrap_or_default();
        let timeout_ms = check_timeout(spec.timeout_ms)?;

        let next_run = self.initial_next_run(&schedule, now);
        let job = CronJob {
            id,
            description: spec.description.filter(|d| !d.trim().is_empty()),
            schedule,
            task,
            target_agent_id,
            mode,
            delivery_policy,
            delete_after_run: spec.delete_after_run.unwrap_or(false),
            paused: false,
            timeout_ms,
            created_at: now,
            updated_at: now,
            next_run,
        };

        table.jobs.push(job.clone());
        self.inner.store.save(&table.jobs)?;
        tracing::info!(
            "📅 Job added: '{}' ({:?} {}), next run {:?}",
            job.id,
            job.schedule.kind,
            job.schedule.expr,
            job.next_run
        );
        Ok(job)
    }

    pub async fn remove_job(&self, id: &str) -> Result<(), EngineError> {
        let mut table = self.inner.table.lock().await;
        let before = table.jobs.len();
        table.jobs.retain(|j| j.id != id);
        if table.jobs.len() == before {
            return Err(EngineError::NotFound(id.to_string()));
        }
        // A run still in flight finishes against the removed instance only.
        table.pending.remove(id);
        self.inner.store.save(&table.jobs)?;
        tracing::info!("🗑️ Job removed: '{id}'");
        Ok(())
    }

    /// Pause a job. Pausing an already-paused job is a no-op.
    pub async fn pause_job(&self, id: &str) -> Result<CronJob, EngineError> {
        self.mutate(id, |job, now| {
            if !job.paused {
                job.paused = true;
                job.updated_at = now;
            }
            Ok(())
        })
        .await
    }

    /// Resume a paused job. Fails on a job that is not paused.
    pub async fn resume_job(&self, id: &str) -> Result<CronJob, EngineError> {
        let tz = self.inner.settings.default_timezone.clone();
        self.mutate(id, move |job, now| {
            if !job.paused {
                return Err(EngineError::NotPaused(job.id.clone()));
            }
            job.paused = false;
            job.updated_at = now;
            if job.schedule.kind != ScheduleKind::At && job.next_run.is_none_or(|t| t < now) {
                job.next_run = cron::next_fire(&job.schedule, now, &tz);
            }
            Ok(())
        })
        .await
    }

    /// Apply a partial update; every supplied field is re-validated.
    pub async fn update_job(&self, id: &str, patch: JobPatch) -> Result<CronJob, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::validation("update", "no fields to update"));
        }
        let now = Utc::now();
        let mut table = self.inner.table.lock().await;
        let idx = table
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let mut job = table.jobs[idx].clone();
        if let Some(spec) = patch.schedule {
            job.schedule = self.check_schedule(Some(spec), now)?;
            job.next_run = self.initial_next_run(&job.schedule, now);
        }
        if let Some(task) = patch.task {
            job.task = check_task(Some(task))?;
        }
        if let Some(agent) = patch.target_agent_id {
            job.target_agent_id = if agent.is_empty() {
                None
            } else {
                self.check_agent(Some(agent))?
            };
        }
        if let Some(mode) = parse_mode(patch.mode)? {
            job.mode = mode;
        }
        if let Some(policy) = parse_delivery(patch.delivery_policy)? {
            job.delivery_policy = policy;
        }
        if let Some(delete) = patch.delete_after_run {
            job.delete_after_run = delete;
        }
        if let Some(description) = patch.description {
            job.description = Some(description).filter(|d| !d.trim().is_empty());
        }
        if patch.timeout_ms.is_some() {
            job.timeout_ms = check_timeout(patch.timeout_ms)?;
        }
        job.updated_at = now;

        table.jobs[idx] = job.clone();
        self.inner.store.save(&table.jobs)?;
        tracing::info!("✏️ Job updated: '{id}'");
        Ok(job)
    }

    /// Fire a job now, regardless of its schedule or paused state.
    pub async fn run_job(&self, id: &str) -> Result<i64, EngineError> {
        self.fire(id, true).await
    }

    pub async fn list_jobs(&self) -> Vec<JobView> {
        let table = self.inner.table.lock().await;
        let history = self.inner.history.lock().await;
        table
            .jobs
            .iter()
            .map(|job| view(job, &history, table.pending.contains_key(&job.id)))
            .collect()
    }

    pub async fn get_job(&self, id: &str) -> Option<JobView> {
        let table = self.inner.table.lock().await;
        let history = self.inner.history.lock().await;
        table
            .jobs
            .iter()
            .find(|j| j.id == id)
            .map(|job| view(job, &history, table.pending.contains_key(&job.id)))
    }

    /// Most recent runs first. `limit` defaults to 20 and is clamped to 1..=100.
    pub async fn get_run_history(&self, id: &str, limit: Option<usize>) -> Result<Vec<RunRecord>, EngineError> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_QUERY).clamp(1, MAX_HISTORY_QUERY);
        let history = self.inner.history.lock().await;
        Ok(history.recent(id, limit)?)
    }

    pub async fn status(&self) -> EngineStatus {
        let table = self.inner.table.lock().await;
        let paused = table.jobs.iter().filter(|j| j.paused).count();
        EngineStatus {
            total: table.jobs.len(),
            active: table.jobs.len() - paused,
            paused,
            running: table.pending.len(),
        }
    }

    /// Fire every due job. Returns how many fired.
    ///
    /// A job whose previous run is still pending is skipped; its missed fire is
    /// not queued up.
    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        let due: Vec<String> = {
            let table = self.inner.table.lock().await;
            table
                .jobs
                .iter()
                .filter(|j| j.is_due(now))
                .filter(|j| {
                    let busy = table.pending.contains_key(&j.id);
                    if busy {
                        tracing::debug!("⏭️ Job '{}' still running, skipping this fire", j.id);
                    }
                    !busy
                })
                .map(|j| j.id.clone())
                .collect()
        };

        let mut fired = 0;
        for id in due {
            match self.fire(&id, false).await {
                Ok(_) => fired += 1,
                Err(e) => tracing::warn!("⚠️ Job '{id}' failed to fire: {e}"),
            }
        }
        fired
    }

    async fn fire(&self, id: &str, manual: bool) -> Result<i64, EngineError> {
        let settings = &self.inner.settings;
        let triggered_at = Utc::now();

        let (job, run_id) = {
            let mut guard = self.inner.table.lock().await;
            let table = &mut *guard;
            let job = table
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            if table.pending.contains_key(id) {
                return Err(EngineError::Conflict(format!(
                    "job \"{id}\" already has a run in progress"
                )));
            }
            if !manual {
                job.next_run = match job.schedule.kind {
                    ScheduleKind::At => None,
                    _ => cron::next_fire(&job.schedule, triggered_at, &settings.default_timezone),
                };
            }
            let job = job.clone();

            let run_id = self
                .inner
                .history
                .lock()
                .await
                .start_run(id, triggered_at, manual)?;
            table.pending.insert(id.to_string(), run_id);
            if let Err(e) = self.inner.store.save(&table.jobs) {
                tracing::warn!("⚠️ Failed to save jobs: {e}");
            }
            (job, run_id)
        };

        let agent_id = job
            .target_agent_id
            .clone()
            .unwrap_or_else(|| settings.default_agent.clone());
        let session_key = match job.mode {
            JobMode::Isolated => cron_session_key(&job.id),
            JobMode::Main => main_session_key(&agent_id),
        };
        let payload = WorkPayload {
            text: format!("[CRON:{}] {}", job.id, job.task),
            agent_id,
            kind: WorkKind::Cron {
                job_id: job.id.clone(),
                mode: job.mode,
                delivery: job.delivery_policy,
            },
            source: None,
        };
        let (responder, completion) = completion();
        let unit = UnitOfWork::new(payload, settings.cron_priority, format!("cron:{}", job.id), responder);

        tracing::info!(
            "🔔 Job '{}' fired{} (run {run_id}) → {}",
            job.id,
            if manual { " manually" } else { "" },
            session_key
        );

        let ticket = RunTicket {
            job_id: job.id.clone(),
            instance: job.created_at,
            run_id,
            triggered_at,
        };
        if !self.inner.dispatcher.submit(session_key, unit).await {
            self.finish(ticket, RunEnd::Rejected).await;
            return Ok(run_id);
        }

        let timeout = job
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(settings.run_timeout);
        let engine = self.clone();
        tokio::spawn(async move {
            let end = match completion.wait_timeout(timeout).await {
                CompletionOutcome::Replied(reply) => RunEnd::Replied(reply),
                CompletionOutcome::TimedOut => RunEnd::TimedOut(timeout),
            };
            engine.finish(ticket, end).await;
        });
        Ok(run_id)
    }

    /// Record a terminal status, then remove or reschedule the job.
    ///
    /// A rejected run never started, so the job keeps its schedule even when it
    /// is one-shot. Only the job instance the run fired for is touched.
    async fn finish(&self, ticket: RunTicket, end: RunEnd) {
        let RunTicket {
            job_id,
            instance,
            run_id,
            triggered_at,
        } = ticket;
        let job_id = job_id.as_str();
        let rejected = matches!(end, RunEnd::Rejected);
        let finished_at = Utc::now();
        let duration_ms = (finished_at - triggered_at).num_milliseconds().max(0) as u64;
        let (status, result_preview, error) = match end {
            RunEnd::Replied(Reply::Text(text)) => (RunStatus::Completed, Some(preview(&text)), None),
            RunEnd::Replied(Reply::Error(e)) => (RunStatus::Error, None, Some(e)),
            RunEnd::TimedOut(after) => (
                RunStatus::Timeout,
                None,
                Some(format!("no completion within {}ms", after.as_millis())),
            ),
            RunEnd::Rejected => (
                RunStatus::Error,
                None,
                Some("dispatch queue full, run not started".to_string()),
            ),
        };
        let finish = RunFinish {
            status,
            finished_at,
            duration_ms,
            result_preview,
            error,
        };

        let mut guard = self.inner.table.lock().await;
        let table = &mut *guard;

        let recorded = {
            let history = self.inner.history.lock().await;
            let recorded = history.finish_run(run_id, &finish).unwrap_or_else(|e| {
                tracing::error!("❌ Failed to record run {run_id} of '{job_id}': {e}");
                false
            });
            if let Err(e) = history.prune(job_id, self.inner.settings.history_limit) {
                tracing::warn!("⚠️ Failed to prune history of '{job_id}': {e}");
            }
            recorded
        };
        if table.pending.get(job_id) == Some(&run_id) {
            table.pending.remove(job_id);
        }
        if !recorded {
            return;
        }

        tracing::info!(
            "🏁 Job '{job_id}' run {run_id} {} in {duration_ms}ms",
            status.as_str()
        );

        let Some(idx) = table
            .jobs
            .iter()
            .position(|j| j.id == job_id && j.created_at == instance)
        else {
            tracing::debug!("🔀 Job '{job_id}' was removed or replaced before run {run_id} ended");
            return;
        };
        if rejected {
            let job = &mut table.jobs[idx];
            if job.schedule.kind == ScheduleKind::At && job.next_run.is_none() {
                job.next_run = cron::parse_at(&job.schedule.expr).ok();
            }
        } else if table.jobs[idx].is_one_shot() {
            table.jobs.remove(idx);
            tracing::info!("🗑️ Job '{job_id}' removed after its run");
        } else {
            let tz = &self.inner.settings.default_timezone;
            let job = &mut table.jobs[idx];
            if job.next_run.is_none_or(|t| t <= finished_at) {
                job.next_run = cron::next_fire(&job.schedule, finished_at, tz);
            }
        }
        if let Err(e) = self.inner.store.save(&table.jobs) {
            tracing::warn!("⚠️ Failed to save jobs: {e}");
        }
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<CronJob, EngineError>
    where
        F: FnOnce(&mut CronJob, DateTime<Utc>) -> Result<(), EngineError>,
    {
        let mut table = self.inner.table.lock().await;
        let job = table
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        f(job, Utc::now())?;
        let job = job.clone();
        self.inner.store.save(&table.jobs)?;
        tracing::info!("📅 Job '{}' is {}", job.id, job.status());
        Ok(job)
    }

    fn check_schedule(&self, spec: Option<ScheduleSpec>, now: DateTime<Utc>) -> Result<Schedule, EngineError> {
        let spec = spec.ok_or_else(|| {
            EngineError::validation("schedule", "required object with kind + expr")
        })?;
        let kind = spec
            .kind
            .as_deref()
            .and_then(ScheduleKind::parse)
            .ok_or_else(|| EngineError::validation("schedule.kind", r#"must be "cron", "every", or "at""#))?;
        let expr = spec
            .expr
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| EngineError::validation("schedule.expr", "required string"))?;
        let schedule = Schedule {
            kind,
            expr,
            timezone: spec.timezone.filter(|t| !t.trim().is_empty()),
        };
        cron::validate(&schedule, now).map_err(|(field, message)| EngineError::validation(field, message))?;
        Ok(schedule)
    }

    fn check_agent(&self, agent: Option<String>) -> Result<Option<String>, EngineError> {
        match agent {
            Some(agent) if !self.inner.settings.agents.iter().any(|a| *a == agent) => Err(
                EngineError::validation("targetAgentId", format!("\"{agent}\" not found in agents list")),
            ),
            other => Ok(other),
        }
    }

    fn initial_next_run(&self, schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        cron::next_fire(schedule, now, &self.inner.settings.default_timezone)
    }
}

/// Run the engine's timer loop.
pub fn spawn_scheduler(engine: CronEngine, tick_interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Scheduler started (tick every {}ms)", tick_interval.as_millis());
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let fired = engine.tick().await;
            if fired > 0 {
                tracing::debug!("⏰ {fired} jobs fired");
            }
        }
    })
}

fn view(job: &CronJob, history: &RunHistory, running: bool) -> JobView {
    let last_run = match history.last_terminal(&job.id) {
        Ok(run) => run.as_ref().map(LastRun::from),
        Err(e) => {
            tracing::warn!("⚠️ Failed to read last run of '{}': {e}", job.id);
            None
        }
    };
    JobView {
        job: job.clone(),
        status: job.status(),
        last_run,
        running,
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn check_task(task: Option<String>) -> Result<String, EngineError> {
    match task {
        Some(task) if !task.trim().is_empty() && task.chars().count() <= MAX_TASK_CHARS => Ok(task),
        _ => Err(EngineError::validation(
            "task",
            format!("non-empty string, max {MAX_TASK_CHARS} chars"),
        )),
    }
}

fn check_timeout(timeout_ms: Option<u64>) -> Result<Option<u64>, EngineError> {
    match timeout_ms {
        Some(0) => Err(EngineError::validation("timeoutMs", "must be greater than 0")),
        other => Ok(other),
    }
}

fn parse_mode(raw: Option<String>) -> Result<Option<JobMode>, EngineError> {
    match raw.as_deref() {
        None => Ok(None),
        Some("isolated") => Ok(Some(JobMode::Isolated)),
        Some("main") => Ok(Some(JobMode::Main)),
        Some(_) => Err(EngineError::validation("mode", r#"must be "isolated" or "main""#)),
    }
}

fn parse_delivery(raw: Option<String>) -> Result<Option<DeliveryPolicy>, EngineError> {
    match raw.as_deref() {
        None => Ok(None),
        Some("announce") => Ok(Some(DeliveryPolicy::Announce)),
        Some("direct") => Ok(Some(DeliveryPolicy::Direct)),
        Some("silent") => Ok(Some(DeliveryPolicy::Silent)),
        Some(_) => Err(EngineError::validation(
            "deliveryPolicy",
            r#"must be "announce", "direct", or "silent""#,
        )),
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push('…');
    }
    out
}
