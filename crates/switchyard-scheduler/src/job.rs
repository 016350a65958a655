//! Cron job definitions and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_core::{DeliveryPolicy, JobMode};

/// Schedule kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Calendar expression, 5 or 6 fields.
    Cron,
    /// Fixed interval: `30s`, `15m`, `2h`, `1d`.
    Every,
    /// One-shot RFC 3339 instant.
    At,
}

impl ScheduleKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cron" => Some(ScheduleKind::Cron),
            "every" => Some(ScheduleKind::Every),
            "at" => Some(ScheduleKind::At),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub kind: ScheduleKind,
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "tz")]
    pub timezone: Option<String>,
}

/// A persisted schedule rule plus the task it submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schedule: Schedule,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub mode: JobMode,
    #[serde(default)]
    pub delivery_policy: DeliveryPolicy,
    #[serde(default)]
    pub delete_after_run: bool,
    #[serde(default)]
    pub paused: bool,
    /// Overrides the engine's run timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

impl CronJob {
    pub fn status(&self) -> &'static str {
        if self.paused { "paused" } else { "active" }
    }

    /// Whether this job is removed after a run reaches a terminal status.
    pub fn is_one_shot(&self) -> bool {
        self.schedule.kind == ScheduleKind::At || self.delete_after_run
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_run.is_some_and(|at| at <= now)
    }
}

/// Loose schedule input; checked field by field during validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default, alias = "tz")]
    pub timezone: Option<String>,
}

/// Input for adding a job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default, alias = "agentId")]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, alias = "delivery")]
    pub delivery_policy: Option<String>,
    #[serde(default)]
    pub delete_after_run: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Input for `update`: every field optional, at least one required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default, alias = "agentId")]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, alias = "delivery")]
    pub delivery_policy: Option<String>,
    #[serde(default)]
    pub delete_after_run: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.schedule.is_none()
            && self.task.is_none()
            && self.target_agent_id.is_none()
            && self.mode.is_none()
            && self.delivery_policy.is_none()
            && self.delete_after_run.is_none()
            && self.timeout_ms.is_none()
    }
}

/// Outcome of one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Completed,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RunStatus::Pending),
            "completed" => Some(RunStatus::Completed),
            "error" => Some(RunStatus::Error),
            "timeout" => Some(RunStatus::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending)
    }
}

/// Ledger entry for one firing of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: i64,
    pub job_id: String,
    pub triggered_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub duration_ms: Option<u64>,
    pub manual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a job's most recent terminal run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub triggered_at: DateTime<Utc>,
    pub status: RunStatus,
    pub duration_ms: Option<u64>,
}

impl From<&RunRecord> for LastRun {
    fn from(run: &RunRecord) -> Self {
        Self {
            triggered_at: run.triggered_at,
            status: run.status,
            duration_ms: run.duration_ms,
        }
    }
}
