//! Switchyard configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SwitchyardError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl SwitchyardConfig {
    /// Load config from the default path (~/.switchyard/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SwitchyardError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SwitchyardError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatch core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max == 0 {
            return Err(SwitchyardError::Config("pool.max must be at least 1".into()));
        }
        if self.pool.min > self.pool.max {
            return Err(SwitchyardError::Config(format!(
                "pool.min ({}) exceeds pool.max ({})",
                self.pool.min, self.pool.max
            )));
        }
        if self.pool.prompt_timeout_ms == 0 {
            return Err(SwitchyardError::Config(
                "pool.prompt_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.queue.max_per_session == 0 {
            return Err(SwitchyardError::Config(
                "queue.max_per_session must be at least 1".into(),
            ));
        }
        if self.routing.agents.is_empty() {
            return Err(SwitchyardError::Config("routing.agents is empty".into()));
        }
        if self.routing.agent(&self.routing.default_agent).is_none() {
            return Err(SwitchyardError::Config(format!(
                "routing.default_agent \"{}\" not found in routing.agents",
                self.routing.default_agent
            )));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Switchyard home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".switchyard")
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Root for jobs.json and the run history database. `~` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_port() -> u16 { 18790 }
fn default_host() -> String { "127.0.0.1".into() }
fn default_data_dir() -> String { "~/.switchyard".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            data_dir: default_data_dir(),
        }
    }
}

impl GatewayConfig {
    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }
}

/// How direct messages map onto sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    /// Every DM shares the agent's main session.
    Main,
    /// One session per sender, shared across channels.
    #[default]
    PerPeer,
    /// One session per sender per channel.
    PerChannelPeer,
}

/// Routing configuration: agents and session scoping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_agent_id")]
    pub default_agent: String,
    #[serde(default)]
    pub dm_scope: DmScope,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,
    /// Sender ids whose messages get the allowlist priority bonus.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

fn default_agent_id() -> String { "main".into() }
fn default_agents() -> Vec<AgentConfig> { vec![AgentConfig::named("main")] }

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_agent: default_agent_id(),
            dm_scope: DmScope::default(),
            agents: default_agents(),
            allowlist: Vec::new(),
        }
    }
}

impl RoutingConfig {
    /// Look up an agent by id.
    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Resolve a mention token (`@ops`, or a configured alias) to an agent id.
    pub fn agent_for_mention(&self, token: &str) -> Option<&AgentConfig> {
        let token = token.trim_start_matches('@');
        if token.is_empty() {
            return None;
        }
        self.agents.iter().find(|a| {
            a.id.eq_ignore_ascii_case(token)
                || a.mentions.iter().any(|m| m.trim_start_matches('@').eq_ignore_ascii_case(token))
        })
    }

    pub fn is_allowlisted(&self, sender_id: &str) -> bool {
        self.allowlist.iter().any(|s| s == sender_id)
    }
}

/// One logical agent identity and the worker profile it runs with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra names that target this agent from message text.
    #[serde(default)]
    pub mentions: Vec<String>,
}

impl AgentConfig {
    pub fn named(id: &str) -> Self {
        Self {
            id: id.to_string(),
            role: None,
            cwd: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            mentions: Vec::new(),
        }
    }
}

/// Worker process pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub min: usize,
    #[serde(default = "default_pool_max")]
    pub max: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    /// Worker executable.
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    /// How long a fresh process must stay up before it counts as spawned.
    #[serde(default = "default_spawn_grace_ms")]
    pub spawn_grace_ms: u64,
    /// Time between terminate and kill when stopping a worker.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Longest a single prompt may run before the worker is killed.
    #[serde(default = "default_prompt_timeout_ms")]
    pub prompt_timeout_ms: u64,
    /// How long a unit may wait for a free worker when the pool is full and
    /// the unit carries no TTL of its own.
    #[serde(default = "default_acquire_wait_ms")]
    pub acquire_wait_ms: u64,
    /// Callers allowed to wait for a worker at once.
    #[serde(default = "default_max_waiting")]
    pub max_waiting: usize,
}

fn default_pool_max() -> usize { 4 }
fn default_idle_timeout_ms() -> u64 { 600_000 }
fn default_maintenance_interval_ms() -> u64 { 30_000 }
fn default_worker_command() -> String { "pi".into() }
fn default_worker_args() -> Vec<String> { vec!["--mode".into(), "rpc".into()] }
fn default_spawn_grace_ms() -> u64 { 200 }
fn default_stop_grace_ms() -> u64 { 2_000 }
fn default_prompt_timeout_ms() -> u64 { 120_000 }
fn default_acquire_wait_ms() -> u64 { 30_000 }
fn default_max_waiting() -> usize { 50 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: default_pool_max(),
            idle_timeout_ms: default_idle_timeout_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            command: default_worker_command(),
            args: default_worker_args(),
            spawn_grace_ms: default_spawn_grace_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            prompt_timeout_ms: default_prompt_timeout_ms(),
            acquire_wait_ms: default_acquire_wait_ms(),
            max_waiting: default_max_waiting(),
        }
    }
}

/// Dispatch queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_per_session")]
    pub max_per_session: usize,
    #[serde(default = "default_global_max_pending")]
    pub global_max_pending: usize,
    /// 0 = units never expire.
    #[serde(default)]
    pub default_ttl_ms: u64,
    #[serde(default = "default_acquire_retries")]
    pub acquire_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub priority: PriorityConfig,
}

fn default_max_per_session() -> usize { 15 }
fn default_global_max_pending() -> usize { 100 }
fn default_acquire_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 500 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_per_session: default_max_per_session(),
            global_max_pending: default_global_max_pending(),
            default_ttl_ms: 0,
            acquire_retries: default_acquire_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            priority: PriorityConfig::default(),
        }
    }
}

/// Priority per source (lower = runs first).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    #[serde(default = "default_dm_priority")]
    pub dm: i32,
    #[serde(default = "default_group_priority")]
    pub group: i32,
    #[serde(default = "default_webhook_priority")]
    pub webhook: i32,
    #[serde(default = "default_cron_priority")]
    pub cron: i32,
    #[serde(default = "default_allowlist_bonus")]
    pub allowlist_bonus: i32,
}

fn default_dm_priority() -> i32 { 1 }
fn default_group_priority() -> i32 { 5 }
fn default_webhook_priority() -> i32 { 7 }
fn default_cron_priority() -> i32 { 3 }
fn default_allowlist_bonus() -> i32 { 1 }

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            dm: default_dm_priority(),
            group: default_group_priority(),
            webhook: default_webhook_priority(),
            cron: default_cron_priority(),
            allowlist_bonus: default_allowlist_bonus(),
        }
    }
}

/// Scheduling engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How long a run may stay pending before the engine marks it timed out.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    /// Run records retained per job.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

fn bool_true() -> bool { true }
fn default_tick_interval_ms() -> u64 { 1_000 }
fn default_run_timeout_ms() -> u64 { 120_000 }
fn default_history_limit() -> usize { 200 }
fn default_timezone() -> String { "UTC".into() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval_ms(),
            run_timeout_ms: default_run_timeout_ms(),
            history_limit: default_history_limit(),
            default_timezone: default_timezone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SwitchyardConfig::default();
        assert_eq!(config.gateway.port, 18790);
        assert_eq!(config.routing.default_agent, "main");
        assert_eq!(config.routing.dm_scope, DmScope::PerPeer);
        assert_eq!(config.pool.max, 4);
        assert_eq!(config.pool.prompt_timeout_ms, 120_000);
        assert_eq!(config.queue.max_per_session, 15);
        assert_eq!(config.scheduler.run_timeout_ms, 120_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [routing]
            default_agent = "ops"
            dm_scope = "per-channel-peer"

            [[routing.agents]]
            id = "ops"
            cwd = "/srv/ops"
            mentions = ["@oncall"]

            [[routing.agents]]
            id = "writer"

            [pool]
            max = 8
            command = "agent-worker"
        "#;

        let config: SwitchyardConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.routing.dm_scope, DmScope::PerChannelPeer);
        assert_eq!(config.routing.agents.len(), 2);
        assert_eq!(config.routing.agent("ops").unwrap().cwd.as_deref(), Some("/srv/ops"));
        assert_eq!(config.routing.agent_for_mention("oncall").unwrap().id, "ops");
        assert_eq!(config.pool.max, 8);
        assert_eq!(config.pool.args, vec!["--mode", "rpc"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: SwitchyardConfig = toml::from_str("").unwrap();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.queue.priority.dm, 1);
        assert_eq!(config.queue.priority.webhook, 7);
    }

    #[test]
    fn test_validate_rejects_bad_pool_bounds() {
        let mut config = SwitchyardConfig::default();
        config.pool.min = 5;
        config.pool.max = 2;
        assert!(matches!(config.validate(), Err(SwitchyardError::Config(_))));

        config.pool.min = 0;
        config.pool.max = 0;
        assert!(config.validate().is_err());

        config.pool.max = 2;
        config.pool.prompt_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_default_agent() {
        let mut config = SwitchyardConfig::default();
        config.routing.default_agent = "ghost".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nport = 9000\n").unwrap();
        let config = SwitchyardConfig::load_from(&path).unwrap();
        assert_eq!(config.gateway.port, 9000);

        std::fs::write(&path, "[gateway\nport =").unwrap();
        assert!(SwitchyardConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_home_dir() {
        let home = SwitchyardConfig::home_dir();
        assert!(home.to_string_lossy().contains("switchyard"));
    }
}
