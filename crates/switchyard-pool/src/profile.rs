//! Capability profiles: the launch parameters a worker was spawned with.
//!
//! Two profiles are interchangeable iff their signatures match; a worker bound
//! to a session is only reused when the requested profile has the same signature.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use switchyard_core::config::{AgentConfig, PoolConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityProfile {
    pub role: String,
    pub cwd: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// SHA-256 over role, cwd, args, env, and the worker command.
    pub signature: String,
}

impl CapabilityProfile {
    pub fn new(
        role: &str,
        cwd: Option<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        command: &str,
    ) -> Self {
        let signature = compute_signature(role, cwd.as_deref(), &args, &env, command);
        Self {
            role: role.to_string(),
            cwd,
            args,
            env,
            signature,
        }
    }

    /// Profile for a configured agent.
    pub fn for_agent(agent: &AgentConfig, pool: &PoolConfig) -> Self {
        let role = agent.role.clone().unwrap_or_else(|| agent.id.clone());
        Self::new(
            &role,
            agent.cwd.clone(),
            agent.args.clone(),
            agent.env.clone(),
            &pool.command,
        )
    }

    pub fn matches(&self, other: &CapabilityProfile) -> bool {
        self.signature == other.signature
    }
}

fn compute_signature(
    role: &str,
    cwd: Option<&str>,
    args: &[String],
    env: &BTreeMap<String, String>,
    command: &str,
) -> String {
    // BTreeMap keeps env keys sorted, so the JSON is canonical.
    let canonical = serde_json::json!({
        "role": role,
        "cwd": cwd,
        "args": args,
        "env": env,
        "command": command,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_and_sensitive() {
        let mut env = BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());

        let a = CapabilityProfile::new("ops", Some("/srv".into()), vec![], env.clone(), "pi");
        let b = CapabilityProfile::new("ops", Some("/srv".into()), vec![], env.clone(), "pi");
        assert!(a.matches(&b));
        assert_eq!(a.signature.len(), 64);

        let other_cwd = CapabilityProfile::new("ops", Some("/tmp".into()), vec![], env.clone(), "pi");
        assert!(!a.matches(&other_cwd));

        let other_cmd = CapabilityProfile::new("ops", Some("/srv".into()), vec![], env, "pi2");
        assert!(!a.matches(&other_cmd));
    }

    #[test]
    fn test_for_agent_defaults_role_to_id() {
        let agent = AgentConfig::named("writer");
        let profile = CapabilityProfile::for_agent(&agent, &PoolConfig::default());
        assert_eq!(profile.role, "writer");
        assert!(profile.cwd.is_none());
    }
}
