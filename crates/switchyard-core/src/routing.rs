//! Session key router: maps an inbound message to its conversation key and agent.
//!
//! ```text
//! DM      main              → agent:{agent}:main
//! DM      per-peer          → agent:{agent}:dm:{sender}
//! DM      per-channel-peer  → agent:{agent}:{channel}[:account:{acct}]:dm:{sender}
//! group                     → agent:{agent}:{channel}[:account:{acct}]:group:{chat}[:topic:{thread}]
//! channel                   → agent:{agent}:{channel}[:account:{acct}]:channel:{chat}[:thread:{thread}]
//! cron (isolated)           → cron:{job}
//! webhook                   → hook:{uuid}
//! ```
//!
//! Resolution never fails: malformed input degrades to the default agent and
//! an `unknown` placeholder for missing key parts.

use crate::config::{DmScope, RoutingConfig};
use crate::types::{ChatType, MessageSource, SessionKey};

/// Result of routing one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub session_key: SessionKey,
    pub target_agent_id: String,
    /// Message text with any explicit agent mention removed.
    pub stripped_text: String,
}

/// Route an inbound message.
pub fn resolve(source: &MessageSource, raw_text: &str, config: &RoutingConfig) -> Route {
    let (target_agent_id, stripped_text) = match split_mention(raw_text, config) {
        Some((agent, rest)) => (agent, rest),
        None => (default_agent(config), raw_text.to_string()),
    };

    let session_key = session_key_for(source, &target_agent_id, config.dm_scope);
    Route {
        session_key,
        target_agent_id,
        stripped_text,
    }
}

/// Compose the key for a message already attributed to `agent_id`.
pub fn session_key_for(source: &MessageSource, agent_id: &str, dm_scope: DmScope) -> SessionKey {
    let agent = sanitize(agent_id);
    let channel = sanitize(&source.channel.to_ascii_lowercase());
    let sender = if source.sender_id.trim().is_empty() {
        sanitize(&source.chat_id)
    } else {
        sanitize(&source.sender_id)
    };

    let mut parts: Vec<String> = vec!["agent".into(), agent];

    let push_channel = |parts: &mut Vec<String>| {
        parts.push(channel.clone());
        if let Some(account) = source.account_id.as_deref() {
            parts.push("account".into());
            parts.push(sanitize(account));
        }
    };

    match source.chat_type {
        ChatType::Direct => match dm_scope {
            DmScope::Main => parts.push("main".into()),
            DmScope::PerPeer => {
                parts.push("dm".into());
                parts.push(sender);
            }
            DmScope::PerChannelPeer => {
                push_channel(&mut parts);
                parts.push("dm".into());
                parts.push(sender);
            }
        },
        ChatType::Group => {
            push_channel(&mut parts);
            parts.push("group".into());
            parts.push(sanitize(&source.chat_id));
            if let Some(thread) = non_empty(source.thread_id.as_deref()) {
                parts.push("topic".into());
                parts.push(sanitize(thread));
            }
        }
        ChatType::Channel => {
            push_channel(&mut parts);
            parts.push("channel".into());
            parts.push(sanitize(&source.chat_id));
            if let Some(thread) = non_empty(source.thread_id.as_deref()) {
                parts.push("thread".into());
                parts.push(sanitize(thread));
            }
        }
    }

    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    SessionKey::from_parts(&refs)
}

/// The agent's shared main session (DM scope `main`, cron main-mode jobs).
pub fn main_session_key(agent_id: &str) -> SessionKey {
    SessionKey::from_parts(&["agent", &sanitize(agent_id), "main"])
}

/// Isolated session for one cron job.
pub fn cron_session_key(job_id: &str) -> SessionKey {
    SessionKey::from_parts(&["cron", &sanitize(job_id)])
}

/// Fresh single-use session for a webhook wake.
pub fn webhook_session_key() -> SessionKey {
    let id = uuid::Uuid::new_v4().to_string();
    SessionKey::from_parts(&["hook", &id])
}

/// Configured default agent, or the first configured agent if the default is missing.
pub fn default_agent(config: &RoutingConfig) -> String {
    if config.agent(&config.default_agent).is_some() {
        return config.default_agent.clone();
    }
    config
        .agents
        .first()
        .map(|a| a.id.clone())
        .unwrap_or_else(|| "main".to_string())
}

/// Split a leading `@agent` mention off the text, if it names a known agent.
fn split_mention(raw_text: &str, config: &RoutingConfig) -> Option<(String, String)> {
    let trimmed = raw_text.trim_start();
    if !trimmed.starts_with('@') {
        return None;
    }
    let token_end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let token = trimmed[..token_end].trim_end_matches([':', ',']);
    let agent = config.agent_for_mention(token)?;
    let rest = trimmed[token_end..].trim_start().to_string();
    Some((agent.id.clone(), rest))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn sanitize(part: &str) -> String {
    let part = part.trim();
    if part.is_empty() {
        return "unknown".into();
    }
    part.chars()
        .map(|c| if c == ':' || c.is_whitespace() || c.is_control() { '_' } else { c })
        .collect()
}
