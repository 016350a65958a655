//! Inbound message shapes and the session key.

use serde::{Deserialize, Serialize};

/// Canonical identifier for one conversation. The unit of serialization.
///
/// Keys are colon-delimited (`agent:{agent}:{channel}:{scope}:{id}`, `cron:{job}`,
/// `hook:{uuid}`). Build them through [`crate::routing`] rather than by hand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub(crate) fn from_parts(parts: &[&str]) -> Self {
        Self(parts.join(":"))
    }

    /// Wrap an already-canonical key (e.g. one read back from storage).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Agent segment of an `agent:` key.
    pub fn agent_id(&self) -> Option<&str> {
        let mut parts = self.0.split(':');
        match (parts.next(), parts.next()) {
            (Some("agent"), Some(agent)) if !agent.is_empty() => Some(agent),
            _ => None,
        }
    }

    pub fn is_cron(&self) -> bool {
        self.0.starts_with("cron:")
    }

    pub fn is_webhook(&self) -> bool {
        self.0.starts_with("hook:")
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Conversation scope of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// One-on-one conversation.
    #[default]
    Direct,
    /// Multi-member chat.
    Group,
    /// Broadcast channel or server channel.
    Channel,
}

/// Where a message came from, as reported by a channel adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageSource {
    /// Channel name: "telegram", "discord", "webhook"...
    pub channel: String,
    #[serde(default)]
    pub chat_type: ChatType,
    pub chat_id: String,
    pub sender_id: String,
    /// Topic or thread inside a group/channel.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Bot account on multi-account channels.
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
}

impl MessageSource {
    pub fn direct(channel: &str, sender_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_type: ChatType::Direct,
            chat_id: sender_id.to_string(),
            sender_id: sender_id.to_string(),
            ..Default::default()
        }
    }

    pub fn group(channel: &str, chat_id: &str, sender_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_type: ChatType::Group,
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            ..Default::default()
        }
    }

    /// Short label used in logs and queue stats.
    pub fn label(&self) -> String {
        match self.chat_type {
            ChatType::Direct => format!("{}:dm:{}", self.channel, self.sender_id),
            ChatType::Group => format!("{}:group:{}", self.channel, self.chat_id),
            ChatType::Channel => format!("{}:channel:{}", self.channel, self.chat_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_extraction() {
        assert_eq!(SessionKey::new("agent:ops:telegram:dm:42").agent_id(), Some("ops"));
        assert_eq!(SessionKey::new("cron:nightly").agent_id(), None);
        assert_eq!(SessionKey::new("agent::main").agent_id(), None);
        assert!(SessionKey::new("cron:nightly").is_cron());
        assert!(SessionKey::new("hook:abc").is_webhook());
    }

    #[test]
    fn test_source_label() {
        assert_eq!(MessageSource::direct("telegram", "42").label(), "telegram:dm:42");
        assert_eq!(MessageSource::group("discord", "g1", "7").label(), "discord:group:g1");
    }

    #[test]
    fn test_session_key_serializes_as_string() {
        let key = SessionKey::new("agent:main:main");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"agent:main:main\"");
    }
}
