//! Topic namespace for the bacon presence-and-wake layer
//!
//! Every topic lives under `bacon/v1/<kind>/...`. The kind segment is what lets
//! consumers subscribe with wildcards without looking inside payloads.

use std::fmt;
use thiserror::Error;

/// Fixed namespace prefix shared by every deployment.
pub const NAMESPACE: &str = "bacon";

/// Protocol version segment.
pub const VERSION: &str = "v1";

/// Logical channel carried in the third topic segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Data,
    Presence,
    Signal,
    /// Free-form kinds such as `progress` or `inbox`
    Other(String),
}

impl ChannelKind {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "data" => ChannelKind::Data,
            "presence" => ChannelKind::Presence,
            "signal" => ChannelKind::Signal,
            other => ChannelKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChannelKind::Data => "data",
            ChannelKind::Presence => "presence",
            ChannelKind::Signal => "signal",
            ChannelKind::Other(kind) => kind,
        }
    }

    /// Classify a concrete topic by its kind segment.
    /// Returns `None` for topics outside the `bacon/v1` namespace.
    pub fn from_topic(topic: &str) -> Option<Self> {
        let mut segments = topic.split('/');
        match (segments.next(), segments.next(), segments.next()) {
            (Some(NAMESPACE), Some(VERSION), Some(kind)) if !kind.is_empty() => {
                Some(Self::parse(kind))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topic construction for the `bacon/v1` namespace
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build the topic for a (target, kind) pair.
    ///
    /// Presence is addressed per agent (`bacon/v1/presence/agent/<target>`);
    /// every other kind uses `bacon/v1/<kind>/<target>`.
    pub fn topic(target: &str, kind: &ChannelKind) -> String {
        match kind {
            ChannelKind::Presence => Self::presence(target),
            other => format!("{NAMESPACE}/{VERSION}/{}/{target}", other.as_str()),
        }
    }

    /// `bacon/v1/presence/agent/<agent_id>`
    pub fn presence(agent_id: &str) -> String {
        format!("{NAMESPACE}/{VERSION}/presence/agent/{agent_id}")
    }

    /// Direct-addressed signal topic: `bacon/v1/signal/agent/<target_id>`
    pub fn agent_signal(target_id: &str) -> String {
        format!("{NAMESPACE}/{VERSION}/signal/agent/{target_id}")
    }

    /// Keepalive progress topic for a waiting node.
    pub fn progress(node_id: &str) -> String {
        Self::topic(node_id, &ChannelKind::Other("progress".to_string()))
    }

    /// Wildcard covering every agent's presence topic.
    pub fn presence_pattern() -> String {
        Self::presence("+")
    }

    /// Wildcard covering every direct-addressed signal topic.
    pub fn signal_pattern() -> String {
        Self::agent_signal("+")
    }

    /// Wildcard covering the whole namespace.
    pub fn namespace_pattern() -> String {
        format!("{NAMESPACE}/{VERSION}/#")
    }
}

/// Normalize a hostname into a topic-safe default target.
pub fn normalize_hostname(raw: &str) -> String {
    raw.trim().to_lowercase().replace('.', "-")
}

/// This machine's hostname, normalized. Falls back to `localhost`.
pub fn local_hostname() -> String {
    let raw = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    normalize_hostname(&raw)
}

/// Last path segment of a topic, or `None` when it is empty.
pub fn trailing_segment(topic: &str) -> Option<&str> {
    topic.rsplit('/').next().filter(|segment| !segment.is_empty())
}

/// MQTT topic-filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn validate_agent_id(agent_id: &str) -> Result<(), ValidationError> {
    if agent_id.is_empty() {
        return Err(ValidationError::EmptyAgentId);
    }

    for ch in agent_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidAgentIdChar(ch));
        }
    }

    Ok(())
}

/// Identifier validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,
    #[error("Agent ID contains invalid character: '{0}'")]
    InvalidAgentIdChar(char),
}
