//! Wire payloads for the bacon namespace
//!
//! Outgoing traffic is wrapped in an [`Envelope`]. Incoming presence and signal
//! payloads are loosely typed on the wire, so they are classified into
//! [`PresenceFrame`] variants and resolved field by field in a fixed order:
//! nested `meta` first, then the flat top-level key.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Schema version stamped into presence announcements as `v`.
pub const PRESENCE_SCHEMA_VERSION: &str = "1.2";

/// Fallback for free-text attributes nobody reported.
pub const UNKNOWN: &str = "unknown";

/// Errors raised while interpreting payloads
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Envelope placed around every payload published through the transport client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub content: Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, content: Value, source: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            content,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Decode an inbound payload: JSON when it parses, otherwise the raw text.
pub fn decode_payload(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Canonical text form for timestamps stored or compared as strings.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an ISO-8601 timestamp. Naive timestamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Shape of an inbound presence payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PresenceFrame<'a> {
    /// Presence fields at the top level, as published by agents directly
    Bare(&'a Map<String, Value>),
    /// Presence fields inside `content`, as published through an [`Envelope`]
    Enveloped(&'a Map<String, Value>),
}

impl<'a> PresenceFrame<'a> {
    pub fn classify(payload: &'a Value) -> Result<Self, ProtocolError> {
        let object = payload.as_object().ok_or(ProtocolError::NotAnObject)?;
        if object.contains_key("agent_id") {
            return Ok(PresenceFrame::Bare(object));
        }
        match object.get("content") {
            Some(Value::Object(inner)) => Ok(PresenceFrame::Enveloped(inner)),
            _ => Ok(PresenceFrame::Bare(object)),
        }
    }

    pub fn fields(&self) -> &'a Map<String, Value> {
        match self {
            PresenceFrame::Bare(fields) | PresenceFrame::Enveloped(fields) => fields,
        }
    }
}

/// A presence event after field resolution
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub agent_id: String,
    pub node_id: String,
    pub parent_id: Option<String>,
    pub state: String,
    pub seen_at: DateTime<Utc>,
    pub operator: Option<String>,
    pub version: Option<String>,
    pub role: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub capabilities: Vec<String>,
}

impl PresenceEvent {
    /// Resolve a decoded presence payload.
    ///
    /// `agent_id` and `node_id` are required. A missing `ts` means "now"; a
    /// `ts` that is present but unparseable makes the event malformed.
    pub fn from_payload(payload: &Value) -> Result<Self, ProtocolError> {
        let fields = PresenceFrame::classify(payload)?.fields();

        let agent_id = required_text(fields, "agent_id")?;
        let node_id = required_text(fields, "node_id")?;

        Ok(Self {
            agent_id,
            node_id,
            parent_id: resolve_text(fields, &[&["parent_id"]]),
            state: resolve_text(fields, &[&["state"], &["status"]])
                .unwrap_or_else(|| UNKNOWN.to_string()),
            seen_at: resolve_seen_at(fields)?,
            operator: resolve_text(fields, &[&["meta", "operator"], &["operator"]]),
            version: resolve_text(fields, &[&["meta", "version"], &["version"], &["v"]]),
            role: resolve_text(fields, &[&["meta", "role"], &["role"]]),
            hostname: resolve_text(fields, &[&["meta", "hostname"], &["hostname"]]),
            os: resolve_text(fields, &[&["meta", "os"], &["os"]]),
            capabilities: resolve_capabilities(fields),
        })
    }
}

/// Sender and target resolved from an observed signal
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    pub sender: String,
    pub target: String,
    pub signal_type: Option<String>,
}

impl SignalEvent {
    /// Sender comes from the envelope `source`, then `content.requester`,
    /// then `content.source`, then a flat `requester`. Target is the trailing
    /// topic segment.
    pub fn resolve(topic: &str, payload: &Value) -> Self {
        let target = crate::protocol::topics::trailing_segment(topic)
            .unwrap_or(UNKNOWN)
            .to_string();

        let Some(fields) = payload.as_object() else {
            return Self {
                sender: UNKNOWN.to_string(),
                target,
                signal_type: None,
            };
        };

        let sender = resolve_text(
            fields,
            &[
                &["source"],
                &["content", "requester"],
                &["content", "source"],
                &["requester"],
            ],
        )
        .unwrap_or_else(|| UNKNOWN.to_string());

        Self {
            sender,
            target,
            signal_type: resolve_text(fields, &[&["type"], &["content", "type"]]),
        }
    }
}

/// Body of a signal dispatched by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    #[serde(rename = "type")]
    pub signal_type: String,
    pub requester: String,
    pub priority: String,
    pub reason: Option<String>,
    pub ts: DateTime<Utc>,
}

impl SignalRequest {
    pub fn new(
        signal_type: impl Into<String>,
        requester: impl Into<String>,
        priority: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            signal_type: signal_type.into(),
            requester: requester.into(),
            priority: priority.into(),
            reason,
            ts: Utc::now(),
        }
    }
}

/// Metadata block of a presence announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PresenceMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

/// Bare presence payload published by `announce`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    pub v: String,
    pub agent_id: String,
    pub node_id: String,
    pub parent_id: Option<String>,
    pub ts: DateTime<Utc>,
    pub state: String,
    pub meta: PresenceMeta,
    pub capabilities: Vec<String>,
}

impl PresenceAnnouncement {
    pub fn new(agent_id: impl Into<String>, node_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            v: PRESENCE_SCHEMA_VERSION.to_string(),
            agent_id: agent_id.into(),
            node_id: node_id.into(),
            parent_id: None,
            ts: Utc::now(),
            state: state.into(),
            meta: PresenceMeta::default(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_meta(mut self, meta: PresenceMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Same announcement stamped with the current time
    pub fn refreshed(&self) -> Self {
        Self {
            ts: Utc::now(),
            ..self.clone()
        }
    }
}

fn lookup<'a>(fields: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(fields.get(*first)?, |value, key| value.as_object()?.get(*key))
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_text(fields: &Map<String, Value>, candidates: &[&[&str]]) -> Option<String> {
    candidates
        .iter()
        .find_map(|path| lookup(fields, path).and_then(as_text))
}

fn required_text(fields: &Map<String, Value>, field: &'static str) -> Result<String, ProtocolError> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(ProtocolError::MissingField(field)),
        Some(value) => as_text(value).ok_or_else(|| ProtocolError::InvalidField {
            field,
            reason: format!("expected a non-empty string, got {value}"),
        }),
    }
}

fn resolve_seen_at(fields: &Map<String, Value>) -> Result<DateTime<Utc>, ProtocolError> {
    let raw = lookup(fields, &["ts"]).or_else(|| lookup(fields, &["timestamp"]));
    match raw {
        None | Some(Value::Null) => Ok(Utc::now()),
        Some(Value::String(s)) => parse_timestamp(s).ok_or_else(|| ProtocolError::InvalidField {
            field: "ts",
            reason: format!("unparseable timestamp '{s}'"),
        }),
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| {
                let whole = secs.trunc() as i64;
                let nanos = ((secs - secs.trunc()) * 1e9) as u32;
                Utc.timestamp_opt(whole, nanos).single()
            })
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "ts",
                reason: format!("epoch value {n} out of range"),
            }),
        Some(other) => Err(ProtocolError::InvalidField {
            field: "ts",
            reason: format!("unsupported timestamp {other}"),
        }),
    }
}

fn resolve_capabilities(fields: &Map<String, Value>) -> Vec<String> {
    [&["capabilities"][..], &["meta", "capabilities"][..]]
        .iter()
        .find_map(|path| lookup(fields, path).and_then(Value::as_array))
        .map(|items| items.iter().filter_map(as_text).collect())
        .unwrap_or_default()
}
