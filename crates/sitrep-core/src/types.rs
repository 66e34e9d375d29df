use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of an origin channel (its username, without `@`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Editorial class a source channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceClass {
    Arab,
    Smart,
}

impl fmt::Display for SourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceClass::Arab => write!(f, "arab"),
            SourceClass::Smart => write!(f, "smart"),
        }
    }
}

impl std::str::FromStr for SourceClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "arab" => Ok(SourceClass::Arab),
            "smart" => Ok(SourceClass::Smart),
            other => Err(format!("unknown source class: {}", other)),
        }
    }
}

/// Identifier for an extracted event (UUIDv7 — time-sortable for log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a trend cluster (UUIDv7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raw message as delivered by the chat-network listener. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub source_id: SourceId,
    pub source_class: SourceClass,
    /// Platform message ID, unique within the source channel.
    pub message_id: i64,
    pub arrived_at: DateTime<Utc>,
    pub text: String,
    pub reply_to: Option<i64>,
    /// Opaque references to attached media (file IDs, URLs).
    pub media_refs: Vec<String>,
}

/// Reference back to the message(s) an event was extracted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub source_id: SourceId,
    pub message_id: i64,
}

/// Script family guessed from the dominant character class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Arabic,
    Hebrew,
    Latin,
    Other,
}

/// A message after canonicalization. Carries the raw identity plus the
/// normalized text and its content fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub source_id: SourceId,
    pub source_class: SourceClass,
    pub message_id: i64,
    pub arrived_at: DateTime<Utc>,
    pub text_norm: String,
    /// First 160 bits of SHA-256 over `text_norm`, lowercase hex.
    pub hash: String,
    pub lang_guess: Lang,
    /// True when nothing survives normalization; such messages are dropped
    /// by the pipeline before storage.
    pub empty: bool,
    pub reply_to: Option<i64>,
}

/// Category of a structured event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Strike,
    Movement,
    Casualty,
    Claim,
    Statement,
    Other,
}

impl EventKind {
    /// Claims and statements are second-hand reports; they may correlate
    /// with a cluster of any concrete kind.
    pub fn is_report(&self) -> bool {
        matches!(self, EventKind::Claim | EventKind::Statement)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Strike => "strike",
            EventKind::Movement => "movement",
            EventKind::Casualty => "casualty",
            EventKind::Claim => "claim",
            EventKind::Statement => "statement",
            EventKind::Other => "other",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strike" => Ok(EventKind::Strike),
            "movement" => Ok(EventKind::Movement),
            "casualty" => Ok(EventKind::Casualty),
            "claim" => Ok(EventKind::Claim),
            "statement" => Ok(EventKind::Statement),
            "other" => Ok(EventKind::Other),
            unknown => Err(format!("unknown event kind: {}", unknown)),
        }
    }
}

/// A structured event record extracted from one or more messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub message_refs: Vec<MessageRef>,
    pub kind: EventKind,
    pub location: String,
    pub coords: Option<(f64, f64)>,
    pub entities: BTreeSet<String>,
    pub time_hint: Option<DateTime<Utc>>,
    pub summary: String,
    /// Confidence reported by the extractor itself, in [0, 1].
    pub confidence_self: f64,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Distinct sources this event's messages came from.
    pub fn sources(&self) -> BTreeSet<SourceId> {
        self.message_refs
            .iter()
            .map(|r| r.source_id.clone())
            .collect()
    }
}

/// Lifecycle state of a trend cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Open,
    Emitted,
    Superseded,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Open => write!(f, "open"),
            ClusterState::Emitted => write!(f, "emitted"),
            ClusterState::Superseded => write!(f, "superseded"),
        }
    }
}

impl std::str::FromStr for ClusterState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(ClusterState::Open),
            "emitted" => Ok(ClusterState::Emitted),
            "superseded" => Ok(ClusterState::Superseded),
            other => Err(format!("unknown cluster state: {}", other)),
        }
    }
}

/// Initial credibility score for a source never seen before.
pub const INITIAL_AUTHORITY: f64 = 50.0;

/// Per-source credibility record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceAuthority {
    pub source_id: SourceId,
    /// Score in [0, 100]; 50 is the neutral prior.
    pub score: f64,
    pub corroborations: u32,
    pub contradictions: u32,
    pub last_update: DateTime<Utc>,
}

impl SourceAuthority {
    pub fn new(source_id: SourceId, now: DateTime<Utc>) -> Self {
        Self {
            source_id,
            score: INITIAL_AUTHORITY,
            corroborations: 0,
            contradictions: 0,
            last_update: now,
        }
    }
}

/// Intake gate state. `Recovery` is entered when the chat-network session is
/// revoked: the listener stops feeding new messages while the queues drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Active,
    Recovery,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_str() {
        for kind in [
            EventKind::Strike,
            EventKind::Movement,
            EventKind::Casualty,
            EventKind::Claim,
            EventKind::Statement,
            EventKind::Other,
        ] {
            let s = kind.to_string();
            assert_eq!(s.parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn report_kinds_are_claim_and_statement() {
        assert!(EventKind::Claim.is_report());
        assert!(EventKind::Statement.is_report());
        assert!(!EventKind::Strike.is_report());
        assert!(!EventKind::Other.is_report());
    }

    #[test]
    fn event_sources_deduplicates() {
        let ev = Event {
            event_id: EventId::new(),
            message_refs: vec![
                MessageRef {
                    source_id: "alpha".into(),
                    message_id: 1,
                },
                MessageRef {
                    source_id: "alpha".into(),
                    message_id: 2,
                },
                MessageRef {
                    source_id: "beta".into(),
                    message_id: 9,
                },
            ],
            kind: EventKind::Strike,
            location: "gaza".to_string(),
            coords: None,
            entities: BTreeSet::new(),
            time_hint: None,
            summary: String::new(),
            confidence_self: 0.5,
            created_at: chrono::Utc::now(),
        };
        assert_eq!(ev.sources().len(), 2);
    }
}
