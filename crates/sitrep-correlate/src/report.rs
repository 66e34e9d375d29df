use chrono::{DateTime, Utc};

use sitrep_core::types::{ClusterId, EventKind, SourceId};

/// Everything the sender needs to render one cluster summary. Authority
/// figures are captured at emission time — the sender never reads the ledger.
#[derive(Debug, Clone)]
pub struct EmissionReport {
    pub cluster_id: ClusterId,
    pub kind: EventKind,
    pub location: String,
    pub summary: String,
    /// Distinct reporting sources, sorted for stable output.
    pub source_ids: Vec<SourceId>,
    pub authority_min: f64,
    pub authority_max: f64,
    pub authority_avg: f64,
    pub first_seen: DateTime<Utc>,
}

/// Work order for the sender task.
#[derive(Debug, Clone)]
pub enum SendOrder {
    /// Rate-gated cluster summary.
    Summary(EmissionReport),
    /// Retraction of an already-emitted cluster; bypasses the rate gate.
    Retraction {
        cluster_id: ClusterId,
        kind: EventKind,
        location: String,
    },
}
