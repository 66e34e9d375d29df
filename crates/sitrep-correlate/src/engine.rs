//! The correlation engine.
//!
//! Clusters extracted events into trends. The match step is pure in-memory
//! work and runs to completion between suspension points, so the index is
//! always coherent with respect to event arrival order. Events are taken in
//! extractor-return order; within one source that preserves arrival order.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use sitrep_core::config::CorrelationConfig;
use sitrep_core::counters::{self, Counters};
use sitrep_core::types::{ClusterId, ClusterState, Event, EventKind, SourceId};
use sitrep_store::{Store, StoreError};

use crate::authority::{score_of, AuthoritySnapshot, AuthorityUpdate};
use crate::report::{EmissionReport, SendOrder};

/// Full-location similarity that satisfies the location condition on its own.
const SIMILARITY_MATCH: f64 = 0.88;
/// Similarity strong enough to stand in for entity overlap.
const SIMILARITY_STRONG: f64 = 0.95;
/// Events are binned into 15-minute windows on their reported time.
const TIME_BUCKET_SECS: i64 = 900;
/// A candidate may sit up to this many buckets away from a member.
const BUCKET_SLACK: i64 = 2;

const SPECIFIC_KINDS: [EventKind; 4] = [
    EventKind::Strike,
    EventKind::Movement,
    EventKind::Casualty,
    EventKind::Other,
];

/// Phrases that mark a report as negating an earlier one. Checked against
/// the extractor's summary, lower-cased.
const DENIAL_MARKERS: &[&str] = &[
    "no strike",
    "false alarm",
    "false report",
    "did not occur",
    "did not happen",
    "denies",
    "denied",
    "denial",
    "retracts",
    "retracted",
    "retraction",
    "لا صحة",
    "تكذيب",
    "نفى",
    "ينفي",
    "خبر كاذب",
    "إشاعة",
];

/// A correlated group of events believed to describe one occurrence.
#[derive(Debug)]
struct Cluster {
    cluster_id: ClusterId,
    members: Vec<Event>,
    sources: BTreeSet<SourceId>,
    first_seen: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    state: ClusterState,
    authority_sum: f64,
}

pub struct CorrelationEngine {
    config: CorrelationConfig,
    clusters: HashMap<ClusterId, Cluster>,
    /// Coarse signature → candidate clusters. Recall filter only; the full
    /// match rule decides.
    index: HashMap<(EventKind, String, i64), Vec<ClusterId>>,
    store: Arc<Store>,
    counters: Arc<Counters>,
    authority_rx: watch::Receiver<AuthoritySnapshot>,
    authority_tx: mpsc::Sender<AuthorityUpdate>,
    send_tx: mpsc::Sender<SendOrder>,
    fatal: bool,
}

impl CorrelationEngine {
    pub fn new(
        config: CorrelationConfig,
        store: Arc<Store>,
        counters: Arc<Counters>,
        authority_rx: watch::Receiver<AuthoritySnapshot>,
        authority_tx: mpsc::Sender<AuthorityUpdate>,
        send_tx: mpsc::Sender<SendOrder>,
    ) -> Self {
        Self {
            config,
            clusters: HashMap::new(),
            index: HashMap::new(),
            store,
            counters,
            authority_rx,
            authority_tx,
            send_tx,
            fatal: false,
        }
    }

    /// Main loop: event intake plus a housekeeping tick for fast-track holds
    /// and idle TTLs.
    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<Vec<Event>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("correlation engine started");
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(5));
        tick.tick().await;

        loop {
            if self.fatal {
                error!("store is corrupt; correlation engine stopping");
                break;
            }
            tokio::select! {
                maybe = events_rx.recv() => {
                    match maybe {
                        Some(events) => {
                            for event in events {
                                self.ingest(event, Utc::now()).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => self.housekeeping(Utc::now()).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("correlation engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Route one extracted event: contradiction first, then merge-or-open.
    pub async fn ingest(&mut self, event: Event, now: DateTime<Utc>) {
        if is_denial(&event.summary) {
            if self.supersede_target(&event, now).await {
                return;
            }
            // A denial with nothing to negate is noise, not a trend.
            debug!(summary = %event.summary, "denial without a matching cluster; dropped");
            return;
        }

        match self.best_match(&event) {
            Some(cluster_id) => self.merge(cluster_id, event, now).await,
            None => self.open_cluster(event, now).await,
        }
    }

    /// Fast-track holds, idle TTLs, and memory pruning of settled clusters.
    pub async fn housekeeping(&mut self, now: DateTime<Utc>) {
        let snapshot = self.authority_rx.borrow().clone();

        // Scores drift between events; keep the cached sums honest.
        for cluster in self.clusters.values_mut() {
            if cluster.state == ClusterState::Open {
                cluster.authority_sum = cluster_authority(cluster, &snapshot);
            }
        }

        let mut to_emit: Vec<ClusterId> = Vec::new();
        let mut to_discard: Vec<ClusterId> = Vec::new();
        let mut to_forget: Vec<ClusterId> = Vec::new();

        for (id, cluster) in &self.clusters {
            match cluster.state {
                ClusterState::Open => {
                    let high_authority = cluster
                        .sources
                        .iter()
                        .any(|s| score_of(&snapshot, s) >= self.config.authority_high_threshold);
                    let held = now - cluster.first_seen
                        >= Duration::seconds(self.config.fast_track_hold_secs as i64);
                    let idle = now - cluster.last_updated
                        >= Duration::seconds(self.config.cluster_idle_ttl_secs as i64);

                    if high_authority && held {
                        to_emit.push(id.clone());
                    } else if idle {
                        to_discard.push(id.clone());
                    }
                }
                // Settled clusters stay around only for the retraction
                // lookback, then leave memory (the store keeps them).
                ClusterState::Emitted | ClusterState::Superseded => {
                    if now - cluster.last_updated
                        > Duration::seconds(self.config.retraction_lookback_secs)
                    {
                        to_forget.push(id.clone());
                    }
                }
            }
        }

        for id in to_emit {
            self.emit(&id, now).await;
        }
        for id in to_discard {
            // Closed without emission: single-source events stay in the
            // store for audit but are never published.
            info!(cluster = %id, "idle cluster closed without emission");
            counters::incr(&self.counters.clusters_expired);
            self.remove_cluster(&id);
        }
        for id in to_forget {
            self.remove_cluster(&id);
        }
    }

    // --- matching ----------------------------------------------------------

    fn best_match(&self, event: &Event) -> Option<ClusterId> {
        let token = location_token(&event.location);
        let bucket = event_bucket(event);

        let mut probe_kinds: Vec<EventKind> = vec![event.kind];
        if event.kind.is_report() {
            probe_kinds.extend(SPECIFIC_KINDS);
        } else {
            probe_kinds.extend([EventKind::Claim, EventKind::Statement]);
        }

        let mut seen: HashSet<&ClusterId> = HashSet::new();
        let mut candidates: Vec<&Cluster> = Vec::new();
        for kind in probe_kinds {
            for slack in -BUCKET_SLACK..=BUCKET_SLACK {
                let key = (kind, token.clone(), bucket + slack);
                let Some(ids) = self.index.get(&key) else {
                    continue;
                };
                for id in ids {
                    if let Some(cluster) = self.clusters.get(id) {
                        if cluster.state == ClusterState::Open && seen.insert(id) {
                            candidates.push(cluster);
                        }
                    }
                }
            }
        }

        candidates
            .into_iter()
            .filter(|c| cluster_matches(c, event))
            .max_by(|a, b| {
                a.authority_sum
                    .partial_cmp(&b.authority_sum)
                    .unwrap_or(Ordering::Equal)
                    // ties go to the oldest cluster
                    .then_with(|| b.first_seen.cmp(&a.first_seen))
            })
            .map(|c| c.cluster_id.clone())
    }

    async fn merge(&mut self, cluster_id: ClusterId, event: Event, now: DateTime<Utc>) {
        self.store_op(self.store.assign_cluster(&event.event_id, &cluster_id));
        self.index_event(&cluster_id, &event);

        let snapshot = self.authority_rx.borrow().clone();
        let Some(cluster) = self.clusters.get_mut(&cluster_id) else {
            return;
        };
        cluster.sources.extend(event.sources());
        cluster.members.push(event);
        cluster.last_updated = now;
        cluster.authority_sum = cluster
            .sources
            .iter()
            .map(|s| score_of(&snapshot, s))
            .sum();

        debug!(
            cluster = %cluster_id,
            members = cluster.members.len(),
            sources = cluster.sources.len(),
            "event merged"
        );

        let eligible = cluster.sources.len() >= self.config.min_sources;
        self.store_op(self.store.put_cluster(
            &cluster_id,
            ClusterState::Open,
            self.clusters[&cluster_id].first_seen,
            now,
        ));

        if eligible {
            self.emit(&cluster_id, now).await;
        }
    }

    async fn open_cluster(&mut self, event: Event, now: DateTime<Utc>) {
        let cluster_id = ClusterId::new();
        self.store_op(self.store.put_cluster(&cluster_id, ClusterState::Open, now, now));
        self.store_op(self.store.assign_cluster(&event.event_id, &cluster_id));
        self.index_event(&cluster_id, &event);

        let snapshot = self.authority_rx.borrow().clone();
        let sources = event.sources();
        let authority_sum = sources.iter().map(|s| score_of(&snapshot, s)).sum();
        let eligible = sources.len() >= self.config.min_sources;

        debug!(cluster = %cluster_id, kind = %event.kind, location = %event.location, "cluster opened");
        self.clusters.insert(
            cluster_id.clone(),
            Cluster {
                cluster_id: cluster_id.clone(),
                members: vec![event],
                sources,
                first_seen: now,
                last_updated: now,
                state: ClusterState::Open,
                authority_sum,
            },
        );
        counters::incr(&self.counters.clusters_opened);

        // A single extraction can already carry several sources when the
        // model merged messages inside one batch.
        if eligible {
            self.emit(&cluster_id, now).await;
        }
    }

    // --- transitions -------------------------------------------------------

    async fn emit(&mut self, cluster_id: &ClusterId, now: DateTime<Utc>) {
        let snapshot = self.authority_rx.borrow().clone();
        let Some(cluster) = self.clusters.get_mut(cluster_id) else {
            return;
        };
        if cluster.state != ClusterState::Open {
            return;
        }
        cluster.state = ClusterState::Emitted;
        cluster.last_updated = now;

        let report = build_report(cluster, &snapshot);
        let sources: Vec<SourceId> = cluster.sources.iter().cloned().collect();
        info!(
            cluster = %cluster_id,
            kind = %report.kind,
            sources = sources.len(),
            "cluster emitted"
        );

        self.store_op(self.store.set_cluster_state(cluster_id, ClusterState::Emitted, now));
        counters::incr(&self.counters.clusters_emitted);

        if self
            .authority_tx
            .send(AuthorityUpdate::Corroborated { sources })
            .await
            .is_err()
        {
            warn!("authority channel closed");
        }
        if self.send_tx.send(SendOrder::Summary(report)).await.is_err() {
            warn!("sender channel closed; emission dropped");
        }
    }

    /// Find and supersede the cluster a denial report negates. Returns false
    /// when nothing matches.
    async fn supersede_target(&mut self, event: &Event, now: DateTime<Utc>) -> bool {
        let token = location_token(&event.location);
        let denier = event.sources();

        let target = self
            .clusters
            .values()
            .filter(|c| {
                matches!(c.state, ClusterState::Open | ClusterState::Emitted)
            })
            .filter(|c| {
                c.state == ClusterState::Open
                    || now - c.last_updated
                        <= Duration::seconds(self.config.retraction_lookback_secs)
            })
            .filter(|c| {
                // a source retracting its own report matches regardless of kind
                kinds_compatible(event.kind, c) || denier.iter().any(|s| c.sources.contains(s))
            })
            .filter(|c| {
                c.members
                    .iter()
                    .any(|m| location_token(&m.location) == token)
            })
            .max_by_key(|c| c.last_updated)
            .map(|c| c.cluster_id.clone());

        let Some(cluster_id) = target else {
            return false;
        };
        self.supersede(&cluster_id, now).await;
        true
    }

    async fn supersede(&mut self, cluster_id: &ClusterId, now: DateTime<Utc>) {
        let Some(cluster) = self.clusters.get_mut(cluster_id) else {
            return;
        };
        let was_emitted = cluster.state == ClusterState::Emitted;
        cluster.state = ClusterState::Superseded;
        cluster.last_updated = now;

        let sources: Vec<SourceId> = cluster.sources.iter().cloned().collect();
        let (kind, location) = cluster
            .members
            .first()
            .map(|m| (m.kind, m.location.clone()))
            .unwrap_or((EventKind::Other, String::new()));

        info!(cluster = %cluster_id, was_emitted, "cluster superseded");
        self.store_op(self.store.set_cluster_state(cluster_id, ClusterState::Superseded, now));
        counters::incr(&self.counters.clusters_superseded);

        if self
            .authority_tx
            .send(AuthorityUpdate::Contradicted { sources })
            .await
            .is_err()
        {
            warn!("authority channel closed");
        }

        // Already-published clusters are retracted; never-emitted ones just
        // die quietly.
        if was_emitted {
            let order = SendOrder::Retraction {
                cluster_id: cluster_id.clone(),
                kind,
                location,
            };
            if self.send_tx.send(order).await.is_err() {
                warn!("sender channel closed; retraction dropped");
            }
        }
    }

    // --- bookkeeping -------------------------------------------------------

    fn index_event(&mut self, cluster_id: &ClusterId, event: &Event) {
        let key = (
            event.kind,
            location_token(&event.location),
            event_bucket(event),
        );
        let ids = self.index.entry(key).or_default();
        if !ids.contains(cluster_id) {
            ids.push(cluster_id.clone());
        }
    }

    fn remove_cluster(&mut self, cluster_id: &ClusterId) {
        let Some(cluster) = self.clusters.remove(cluster_id) else {
            return;
        };
        for member in &cluster.members {
            let key = (
                member.kind,
                location_token(&member.location),
                event_bucket(member),
            );
            if let Some(ids) = self.index.get_mut(&key) {
                ids.retain(|id| id != cluster_id);
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn store_op<T>(&mut self, result: Result<T, StoreError>) {
        if let Err(e) = result {
            if e.is_fatal() {
                self.fatal = true;
            }
            error!(error = %e, "cluster store write failed");
        }
    }
}

// --- match rule ------------------------------------------------------------

/// The full match rule; candidates come from the coarse index.
fn cluster_matches(cluster: &Cluster, event: &Event) -> bool {
    // 1. kind compatibility
    if !kinds_compatible(event.kind, cluster) {
        return false;
    }

    // 2. location: shared token, or similar enough full strings
    let token = location_token(&event.location);
    let event_loc = event.location.to_lowercase();
    let mut token_eq = false;
    let mut max_sim: f64 = 0.0;
    for member in &cluster.members {
        if !token.is_empty() && location_token(&member.location) == token {
            token_eq = true;
        }
        max_sim = max_sim.max(strsim::jaro_winkler(&event_loc, &member.location.to_lowercase()));
    }
    if !token_eq && max_sim < SIMILARITY_MATCH {
        return false;
    }

    // 3. time proximity
    let bucket = event_bucket(event);
    let near_in_time = cluster
        .members
        .iter()
        .any(|m| (event_bucket(m) - bucket).abs() <= BUCKET_SLACK);
    if !near_in_time {
        return false;
    }

    // 4. shared actor, or a near-identical location string
    let overlap = cluster
        .members
        .iter()
        .flat_map(|m| m.entities.iter())
        .any(|e| event.entities.contains(e));
    overlap || max_sim >= SIMILARITY_STRONG
}

/// Same kind, or a claim/statement paired with a concrete kind (both
/// directions).
fn kinds_compatible(kind: EventKind, cluster: &Cluster) -> bool {
    let cluster_has_same = cluster.members.iter().any(|m| m.kind == kind);
    let cluster_has_specific = cluster.members.iter().any(|m| !m.kind.is_report());
    let cluster_has_report = cluster.members.iter().any(|m| m.kind.is_report());

    cluster_has_same
        || (kind.is_report() && cluster_has_specific)
        || (!kind.is_report() && cluster_has_report)
}

/// First geocoded token of the location, stripped to the bare placename.
fn location_token(location: &str) -> String {
    location
        .split_whitespace()
        .next()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .unwrap_or_default()
}

/// 15-minute window over the reported time, falling back to ingestion time.
fn event_bucket(event: &Event) -> i64 {
    event
        .time_hint
        .unwrap_or(event.created_at)
        .timestamp()
        .div_euclid(TIME_BUCKET_SECS)
}

fn is_denial(summary: &str) -> bool {
    let lowered = summary.to_lowercase();
    DENIAL_MARKERS.iter().any(|m| lowered.contains(m))
}

fn cluster_authority(cluster: &Cluster, snapshot: &AuthoritySnapshot) -> f64 {
    cluster.sources.iter().map(|s| score_of(snapshot, s)).sum()
}

/// Render the emission view of a cluster. The representative member is the
/// most confident concrete report, falling back to the most confident
/// member overall.
fn build_report(cluster: &Cluster, snapshot: &AuthoritySnapshot) -> EmissionReport {
    let by_confidence = |a: &&Event, b: &&Event| {
        a.confidence_self
            .partial_cmp(&b.confidence_self)
            .unwrap_or(Ordering::Equal)
    };
    let representative = cluster
        .members
        .iter()
        .filter(|m| !m.kind.is_report())
        .max_by(by_confidence)
        .or_else(|| cluster.members.iter().max_by(by_confidence))
        .expect("cluster has at least one member");

    let scores: Vec<f64> = cluster
        .sources
        .iter()
        .map(|s| score_of(snapshot, s))
        .collect();
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = scores.iter().sum::<f64>() / scores.len() as f64;

    EmissionReport {
        cluster_id: cluster.cluster_id.clone(),
        kind: representative.kind,
        location: representative.location.clone(),
        summary: representative.summary.clone(),
        source_ids: cluster.sources.iter().cloned().collect(),
        authority_min: min,
        authority_max: max,
        authority_avg: avg,
        first_seen: cluster.first_seen,
    }
}
