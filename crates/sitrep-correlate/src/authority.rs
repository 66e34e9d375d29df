//! The authority ledger.
//!
//! Per-source credibility scores in [0, 100], neutral prior 50. The ledger
//! is the only cross-task mutable structure in the process; it runs as a
//! single-writer task fed by the correlation engine, and publishes an
//! `Arc` snapshot through a `watch` channel after every change so readers
//! never take a lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use sitrep_core::config::CorrelationConfig;
use sitrep_core::types::{SourceAuthority, SourceId};
use sitrep_store::Store;

/// Published score snapshot. Sources never seen score the neutral prior.
pub type AuthoritySnapshot = Arc<HashMap<SourceId, f64>>;

/// Score at the neutral prior for unknown sources.
pub fn score_of(snapshot: &AuthoritySnapshot, source: &SourceId) -> f64 {
    snapshot
        .get(source)
        .copied()
        .unwrap_or(sitrep_core::types::INITIAL_AUTHORITY)
}

/// Ledger mutations, sent by the correlation engine on cluster transitions.
#[derive(Debug, Clone)]
pub enum AuthorityUpdate {
    /// Cluster went Open → Emitted with these member sources.
    Corroborated { sources: Vec<SourceId> },
    /// Cluster was superseded; these sources backed it.
    Contradicted { sources: Vec<SourceId> },
}

pub struct AuthorityLedger {
    entries: HashMap<SourceId, SourceAuthority>,
    config: CorrelationConfig,
    store: Arc<Store>,
    snapshot_tx: watch::Sender<AuthoritySnapshot>,
}

impl AuthorityLedger {
    /// Build the ledger, warming the cache from the store so scores survive
    /// restarts. Returns the snapshot receiver for engine and control-bot
    /// reads.
    pub fn new(
        config: CorrelationConfig,
        store: Arc<Store>,
    ) -> sitrep_store::Result<(Self, watch::Receiver<AuthoritySnapshot>)> {
        let entries: HashMap<SourceId, SourceAuthority> = store
            .read_all_authority()?
            .into_iter()
            .map(|a| (a.source_id.clone(), a))
            .collect();
        info!(sources = entries.len(), "authority ledger loaded");

        let (snapshot_tx, snapshot_rx) = watch::channel(build_snapshot(&entries));
        Ok((
            Self {
                entries,
                config,
                store,
                snapshot_tx,
            },
            snapshot_rx,
        ))
    }

    /// Single-writer loop: apply updates from correlation, decay idle
    /// sources every 15 minutes.
    pub async fn run(
        mut self,
        mut update_rx: mpsc::Receiver<AuthorityUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut decay_tick =
            tokio::time::interval(std::time::Duration::from_secs(15 * 60));
        // the first tick fires immediately; skip it
        decay_tick.tick().await;

        loop {
            tokio::select! {
                maybe = update_rx.recv() => {
                    match maybe {
                        Some(update) => self.apply(update, Utc::now()),
                        None => break,
                    }
                }
                _ = decay_tick.tick() => {
                    self.decay(Utc::now(), 15.0 * 60.0);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("authority ledger shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Apply one update and publish a fresh snapshot.
    pub fn apply(&mut self, update: AuthorityUpdate, now: DateTime<Utc>) {
        match update {
            AuthorityUpdate::Corroborated { sources } => self.corroborate(&sources, now),
            AuthorityUpdate::Contradicted { sources } => self.contradict(&sources, now),
        }
        self.publish();
    }

    /// Corroboration boost: each source gains `α · (|S|−1) / |S|`. A
    /// single-source (fast-track) emission moves no score and counts no
    /// corroboration.
    fn corroborate(&mut self, sources: &[SourceId], now: DateTime<Utc>) {
        let n = sources.len();
        if n == 0 {
            return;
        }
        let boost = self.config.corroboration_alpha * (n as f64 - 1.0) / n as f64;
        let confirmed = n >= self.config.min_sources;

        for source in sources {
            let entry = self.entry(source, now);
            entry.score = clip(entry.score + boost);
            if confirmed {
                entry.corroborations += 1;
            }
            entry.last_update = now;
            debug!(source = %source, score = entry.score, "corroborated");
            self.persist(source);
        }
    }

    /// Contradiction penalty: `β · score / 50` — expensive for sources that
    /// had built up credibility.
    fn contradict(&mut self, sources: &[SourceId], now: DateTime<Utc>) {
        for source in sources {
            let beta = self.config.contradiction_beta;
            let entry = self.entry(source, now);
            entry.score = clip(entry.score - beta * entry.score / 50.0);
            entry.contradictions += 1;
            entry.last_update = now;
            warn!(source = %source, score = entry.score, "contradicted");
            self.persist(source);
        }
    }

    /// Drift every score toward the neutral prior by `γ` per idle day.
    /// `elapsed_secs` is the time covered by this tick.
    pub fn decay(&mut self, now: DateTime<Utc>, elapsed_secs: f64) {
        let step = self.config.decay_gamma_per_day * elapsed_secs / 86_400.0;
        if step <= 0.0 {
            return;
        }

        let mut changed: Vec<SourceId> = Vec::new();
        for (source, entry) in self.entries.iter_mut() {
            let gap = sitrep_core::types::INITIAL_AUTHORITY - entry.score;
            if gap.abs() < f64::EPSILON {
                continue;
            }
            entry.score += gap.clamp(-step, step);
            changed.push(source.clone());
        }
        for source in &changed {
            self.persist(source);
        }
        if !changed.is_empty() {
            debug!(sources = changed.len(), at = %now, "authority decay applied");
            self.publish();
        }
    }

    pub fn snapshot(&self) -> AuthoritySnapshot {
        build_snapshot(&self.entries)
    }

    fn entry(&mut self, source: &SourceId, now: DateTime<Utc>) -> &mut SourceAuthority {
        self.entries
            .entry(source.clone())
            .or_insert_with(|| SourceAuthority::new(source.clone(), now))
    }

    fn persist(&self, source: &SourceId) {
        if let Some(entry) = self.entries.get(source) {
            if let Err(e) = self.store.upsert_authority(entry) {
                error!(source = %source, error = %e, "authority write failed");
            }
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(build_snapshot(&self.entries));
    }
}

fn build_snapshot(entries: &HashMap<SourceId, SourceAuthority>) -> AuthoritySnapshot {
    Arc::new(
        entries
            .iter()
            .map(|(id, a)| (id.clone(), a.score))
            .collect(),
    )
}

fn clip(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}
