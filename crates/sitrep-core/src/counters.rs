//! Process-wide runtime counters, surfaced by the control bot's `/status`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters. Every field is monotonic; increments use relaxed
/// ordering since the values are advisory.
#[derive(Debug, Default)]
pub struct Counters {
    pub ingested: AtomicU64,
    pub dropped_ingress: AtomicU64,
    pub duplicates: AtomicU64,
    pub empty_dropped: AtomicU64,
    pub batches_extracted: AtomicU64,
    pub extract_failures: AtomicU64,
    pub events_extracted: AtomicU64,
    pub clusters_opened: AtomicU64,
    pub clusters_emitted: AtomicU64,
    pub clusters_superseded: AtomicU64,
    pub clusters_expired: AtomicU64,
    pub summaries_sent: AtomicU64,
    pub retractions_sent: AtomicU64,
}

/// Point-in-time copy for rendering and tests.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub ingested: u64,
    pub dropped_ingress: u64,
    pub duplicates: u64,
    pub empty_dropped: u64,
    pub batches_extracted: u64,
    pub extract_failures: u64,
    pub events_extracted: u64,
    pub clusters_opened: u64,
    pub clusters_emitted: u64,
    pub clusters_superseded: u64,
    pub clusters_expired: u64,
    pub summaries_sent: u64,
    pub retractions_sent: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            ingested: self.ingested.load(Ordering::Relaxed),
            dropped_ingress: self.dropped_ingress.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            empty_dropped: self.empty_dropped.load(Ordering::Relaxed),
            batches_extracted: self.batches_extracted.load(Ordering::Relaxed),
            extract_failures: self.extract_failures.load(Ordering::Relaxed),
            events_extracted: self.events_extracted.load(Ordering::Relaxed),
            clusters_opened: self.clusters_opened.load(Ordering::Relaxed),
            clusters_emitted: self.clusters_emitted.load(Ordering::Relaxed),
            clusters_superseded: self.clusters_superseded.load(Ordering::Relaxed),
            clusters_expired: self.clusters_expired.load(Ordering::Relaxed),
            summaries_sent: self.summaries_sent.load(Ordering::Relaxed),
            retractions_sent: self.retractions_sent.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one.
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bump a counter by `n`.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let counters = Counters::default();
        incr(&counters.ingested);
        incr(&counters.ingested);
        add(&counters.dropped_ingress, 488);
        let snap = counters.snapshot();
        assert_eq!(snap.ingested, 2);
        assert_eq!(snap.dropped_ingress, 488);
        assert_eq!(snap.duplicates, 0);
    }
}
