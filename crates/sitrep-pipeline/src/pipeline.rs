//! The batching task.
//!
//! Single caller of the extractor. Batches close on size or on the age of
//! their oldest message; a capacity-1 channel to the extractor keeps at most
//! one batch in flight even when budget would permit more, so events reach
//! correlation in a stable order.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use sitrep_core::config::PipelineConfig;
use sitrep_core::counters::{self, Counters};
use sitrep_core::normalize::normalize;
use sitrep_core::types::{RawMessage, SourceClass};
use sitrep_extract::{Batch, ReleasedBatch};
use sitrep_store::{PutOutcome, Store};

use crate::queue::PendingQueue;

/// A failed batch waiting out its backoff before re-entering the queue.
struct DeferredBatch {
    batch: Batch,
    ready_at: Instant,
}

pub struct Pipeline {
    config: PipelineConfig,
    signature_patterns: Vec<String>,
    store: Arc<Store>,
    counters: Arc<Counters>,
    arab: PendingQueue,
    smart: PendingQueue,
    deferred: Vec<DeferredBatch>,
    fatal: bool,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        signature_patterns: Vec<String>,
        store: Arc<Store>,
        counters: Arc<Counters>,
    ) -> Self {
        let capacity = config.queue_capacity;
        Self {
            config,
            signature_patterns,
            store,
            counters,
            arab: PendingQueue::new(capacity),
            smart: PendingQueue::new(capacity),
            deferred: Vec::new(),
            fatal: false,
        }
    }

    /// Main loop: intake, batch triggers on a 1 s tick, released-batch
    /// re-admission. On shutdown the remaining queue content is flushed,
    /// bounded to 60 s.
    pub async fn run(
        mut self,
        mut ingest_rx: mpsc::Receiver<RawMessage>,
        batch_tx: mpsc::Sender<Batch>,
        mut release_rx: mpsc::Receiver<ReleasedBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("pipeline started");
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        tick.tick().await;
        let mut release_closed = false;

        loop {
            if self.fatal {
                error!("store is corrupt; pipeline stopping");
                return;
            }
            tokio::select! {
                maybe = ingest_rx.recv() => {
                    match maybe {
                        Some(raw) => self.intake(raw),
                        None => break,
                    }
                }
                maybe = release_rx.recv(), if !release_closed => {
                    match maybe {
                        Some(released) => self.defer(released),
                        None => release_closed = true,
                    }
                }
                _ = tick.tick() => {
                    self.flush_due(&batch_tx, Utc::now(), Instant::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("pipeline shutting down, flushing pending messages");
        self.flush_all(&batch_tx).await;
    }

    /// Normalize, drop empties, dedup against the store, enqueue.
    pub fn intake(&mut self, raw: RawMessage) {
        counters::incr(&self.counters.ingested);
        let normalized = normalize(&raw, &self.signature_patterns);

        if normalized.empty {
            counters::incr(&self.counters.empty_dropped);
            debug!(source = %normalized.source_id, message_id = normalized.message_id,
                "empty after normalization; dropped");
            return;
        }

        match self
            .store
            .put_message(&normalized, self.config.dedup_window_secs)
        {
            Ok(PutOutcome::New) => {}
            Ok(PutOutcome::Dup) => {
                counters::incr(&self.counters.duplicates);
                return;
            }
            Err(e) => {
                if e.is_fatal() {
                    self.fatal = true;
                }
                // not durably recorded — better to drop than to double-extract
                warn!(error = %e, "message not persisted; dropped");
                return;
            }
        }

        let class = normalized.source_class;
        let dropped = self.queue_mut(class).push(normalized);
        if dropped > 0 {
            counters::add(&self.counters.dropped_ingress, dropped as u64);
            warn!(class = %class, dropped, "ingress queue overflow, oldest dropped");
        }
    }

    fn defer(&mut self, released: ReleasedBatch) {
        debug!(
            class = %released.batch.class,
            size = released.batch.messages.len(),
            delay_secs = released.retry_delay.as_secs(),
            "batch released by extractor; deferred"
        );
        self.deferred.push(DeferredBatch {
            ready_at: Instant::now() + released.retry_delay,
            batch: released.batch,
        });
    }

    /// Hand work to the extractor when a trigger fires and the in-flight
    /// slot is free. Never blocks: if the extractor is busy, messages keep
    /// accumulating locally where overflow policy applies.
    pub async fn flush_due(
        &mut self,
        batch_tx: &mpsc::Sender<Batch>,
        now: DateTime<Utc>,
        now_mono: Instant,
    ) {
        // Deferred batches re-enter first, in the order they were released.
        while batch_tx.capacity() > 0 {
            let Some(pos) = self
                .deferred
                .iter()
                .position(|d| d.ready_at <= now_mono)
            else {
                break;
            };
            let deferred = self.deferred.remove(pos);
            if batch_tx.send(deferred.batch).await.is_err() {
                warn!("extractor channel closed");
                return;
            }
        }

        for class in [SourceClass::Arab, SourceClass::Smart] {
            while batch_tx.capacity() > 0 {
                let batch_size = self.config.batch_size;
                let max_age = self.config.max_batch_age_secs as i64;
                let queue = self.queue_mut(class);

                let size_trigger = queue.len() >= batch_size;
                let age_trigger = !queue.is_empty()
                    && queue.oldest_age_secs(now).is_some_and(|age| age > max_age);
                if !size_trigger && !age_trigger {
                    break;
                }

                let messages = queue.take_batch(batch_size);
                debug!(class = %class, size = messages.len(), size_trigger, "batch formed");
                let batch = Batch {
                    class,
                    messages,
                    release_attempts: 0,
                };
                if batch_tx.send(batch).await.is_err() {
                    warn!("extractor channel closed");
                    return;
                }
            }
        }
    }

    /// Shutdown drain: push everything still pending to the extractor,
    /// giving up after 60 s.
    async fn flush_all(&mut self, batch_tx: &mpsc::Sender<Batch>) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(60);
        for class in [SourceClass::Arab, SourceClass::Smart] {
            loop {
                let batch_size = self.config.batch_size;
                let queue = self.queue_mut(class);
                if queue.is_empty() {
                    break;
                }
                let messages = queue.take_batch(batch_size);
                let batch = Batch {
                    class,
                    messages,
                    release_attempts: 0,
                };
                match tokio::time::timeout_at(deadline, batch_tx.send(batch)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return,
                    Err(_) => {
                        warn!(class = %class, "flush deadline reached; remaining messages dropped");
                        return;
                    }
                }
            }
        }
    }

    fn queue_mut(&mut self, class: SourceClass) -> &mut PendingQueue {
        match class {
            SourceClass::Arab => &mut self.arab,
            SourceClass::Smart => &mut self.smart,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn raw(source: &str, class: SourceClass, id: i64, text: &str, at: DateTime<Utc>) -> RawMessage {
        RawMessage {
            source_id: source.into(),
            source_class: class,
            message_id: id,
            arrived_at: at,
            text: text.to_string(),
            reply_to: None,
            media_refs: Vec::new(),
        }
    }

    fn pipeline(dir: &TempDir) -> Pipeline {
        let store = Arc::new(Store::open(&dir.path().join("t.db")).unwrap());
        Pipeline::new(
            PipelineConfig::default(),
            Vec::new(),
            store,
            Arc::new(Counters::default()),
        )
    }

    #[tokio::test]
    async fn size_trigger_forms_full_batch() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        let now = Utc::now();
        for id in 0..24 {
            p.intake(raw("alpha", SourceClass::Arab, id, &format!("report {}", id), now));
        }
        assert_eq!(p.arab.len(), 24);

        let (tx, mut rx) = mpsc::channel(1);
        p.flush_due(&tx, now, Instant::now()).await;
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.messages.len(), 24);
        assert_eq!(batch.class, SourceClass::Arab);
        assert!(p.arab.is_empty());
    }

    #[tokio::test]
    async fn age_trigger_flushes_partial_batch() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        let old = Utc::now() - chrono::Duration::seconds(301);
        for id in 0..3 {
            p.intake(raw("alpha", SourceClass::Arab, id, &format!("report {}", id), old));
        }

        let (tx, mut rx) = mpsc::channel(1);
        p.flush_due(&tx, Utc::now(), Instant::now()).await;
        assert_eq!(rx.try_recv().unwrap().messages.len(), 3);
    }

    #[tokio::test]
    async fn fresh_small_backlog_stays_queued() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        let now = Utc::now();
        for id in 0..3 {
            p.intake(raw("alpha", SourceClass::Arab, id, &format!("report {}", id), now));
        }
        let (tx, mut rx) = mpsc::channel(1);
        p.flush_due(&tx, now, Instant::now()).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(p.arab.len(), 3);
    }

    #[tokio::test]
    async fn duplicates_and_empties_never_reach_the_queue() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        let now = Utc::now();
        p.intake(raw("alpha", SourceClass::Arab, 1, "انفجار في غزة اليوم", now));
        // equivalent content, new message id
        p.intake(raw("alpha", SourceClass::Arab, 2, "انفجارٌ في غزّة اليوم!!", now));
        // empty after normalization
        p.intake(raw("alpha", SourceClass::Arab, 3, " !!! ", now));
        assert_eq!(p.arab.len(), 1);
        let snap = p.counters.snapshot();
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.empty_dropped, 1);
    }

    #[tokio::test]
    async fn classes_batch_independently() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        let old = Utc::now() - chrono::Duration::seconds(301);
        p.intake(raw("alpha", SourceClass::Arab, 1, "arab report", old));
        p.intake(raw("beta", SourceClass::Smart, 2, "smart report", old));

        let (tx, mut rx) = mpsc::channel(2);
        p.flush_due(&tx, Utc::now(), Instant::now()).await;
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_ne!(first.class, second.class);
        assert_eq!(first.messages.len(), 1);
        assert_eq!(second.messages.len(), 1);
    }

    #[tokio::test]
    async fn busy_extractor_defers_batch_locally() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        let old = Utc::now() - chrono::Duration::seconds(301);
        for id in 0..30 {
            p.intake(raw("alpha", SourceClass::Arab, id, &format!("report {}", id), old));
        }

        let (tx, mut rx) = mpsc::channel(1);
        p.flush_due(&tx, Utc::now(), Instant::now()).await;
        // one batch fills the in-flight slot; the rest stays local
        assert_eq!(rx.try_recv().unwrap().messages.len(), 24);
        assert!(rx.try_recv().is_err());
        assert_eq!(p.arab.len(), 6);
    }

    #[tokio::test]
    async fn released_batch_waits_out_its_backoff() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        let now = Utc::now();
        p.intake(raw("alpha", SourceClass::Arab, 1, "failed once", now));
        let messages = p.arab.take_batch(1);
        p.defer(ReleasedBatch {
            batch: Batch {
                class: SourceClass::Arab,
                messages,
                release_attempts: 1,
            },
            retry_delay: std::time::Duration::from_secs(30),
        });

        let (tx, mut rx) = mpsc::channel(1);
        let start = Instant::now();
        p.flush_due(&tx, now, start).await;
        assert!(rx.try_recv().is_err(), "backoff not elapsed");

        p.flush_due(&tx, now, start + std::time::Duration::from_secs(31)).await;
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.release_attempts, 1);
    }

    #[tokio::test]
    async fn overflow_counts_dropped_ingress() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        let now = Utc::now();
        for id in 0..1000 {
            p.intake(raw(
                "alpha",
                SourceClass::Arab,
                id,
                &format!("unique report number {}", id),
                now,
            ));
        }
        assert_eq!(p.arab.len(), 512);
        assert_eq!(p.counters.snapshot().dropped_ingress, 488);
    }
}
