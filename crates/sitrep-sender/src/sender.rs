//! The sender task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use sitrep_core::config::SenderConfig;
use sitrep_core::counters::{self, Counters};
use sitrep_correlate::{EmissionReport, SendOrder};
use sitrep_store::Store;

use crate::format::{render_retraction, render_summary};
use crate::gate::RateGate;

/// Bounded delivery attempts per message.
const MAX_SEND_ATTEMPTS: u32 = 5;
const SEND_BACKOFF_BASE: Duration = Duration::from_secs(2);
const SEND_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Shutdown drain budget.
const DRAIN_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Delivery endpoint for rendered output messages (the chat network in
/// production, a recorder in tests).
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<(), SinkError>;
}

pub struct Sender {
    config: SenderConfig,
    sink: Arc<dyn OutboundSink>,
    store: Arc<Store>,
    counters: Arc<Counters>,
    gate: RateGate,
    /// Eligible summaries waiting on the gate, oldest first.
    queue: VecDeque<EmissionReport>,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        sink: Arc<dyn OutboundSink>,
        store: Arc<Store>,
        counters: Arc<Counters>,
    ) -> Self {
        let gate = RateGate::new(Duration::from_secs(config.summary_min_interval_secs));
        Self {
            config,
            sink,
            store,
            counters,
            gate,
            queue: VecDeque::new(),
        }
    }

    /// Main loop: queue summaries behind the gate, deliver retractions at
    /// once, drain on shutdown (bounded).
    pub async fn run(mut self, mut order_rx: mpsc::Receiver<SendOrder>, mut shutdown: watch::Receiver<bool>) {
        info!("sender started");
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.tick().await;

        loop {
            tokio::select! {
                maybe = order_rx.recv() => {
                    match maybe {
                        Some(SendOrder::Summary(report)) => {
                            debug!(cluster = %report.cluster_id, queued = self.queue.len(), "summary queued");
                            self.queue.push_back(report);
                        }
                        Some(SendOrder::Retraction { cluster_id, kind, location }) => {
                            self.send_retraction(&cluster_id, kind, &location).await;
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => self.pump(Instant::now()).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Emit the oldest queued summary if the gate is open.
    pub async fn pump(&mut self, now: Instant) {
        if self.queue.is_empty() || !self.gate.ready_in(now).is_zero() {
            return;
        }
        if let Some(report) = self.queue.pop_front() {
            if self.send_summary(&report).await {
                self.gate.mark(now);
            }
        }
    }

    async fn send_summary(&self, report: &EmissionReport) -> bool {
        let text = render_summary(report);
        if !self.deliver_with_retries(&text).await {
            error!(cluster = %report.cluster_id, "summary delivery failed after retries; dropped");
            return false;
        }
        if let Err(e) = self
            .store
            .record_emission(&report.cluster_id, "summary", Utc::now())
        {
            warn!(error = %e, "emission not logged");
        }
        counters::incr(&self.counters.summaries_sent);
        info!(cluster = %report.cluster_id, sources = report.source_ids.len(), "summary emitted");
        true
    }

    async fn send_retraction(
        &self,
        cluster_id: &sitrep_core::types::ClusterId,
        kind: sitrep_core::types::EventKind,
        location: &str,
    ) {
        let text = render_retraction(cluster_id, kind, location);
        if !self.deliver_with_retries(&text).await {
            error!(cluster = %cluster_id, "retraction delivery failed after retries");
            return;
        }
        if let Err(e) = self.store.record_emission(cluster_id, "retraction", Utc::now()) {
            warn!(error = %e, "retraction not logged");
        }
        counters::incr(&self.counters.retractions_sent);
        info!(cluster = %cluster_id, "retraction emitted");
    }

    async fn deliver_with_retries(&self, text: &str) -> bool {
        let timeout = Duration::from_secs(self.config.send_timeout_secs);
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            match tokio::time::timeout(timeout, self.sink.deliver(text)).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "output send failed");
                }
                Err(_) => {
                    warn!(attempt, timeout_secs = timeout.as_secs(), "output send timed out");
                }
            }
            if attempt < MAX_SEND_ATTEMPTS {
                tokio::time::sleep(send_backoff(attempt)).await;
            }
        }
        false
    }

    /// Shutdown drain: flush what is queued, ignoring the gate, within the
    /// 30 s budget.
    async fn drain(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        info!(queued = self.queue.len(), "sender draining before shutdown");
        let deadline = tokio::time::Instant::now() + DRAIN_BUDGET;
        while let Some(report) = self.queue.pop_front() {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.queue.len() + 1, "drain budget exhausted");
                return;
            }
            self.send_summary(&report).await;
        }
    }
}

/// Exponential backoff with jitter from the sub-second clock component.
fn send_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(8);
    let raw = SEND_BACKOFF_BASE.saturating_mul(1u32 << exp).min(SEND_BACKOFF_CAP);

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let unit = (nanos as f64 / u32::MAX as f64) * 2.0 - 1.0;
    Duration::from_secs_f64((raw.as_secs_f64() * (1.0 + 0.2 * unit)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    use sitrep_core::types::{ClusterId, EventKind, SourceId};

    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        failures_left: Mutex<u32>,
    }

    impl RecordingSink {
        fn new(failures: u32) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failures_left: Mutex::new(failures),
            }
        }
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn deliver(&self, text: &str) -> Result<(), SinkError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(SinkError("simulated outage".to_string()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn report(n: u32) -> EmissionReport {
        EmissionReport {
            cluster_id: ClusterId::new(),
            kind: EventKind::Strike,
            location: format!("location {}", n),
            summary: format!("summary {}", n),
            source_ids: vec![SourceId::from("alpha"), SourceId::from("beta")],
            authority_min: 50.0,
            authority_max: 50.0,
            authority_avg: 50.0,
            first_seen: Utc::now(),
        }
    }

    fn sender(dir: &TempDir, sink: Arc<RecordingSink>) -> Sender {
        let store = Arc::new(Store::open(&dir.path().join("t.db")).unwrap());
        Sender::new(
            SenderConfig::default(),
            sink,
            store,
            Arc::new(Counters::default()),
        )
    }

    #[tokio::test]
    async fn queued_summaries_emit_oldest_first_one_per_interval() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new(0));
        let mut s = sender(&dir, sink.clone());
        s.queue.push_back(report(1));
        s.queue.push_back(report(2));

        let t0 = Instant::now();
        s.pump(t0).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        assert!(sink.sent.lock().unwrap()[0].contains("summary 1"));

        // gate closed: nothing more in the same interval
        s.pump(t0 + Duration::from_secs(10)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        // next interval: the second (older-first) goes out
        s.pump(t0 + Duration::from_secs(300)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
        assert!(sink.sent.lock().unwrap()[1].contains("summary 2"));
    }

    #[tokio::test]
    async fn retraction_bypasses_the_gate() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new(0));
        let mut s = sender(&dir, sink.clone());

        let t0 = Instant::now();
        s.queue.push_back(report(1));
        s.pump(t0).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        // gate is closed for summaries, but a retraction must go out now
        let id = ClusterId::new();
        s.send_retraction(&id, EventKind::Strike, "Rafah").await;
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains(&format!("ref:{}", id)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_sink_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new(2));
        let s = sender(&dir, sink.clone());
        assert!(s.send_summary(&report(1)).await);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_sink_failure_gives_up_bounded() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new(u32::MAX));
        let s = sender(&dir, sink.clone());
        assert!(!s.send_summary(&report(1)).await);
        assert!(sink.sent.lock().unwrap().is_empty());
        // exactly five attempts were consumed
        assert_eq!(u32::MAX - *sink.failures_left.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn emissions_are_logged_to_the_store() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::new(0));
        let mut s = sender(&dir, sink);
        s.queue.push_back(report(1));
        s.pump(Instant::now()).await;
        assert_eq!(s.store.emissions_last_hour(Utc::now()).unwrap(), 1);
        assert_eq!(s.counters.snapshot().summaries_sent, 1);
    }
}
