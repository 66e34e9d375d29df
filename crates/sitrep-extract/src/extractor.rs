//! The extraction task.
//!
//! Single consumer of the pipeline's batch channel, and the only code path
//! that talks to the model. Batches are processed strictly in arrival order,
//! one at a time; budget denial defers the batch in place, preserving FIFO.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use sitrep_core::counters::{self, Counters};
use sitrep_core::types::{Event, EventId, MessageRef, NormalizedMessage, SourceClass};
use sitrep_store::Store;

use crate::budget::{Admission, BudgetLedger};
use crate::prompt::{extraction_prompt, repair_prompt};
use crate::provider::{LlmProvider, ProviderError};
use crate::schema::{parse_response, parse_time_hint, RawExtraction};

/// Bounded attempts for transient provider failures within one batch.
const MAX_TRANSIENT_ATTEMPTS: u32 = 5;
/// Backoff schedule for transient retries.
const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_secs(5);
const TRANSIENT_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Backoff schedule for released (`extract_failed`) batches.
const RELEASE_BACKOFF_BASE: Duration = Duration::from_secs(30);
const RELEASE_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
/// Jitter fraction applied to every backoff (±20 %).
const JITTER_FRACTION: f64 = 0.20;

/// A unit of work for one extraction call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub class: SourceClass,
    pub messages: Vec<NormalizedMessage>,
    /// How many times this batch has been released back to the pipeline.
    pub release_attempts: u32,
}

/// A failed batch handed back to the pipeline's pending queue. The pipeline
/// must not re-submit it before `retry_delay` has elapsed.
#[derive(Debug)]
pub struct ReleasedBatch {
    pub batch: Batch,
    pub retry_delay: Duration,
}

enum ExtractFailure {
    /// Schema still invalid after the one repair attempt.
    Schema(String),
    /// Transient provider trouble that outlived the bounded retries.
    Provider(ProviderError),
}

pub struct Extractor {
    provider: Arc<dyn LlmProvider>,
    budget: BudgetLedger,
    store: Arc<Store>,
    counters: Arc<Counters>,
}

impl Extractor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        budget: BudgetLedger,
        store: Arc<Store>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            provider,
            budget,
            store,
            counters,
        }
    }

    /// Main loop. Exits when the batch channel closes, the shutdown signal
    /// fires, or the store reports corruption.
    pub async fn run(
        mut self,
        mut batch_rx: mpsc::Receiver<Batch>,
        events_tx: mpsc::Sender<Vec<Event>>,
        release_tx: mpsc::Sender<ReleasedBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(provider = self.provider.name(), "extractor started");
        loop {
            tokio::select! {
                maybe = batch_rx.recv() => {
                    match maybe {
                        Some(batch) => {
                            if !self.process_batch(batch, &events_tx, &release_tx).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("extractor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` only on a fatal store error.
    async fn process_batch(
        &mut self,
        batch: Batch,
        events_tx: &mpsc::Sender<Vec<Event>>,
        release_tx: &mpsc::Sender<ReleasedBatch>,
    ) -> bool {
        let size = batch.messages.len();
        debug!(class = %batch.class, size, "extracting batch");

        match self.run_extraction(&batch).await {
            Ok(raws) => {
                let events = build_events(&batch.messages, raws);
                counters::incr(&self.counters.batches_extracted);
                counters::add(&self.counters.events_extracted, events.len() as u64);

                if let Err(e) = self.store.put_events(&events) {
                    if e.is_fatal() {
                        error!(error = %e, "store is corrupt; extractor stopping");
                        return false;
                    }
                    warn!(error = %e, "event batch not persisted; releasing for retry");
                    self.release(batch, release_tx).await;
                    return true;
                }

                info!(class = %batch.class, size, events = events.len(), "batch extracted");
                if !events.is_empty() && events_tx.send(events).await.is_err() {
                    warn!("correlation channel closed; extracted events dropped");
                }
            }
            Err(ExtractFailure::Schema(problem)) => {
                warn!(class = %batch.class, size, %problem, "batch marked extract_failed");
                counters::incr(&self.counters.extract_failures);
                self.release(batch, release_tx).await;
            }
            Err(ExtractFailure::Provider(e)) => {
                warn!(class = %batch.class, size, error = %e, "provider exhausted retries; releasing batch");
                counters::incr(&self.counters.extract_failures);
                self.release(batch, release_tx).await;
            }
        }
        true
    }

    /// One extraction: admission, the model call, schema validation, and the
    /// single repair attempt. Transient provider errors retry here (bounded).
    async fn run_extraction(&mut self, batch: &Batch) -> Result<Vec<RawExtraction>, ExtractFailure> {
        let base_prompt = extraction_prompt(&batch.messages);
        let mut prompt = base_prompt.clone();
        let mut repaired = false;
        let mut transient_attempts = 0u32;

        loop {
            self.wait_for_admission().await;
            self.budget.record(Instant::now());

            match self.provider.generate(&prompt).await {
                Ok(text) => match parse_response(&text, batch.messages.len()) {
                    Ok(raws) => return Ok(raws),
                    Err(problem) if !repaired => {
                        debug!(%problem, "schema invalid; attempting repair");
                        prompt = repair_prompt(&base_prompt, &text, &problem);
                        repaired = true;
                    }
                    Err(problem) => return Err(ExtractFailure::Schema(problem)),
                },
                Err(e) if e.is_transient() => {
                    transient_attempts += 1;
                    if transient_attempts >= MAX_TRANSIENT_ATTEMPTS {
                        return Err(ExtractFailure::Provider(e));
                    }
                    let mut delay = backoff_delay(
                        transient_attempts,
                        TRANSIENT_BACKOFF_BASE,
                        TRANSIENT_BACKOFF_CAP,
                    );
                    if let ProviderError::RateLimited { retry_after_ms } = &e {
                        delay = delay.max(Duration::from_millis(*retry_after_ms));
                    }
                    warn!(attempt = transient_attempts, error = %e, delay_ms = delay.as_millis() as u64,
                        "transient provider error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(ExtractFailure::Provider(e)),
            }
        }
    }

    /// Block until both budget windows admit a call. Deferral is not a
    /// failure; the batch simply waits its turn.
    async fn wait_for_admission(&mut self) {
        loop {
            match self.budget.admit(Instant::now()) {
                Admission::Granted => return,
                Admission::Deferred(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "budget exhausted, deferring batch");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn release(&self, mut batch: Batch, release_tx: &mpsc::Sender<ReleasedBatch>) {
        let retry_delay = backoff_delay(
            batch.release_attempts + 1,
            RELEASE_BACKOFF_BASE,
            RELEASE_BACKOFF_CAP,
        );
        batch.release_attempts += 1;
        if release_tx
            .send(ReleasedBatch { batch, retry_delay })
            .await
            .is_err()
        {
            warn!("release channel closed; failed batch dropped");
        }
    }
}

/// Exponential backoff with ±20 % jitter: `base · 2^(attempt−1)`, capped.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exp).min(cap);
    apply_jitter(raw, JITTER_FRACTION)
}

/// Jitter offset derived from the sub-second component of the system clock.
fn apply_jitter(base: Duration, fraction: f64) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    // map nanos onto [-1, 1]
    let unit = (nanos as f64 / u32::MAX as f64) * 2.0 - 1.0;
    let secs = base.as_secs_f64() * (1.0 + fraction * unit);
    Duration::from_secs_f64(secs.max(0.0))
}

/// Map validated extractions onto [`Event`] records, resolving message
/// indices to stable refs. Entity names are lower-cased so cross-source
/// overlap checks are not defeated by capitalization.
fn build_events(messages: &[NormalizedMessage], raws: Vec<RawExtraction>) -> Vec<Event> {
    let now = Utc::now();
    raws.into_iter()
        .map(|raw| {
            let mut seen = BTreeSet::new();
            let message_refs: Vec<MessageRef> = raw
                .source_msg_indices
                .iter()
                .filter(|&&i| seen.insert(i))
                .map(|&i| MessageRef {
                    source_id: messages[i].source_id.clone(),
                    message_id: messages[i].message_id,
                })
                .collect();

            let entities: BTreeSet<String> = raw
                .entities
                .iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect();

            Event {
                event_id: EventId::new(),
                message_refs,
                kind: raw.kind,
                location: raw.location.trim().to_string(),
                coords: raw.coords.map(|c| (c[0], c[1])),
                entities,
                time_hint: raw.time_hint.as_deref().and_then(parse_time_hint),
                summary: raw.summary.trim().to_string(),
                confidence_self: raw.confidence_self,
                created_at: now,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    use sitrep_core::normalize::fingerprint;
    use sitrep_core::types::{Lang, SourceId};

    /// Scripted provider: pops one canned response per call.
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, ProviderError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn norm_msg(source: &str, id: i64, text: &str) -> NormalizedMessage {
        NormalizedMessage {
            source_id: SourceId::from(source),
            source_class: SourceClass::Arab,
            message_id: id,
            arrived_at: Utc::now(),
            text_norm: text.to_string(),
            hash: fingerprint(text),
            lang_guess: Lang::Latin,
            empty: false,
            reply_to: None,
        }
    }

    fn batch(messages: Vec<NormalizedMessage>) -> Batch {
        Batch {
            class: SourceClass::Arab,
            messages,
            release_attempts: 0,
        }
    }

    const GOOD: &str = r#"[{"kind":"strike","location":"Khan Younis","entities":["idf"],
        "time_hint":null,"summary":"airstrike reported","confidence_self":0.9,
        "source_msg_indices":[0]}]"#;

    fn harness(
        provider: ScriptedProvider,
        dir: &TempDir,
    ) -> (
        Extractor,
        mpsc::Receiver<Vec<Event>>,
        mpsc::Receiver<ReleasedBatch>,
        mpsc::Sender<Vec<Event>>,
        mpsc::Sender<ReleasedBatch>,
    ) {
        let store = Arc::new(Store::open(&dir.path().join("t.db")).unwrap());
        let extractor = Extractor::new(
            Arc::new(provider),
            BudgetLedger::new(100, 100),
            store,
            Arc::new(Counters::default()),
        );
        let (events_tx, events_rx) = mpsc::channel(4);
        let (release_tx, release_rx) = mpsc::channel(4);
        (extractor, events_rx, release_rx, events_tx, release_tx)
    }

    #[tokio::test]
    async fn valid_response_yields_events() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![Ok(GOOD.to_string())]);
        let (mut ex, mut events_rx, _release_rx, events_tx, release_tx) = harness(provider, &dir);

        let ok = ex
            .process_batch(batch(vec![norm_msg("alpha", 1, "strike")]), &events_tx, &release_tx)
            .await;
        assert!(ok);

        let events = events_rx.recv().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, sitrep_core::types::EventKind::Strike);
        assert_eq!(events[0].message_refs[0].message_id, 1);
        // persisted before forwarding
        let stored = ex
            .store
            .get_events_since(Utc::now() - chrono::Duration::minutes(1))
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn schema_failure_is_repaired_once() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            Ok("this is not json".to_string()),
            Ok(GOOD.to_string()),
        ]);
        let (mut ex, mut events_rx, _release_rx, events_tx, release_tx) = harness(provider, &dir);

        ex.process_batch(batch(vec![norm_msg("alpha", 1, "strike")]), &events_tx, &release_tx)
            .await;
        assert_eq!(events_rx.recv().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_schema_failure_releases_batch() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            Ok("still not json".to_string()),
            Ok("also not json".to_string()),
        ]);
        let (mut ex, _events_rx, mut release_rx, events_tx, release_tx) = harness(provider, &dir);

        ex.process_batch(batch(vec![norm_msg("alpha", 1, "strike")]), &events_tx, &release_tx)
            .await;

        let released = release_rx.recv().await.unwrap();
        assert_eq!(released.batch.release_attempts, 1);
        assert_eq!(released.batch.messages.len(), 1);
        // first release waits roughly the 30s base (±20 % jitter)
        assert!(released.retry_delay >= Duration::from_secs(24));
        assert!(released.retry_delay <= Duration::from_secs(36));
    }

    #[tokio::test]
    async fn non_transient_api_error_releases_without_retry() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Api {
            status: 400,
            message: "bad request".to_string(),
        })]);
        let (mut ex, _events_rx, mut release_rx, events_tx, release_tx) = harness(provider, &dir);

        ex.process_batch(batch(vec![norm_msg("alpha", 1, "strike")]), &events_tx, &release_tx)
            .await;
        assert!(release_rx.recv().await.is_some());
    }

    #[test]
    fn release_backoff_doubles_and_caps() {
        // strip jitter bounds: value must stay within ±20 % of the ideal
        let first = backoff_delay(1, RELEASE_BACKOFF_BASE, RELEASE_BACKOFF_CAP);
        assert!(first >= Duration::from_secs(24) && first <= Duration::from_secs(36));

        let third = backoff_delay(3, RELEASE_BACKOFF_BASE, RELEASE_BACKOFF_CAP);
        assert!(third >= Duration::from_secs(96) && third <= Duration::from_secs(144));

        let huge = backoff_delay(12, RELEASE_BACKOFF_BASE, RELEASE_BACKOFF_CAP);
        assert!(huge <= Duration::from_secs(2160)); // 30 min + 20 %
    }

    #[test]
    fn build_events_resolves_and_dedupes_refs() {
        let msgs = vec![norm_msg("alpha", 10, "a"), norm_msg("beta", 20, "b")];
        let raws = parse_response(
            r#"[{"kind":"claim","location":"Rafah","entities":[" IDF ", ""],
                "time_hint":"2026-08-01T14:00:00Z","summary":"s","confidence_self":0.5,
                "source_msg_indices":[1, 0, 1]}]"#,
            2,
        )
        .unwrap();
        let events = build_events(&msgs, raws);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_refs.len(), 2);
        assert!(events[0].entities.contains("idf"));
        assert_eq!(events[0].entities.len(), 1);
        assert!(events[0].time_hint.is_some());
    }
}
