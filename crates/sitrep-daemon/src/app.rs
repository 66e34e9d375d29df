//! Task wiring and process lifecycle.
//!
//! The supervisor owns every channel and spawns one task per flow:
//! listener bridge → pipeline → extractor → correlation → sender, plus the
//! authority ledger (with its decay tick) and a fingerprint-pruning tick.
//! Shutdown is ordered: signal all tasks, let the pipeline flush and the
//! sender drain within their budgets, close the store last.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::Recipient;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use sitrep_core::config::SitrepConfig;
use sitrep_core::counters::Counters;
use sitrep_core::sources::SourceBook;
use sitrep_core::types::{Event, IngestState, RawMessage};
use sitrep_correlate::{AuthorityLedger, AuthorityUpdate, CorrelationEngine, SendOrder};
use sitrep_extract::gemini::GeminiProvider;
use sitrep_extract::{Batch, BudgetLedger, Extractor, ReleasedBatch};
use sitrep_pipeline::Pipeline;
use sitrep_sender::{OutboundSink, Sender, SinkError};
use sitrep_store::Store;
use sitrep_telegram::send::parse_target;
use sitrep_telegram::{run_control_bot, ControlContext, TelegramSink};

use crate::listener::run_stdin_listener;

/// Fallback sink when no bot token is configured. Emissions land in the log
/// only — useful for dry runs and local replays.
struct LogSink;

#[async_trait::async_trait]
impl OutboundSink for LogSink {
    async fn deliver(&self, text: &str) -> Result<(), SinkError> {
        info!(out = %text, "emission (log sink)");
        Ok(())
    }
}

/// One-shot message to the operator chat.
pub async fn notify(bot: &Bot, chat: Recipient, text: &str) -> Result<(), teloxide::RequestError> {
    bot.send_message(chat, text.to_string()).await.map(|_| ())
}

pub async fn run(config: SitrepConfig) -> anyhow::Result<()> {
    let counters = Arc::new(Counters::default());
    let store = Arc::new(Store::open(Path::new(&config.database.path))?);

    let sources = SourceBook::load(
        Path::new(&config.sources.arab_list),
        Path::new(&config.sources.smart_list),
    )
    .unwrap_or_else(|e| {
        warn!(error = %e, "source lists not loaded; intake will accept nothing");
        SourceBook::default()
    });

    // channels between the flows; the batch channel's capacity of 1 is what
    // keeps extraction serialized
    let (ingest_tx, ingest_rx) = mpsc::channel::<RawMessage>(256);
    let (batch_tx, batch_rx) = mpsc::channel::<Batch>(1);
    let (events_tx, events_rx) = mpsc::channel::<Vec<Event>>(16);
    let (release_tx, release_rx) = mpsc::channel::<ReleasedBatch>(8);
    let (authority_tx, authority_rx) = mpsc::channel::<AuthorityUpdate>(64);
    let (order_tx, order_rx) = mpsc::channel::<SendOrder>(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(IngestState::Active);

    let (ledger, authority_snapshot_rx) =
        AuthorityLedger::new(config.correlation.clone(), store.clone())?;

    let provider = Arc::new(GeminiProvider::new(
        config.llm.gemini_api_key.clone(),
        config.llm.gemini_model.clone(),
        config.llm.request_timeout_secs,
        None,
    )?);
    let budget = BudgetLedger::new(config.llm.budget_hourly, config.llm.rpm_limit);
    let extractor = Extractor::new(provider, budget, store.clone(), counters.clone());

    let engine = CorrelationEngine::new(
        config.correlation.clone(),
        store.clone(),
        counters.clone(),
        authority_snapshot_rx,
        authority_tx,
        order_tx,
    );

    let pipeline = Pipeline::new(
        config.pipeline.clone(),
        config.sources.signature_patterns.clone(),
        store.clone(),
        counters.clone(),
    );

    // output sink + control bot
    let mut notifier: Option<(Bot, Recipient)> = None;
    let sink: Arc<dyn OutboundSink> = if config.telegram.bot_token.is_empty() {
        warn!("no bot token configured; emissions go to the log only");
        Arc::new(LogSink)
    } else {
        let bot = Bot::new(&config.telegram.bot_token);
        if !config.output.control_chat.is_empty() {
            let ctx = Arc::new(ControlContext {
                counters: counters.clone(),
                store: store.clone(),
                started_at: Utc::now(),
                control_chat: config.output.control_chat.clone(),
                ingest_state: state_rx.clone(),
            });
            // the dispatcher has no cooperative cancel; it dies with the process
            tokio::spawn(run_control_bot(bot.clone(), ctx));
            notifier = Some((bot.clone(), parse_target(&config.output.control_chat)));
        }
        Arc::new(TelegramSink::new(bot, &config.output.arabs_summary_out))
    };
    let sender = Sender::new(config.sender.clone(), sink, store.clone(), counters.clone());

    // spawn the flows
    let mut tasks: JoinSet<()> = JoinSet::new();
    tasks.spawn(ledger.run(authority_rx, shutdown_rx.clone()));
    tasks.spawn(engine.run(events_rx, shutdown_rx.clone()));
    tasks.spawn(extractor.run(batch_rx, events_tx, release_tx, shutdown_rx.clone()));
    tasks.spawn(pipeline.run(ingest_rx, batch_tx, release_rx, shutdown_rx.clone()));
    tasks.spawn(sender.run(order_rx, shutdown_rx.clone()));
    tasks.spawn(run_stdin_listener(
        sources,
        ingest_tx,
        state_tx,
        notifier,
        shutdown_rx.clone(),
    ));
    tasks.spawn(prune_loop(
        store.clone(),
        config.pipeline.dedup_window_secs,
        shutdown_rx.clone(),
    ));

    info!("all tasks started");

    // run until a signal arrives or a core task dies
    let mut early_exit = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = tasks.join_next() => {
            error!("a core task exited early; shutting down");
            early_exit = true;
        }
    }

    let _ = shutdown_tx.send(true);

    // pipeline flush is bounded to 60 s and the sender drain to 30 s; give
    // the group a little headroom beyond both
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(100), drain).await.is_err() {
        warn!("tasks did not stop in time; aborting the rest");
        tasks.abort_all();
    }

    // the store closes last, after every writer is gone
    drop(store);
    info!("sitrep stopped");

    if early_exit {
        anyhow::bail!("a core task exited unexpectedly; see logs");
    }
    Ok(())
}

/// Hourly cleanup of message fingerprints that fell out of the dedup window.
async fn prune_loop(store: Arc<Store>, window_secs: i64, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(3600));
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let cutoff = Utc::now() - chrono::Duration::seconds(window_secs);
                match store.prune_messages(cutoff) {
                    Ok(n) if n > 0 => info!(pruned = n, "expired message fingerprints removed"),
                    Err(e) => warn!(error = %e, "fingerprint prune failed"),
                    _ => {}
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
