//! Ingest bridge.
//!
//! The chat-network listener is a separate process (it owns the user
//! session and its credentials); it pipes one JSON record per line into our
//! stdin. The bridge classifies each record against the source lists and
//! feeds the pipeline. On EOF the session is gone: intake flips to
//! recovery, the operator chat is notified, and the rest of the process
//! keeps draining.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use teloxide::prelude::*;
use teloxide::types::Recipient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use sitrep_core::sources::SourceBook;
use sitrep_core::types::{IngestState, RawMessage, SourceId};

/// One line of listener input.
#[derive(Debug, Deserialize)]
struct InboundLine {
    source_id: String,
    message_id: i64,
    text: String,
    #[serde(default)]
    arrived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    reply_to: Option<i64>,
    #[serde(default)]
    media_refs: Vec<String>,
}

/// Read newline-delimited JSON records from stdin until EOF or shutdown.
pub async fn run_stdin_listener(
    sources: SourceBook,
    ingest_tx: mpsc::Sender<RawMessage>,
    state_tx: watch::Sender<IngestState>,
    notifier: Option<(Bot, Recipient)>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(sources = sources.len(), "listener bridge started");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(raw) = parse_line(&line, &sources) {
                            if ingest_tx.send(raw).await.is_err() {
                                warn!("ingest channel closed; listener stopping");
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "listener input error");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }

    // Input is gone — the session needs renewal. Pause intake, tell the
    // operator, and keep the process alive so queued work drains.
    warn!("listener input closed; intake entering recovery");
    let _ = state_tx.send(IngestState::Recovery);
    if let Some((bot, chat)) = notifier {
        let note = "⚠️ chat session lost — ingestion paused, queues draining. Run the companion /login flow.";
        let _ = crate::app::notify(&bot, chat, note).await;
    }

    // Park until shutdown so the ingest channel stays open.
    loop {
        if shutdown.changed().await.is_err() || *shutdown.borrow() {
            return;
        }
    }
}

fn parse_line(line: &str, sources: &SourceBook) -> Option<RawMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let inbound: InboundLine = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "listener line is not valid JSON; skipped");
            return None;
        }
    };

    let source_id = SourceId::from(inbound.source_id.trim_start_matches('@'));
    let Some(class) = sources.class_of(&source_id) else {
        debug!(source = %source_id, "message from unlisted source; skipped");
        return None;
    };

    Some(RawMessage {
        source_id,
        source_class: class,
        message_id: inbound.message_id,
        arrived_at: inbound.arrived_at.unwrap_or_else(Utc::now),
        text: inbound.text,
        reply_to: inbound.reply_to,
        media_refs: inbound.media_refs,
    })
}
