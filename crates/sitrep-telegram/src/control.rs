//! Control-bot surface: `/status`, `/stats`, `/login`.
//!
//! Answers only in the configured operator chat. Session renewal itself is
//! the companion flow's job; `/login` just points the operator there.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use tracing::info;

use sitrep_core::counters::{Counters, CountersSnapshot};
use sitrep_core::types::{IngestState, SourceAuthority};
use sitrep_store::Store;
use tokio::sync::watch;

use crate::send::send_text;

pub struct ControlContext {
    pub counters: Arc<Counters>,
    pub store: Arc<Store>,
    pub started_at: DateTime<Utc>,
    /// Numeric chat ID or @username of the operator chat.
    pub control_chat: String,
    pub ingest_state: watch::Receiver<IngestState>,
}

/// Long-polling dispatcher for operator commands. Never returns.
pub async fn run_control_bot(bot: Bot, ctx: Arc<ControlContext>) {
    info!("control bot starting long-polling dispatcher");
    let handler = Update::filter_message().endpoint(handle_command);
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx])
        .default_handler(|_upd| async {})
        .build()
        .dispatch()
        .await;
}

async fn handle_command(bot: Bot, msg: Message, ctx: Arc<ControlContext>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if !is_control_chat(&msg, &ctx.control_chat) {
        return Ok(());
    }

    let intake = match *ctx.ingest_state.borrow() {
        IngestState::Active => "active",
        IngestState::Recovery => "recovery",
    };
    let reply = match text.trim() {
        t if t.starts_with("/status") => {
            render_status(&ctx.counters.snapshot(), ctx.started_at, intake)
        }
        t if t.starts_with("/stats") => {
            let top = ctx.store.top_authorities(10).unwrap_or_default();
            let last_hour = ctx.store.emissions_last_hour(Utc::now()).unwrap_or(0);
            render_stats(&top, last_hour)
        }
        t if t.starts_with("/login") => {
            "Session renewal runs through the companion flow; start it from the operator console."
                .to_string()
        }
        _ => return Ok(()),
    };

    let _ = send_text(&bot, msg.chat.id.into(), &reply).await;
    Ok(())
}

fn is_control_chat(msg: &Message, control_chat: &str) -> bool {
    let spec = control_chat.trim();
    if spec.is_empty() {
        return false;
    }
    if msg.chat.id.0.to_string() == spec {
        return true;
    }
    msg.chat
        .username()
        .is_some_and(|u| u == spec.trim_start_matches('@'))
}

fn render_status(snap: &CountersSnapshot, started_at: DateTime<Utc>, intake: &str) -> String {
    let uptime = Utc::now() - started_at;
    format!(
        "alive — up {}h{:02}m, intake {intake}\n\
         ingested: {} (dropped {}, dup {}, empty {})\n\
         batches: {} extracted, {} failed\n\
         events: {}\n\
         clusters: {} opened / {} emitted / {} superseded / {} expired\n\
         out: {} summaries, {} retractions",
        uptime.num_hours(),
        uptime.num_minutes() % 60,
        snap.ingested,
        snap.dropped_ingress,
        snap.duplicates,
        snap.empty_dropped,
        snap.batches_extracted,
        snap.extract_failures,
        snap.events_extracted,
        snap.clusters_opened,
        snap.clusters_emitted,
        snap.clusters_superseded,
        snap.clusters_expired,
        snap.summaries_sent,
        snap.retractions_sent,
    )
}

fn render_stats(top: &[SourceAuthority], emissions_last_hour: u64) -> String {
    let mut out = format!("emissions last hour: {}\ntop sources:\n", emissions_last_hour);
    if top.is_empty() {
        out.push_str("  (none scored yet)");
        return out;
    }
    for (i, auth) in top.iter().enumerate() {
        out.push_str(&format!(
            "  {}. {} — {:.1} ({}↑ {}↓)\n",
            i + 1,
            auth.source_id,
            auth.score,
            auth.corroborations,
            auth.contradictions,
        ));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitrep_core::types::SourceId;

    fn auth(name: &str, score: f64) -> SourceAuthority {
        SourceAuthority {
            source_id: SourceId::from(name),
            score,
            corroborations: 4,
            contradictions: 1,
            last_update: Utc::now(),
        }
    }

    #[test]
    fn status_lists_every_counter_group() {
        let counters = Counters::default();
        sitrep_core::counters::add(&counters.ingested, 120);
        sitrep_core::counters::add(&counters.dropped_ingress, 488);
        let text = render_status(&counters.snapshot(), Utc::now(), "active");
        assert!(text.starts_with("alive"));
        assert!(text.contains("intake active"));
        assert!(text.contains("ingested: 120 (dropped 488"));
        assert!(text.contains("clusters:"));
    }

    #[test]
    fn stats_ranks_sources() {
        let text = render_stats(&[auth("alpha", 82.5), auth("beta", 61.0)], 3);
        assert!(text.contains("emissions last hour: 3"));
        let alpha = text.find("1. alpha — 82.5").unwrap();
        let beta = text.find("2. beta — 61.0").unwrap();
        assert!(alpha < beta);
    }

    #[test]
    fn stats_with_no_sources() {
        let text = render_stats(&[], 0);
        assert!(text.contains("(none scored yet)"));
    }
}
