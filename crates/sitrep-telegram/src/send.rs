//! Message sending helpers.
//!
//! Telegram caps messages at 4096 characters; we use 4090 for safety and
//! split on line boundaries. Summaries are short, so chunking only matters
//! for the control surface's longer listings.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::Recipient;
use tracing::warn;

/// Maximum characters per message (limit is 4096; we use 4090 for safety).
const CHUNK_MAX: usize = 4090;

/// Resolve a configured chat spec: a numeric chat ID or a channel username.
pub fn parse_target(spec: &str) -> Recipient {
    let trimmed = spec.trim();
    if let Ok(id) = trimmed.parse::<i64>() {
        return Recipient::Id(ChatId(id));
    }
    let username = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        format!("@{}", trimmed)
    };
    Recipient::ChannelUsername(username)
}

/// Line-aware splitter. A single line longer than the cap is force-split at
/// the nearest character boundary, preferring whitespace.
pub fn split_chunks(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };
        if !current.is_empty() && current.len() + cost > CHUNK_MAX {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Force-split any chunk still over the cap (one enormous line).
    let mut result = Vec::new();
    for chunk in chunks {
        let mut remaining = chunk.as_str();
        while remaining.len() > CHUNK_MAX {
            let cut = split_point(remaining, CHUNK_MAX);
            result.push(remaining[..cut].to_string());
            remaining = remaining[cut..].trim_start();
        }
        if !remaining.is_empty() {
            result.push(remaining.to_string());
        }
    }
    result
}

/// Largest cut ≤ `max_bytes` that lands on a char boundary, preferring the
/// last whitespace before it.
fn split_point(s: &str, max_bytes: usize) -> usize {
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    match s[..cut].rfind(['\n', ' ']) {
        Some(i) if i > 0 => i,
        _ => cut,
    }
}

/// Send `text` to `target` in chunks, plain text. Returns the first error;
/// a 100 ms pause between chunks keeps us under the per-chat rate limit.
pub async fn send_text(
    bot: &Bot,
    target: Recipient,
    text: &str,
) -> Result<(), teloxide::RequestError> {
    let chunks = split_chunks(text);
    let count = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        if let Err(e) = bot.send_message(target.clone(), chunk).await {
            warn!(error = %e, chunk_index = i, "Telegram send failed");
            return Err(e);
        }
        if i + 1 < count {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = split_chunks("🟡 strike — Rafah\nshort summary");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn long_text_splits_on_line_boundaries() {
        let line = "a".repeat(2000);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn huge_single_line_force_splits() {
        let text = "x".repeat(9000);
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn multibyte_text_never_splits_mid_character() {
        let text = "غزة ".repeat(2000);
        for chunk in split_chunks(&text) {
            assert!(chunk.len() <= CHUNK_MAX);
            // would have panicked on a bad boundary already; double-check
            assert!(chunk.is_char_boundary(chunk.len()));
        }
    }

    #[test]
    fn numeric_target_is_chat_id() {
        match parse_target("-1001234567890") {
            Recipient::Id(ChatId(id)) => assert_eq!(id, -1001234567890),
            other => panic!("expected chat id, got {:?}", other),
        }
    }

    #[test]
    fn username_target_gains_at_prefix() {
        match parse_target("war_updates") {
            Recipient::ChannelUsername(u) => assert_eq!(u, "@war_updates"),
            other => panic!("expected username, got {:?}", other),
        }
        match parse_target("@already") {
            Recipient::ChannelUsername(u) => assert_eq!(u, "@already"),
            other => panic!("expected username, got {:?}", other),
        }
    }
}
