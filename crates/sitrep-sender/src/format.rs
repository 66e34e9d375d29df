//! Wire format for the output channel.

use sitrep_core::types::{ClusterId, EventKind};
use sitrep_correlate::EmissionReport;

/// Maximum characters of summary text carried in one emission.
const SUMMARY_MAX_CHARS: usize = 280;

/// Credibility badge: green needs both a high average score and broad
/// sourcing; red flags a low-trust consensus; everything else is yellow.
pub fn badge(authority_avg: f64, source_count: usize) -> &'static str {
    if authority_avg >= 70.0 && source_count >= 3 {
        "🟢"
    } else if authority_avg < 40.0 {
        "🔴"
    } else {
        "🟡"
    }
}

pub fn render_summary(report: &EmissionReport) -> String {
    let sources: Vec<&str> = report.source_ids.iter().map(|s| s.as_str()).collect();
    format!(
        "{badge} {kind} — {location}\n{summary}\nSources ({count}): {sources}\nAuthority: {min:.0}–{max:.0} (avg {avg:.1})\nFirst seen: {first_seen}",
        badge = badge(report.authority_avg, report.source_ids.len()),
        kind = report.kind.label(),
        location = report.location,
        summary = clamp_chars(&report.summary, SUMMARY_MAX_CHARS),
        count = report.source_ids.len(),
        sources = sources.join(", "),
        min = report.authority_min,
        max = report.authority_max,
        avg = report.authority_avg,
        first_seen = report.first_seen.to_rfc3339(),
    )
}

/// Retractions reference their cluster in a trailer line so downstream
/// consumers can pair them with the original summary.
pub fn render_retraction(cluster_id: &ClusterId, kind: EventKind, location: &str) -> String {
    format!(
        "⚠️ Retraction: {kind} — {location}\nThe earlier report could not be sustained and has been withdrawn.\nref:{cluster_id}",
        kind = kind.label(),
        location = location,
        cluster_id = cluster_id,
    )
}

fn clamp_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push('…');
    out
}
