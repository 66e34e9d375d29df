//! Response schema validation.
//!
//! The model's output is untrusted input. Everything is checked here;
//! payloads that fail are reported back through the repair path and never
//! reach the correlation engine.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use sitrep_core::types::EventKind;

/// One element of the extraction response array.
#[derive(Debug, Clone, Deserialize)]
pub struct RawExtraction {
    pub kind: EventKind,
    pub location: String,
    #[serde(default)]
    pub coords: Option<[f64; 2]>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub time_hint: Option<String>,
    pub summary: String,
    pub confidence_self: f64,
    pub source_msg_indices: Vec<usize>,
}

/// Parse and validate a raw model response against the contract.
///
/// Tolerates markdown fences (models add them despite instructions) but
/// nothing else: wrong types, unknown kinds, out-of-range confidence, or
/// indices outside the batch all reject the payload.
pub fn parse_response(raw: &str, batch_len: usize) -> Result<Vec<RawExtraction>, String> {
    let stripped = strip_fences(raw.trim());

    let extractions: Vec<RawExtraction> = serde_json::from_str(stripped)
        .map_err(|e| format!("not a valid JSON array of extractions: {}", e))?;

    for (i, ex) in extractions.iter().enumerate() {
        if !(0.0..=1.0).contains(&ex.confidence_self) {
            return Err(format!(
                "element {}: confidence_self {} outside [0, 1]",
                i, ex.confidence_self
            ));
        }
        if ex.source_msg_indices.is_empty() {
            return Err(format!("element {}: source_msg_indices is empty", i));
        }
        if let Some(&bad) = ex.source_msg_indices.iter().find(|&&idx| idx >= batch_len) {
            return Err(format!(
                "element {}: source_msg_indices refers to message {} but the batch has {}",
                i, bad, batch_len
            ));
        }
        if ex.summary.trim().is_empty() {
            return Err(format!("element {}: summary is empty", i));
        }
        if ex.location.trim().is_empty() {
            return Err(format!("element {}: location is empty", i));
        }
    }

    Ok(extractions)
}

fn strip_fences(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    // drop an optional language tag after the opening fence
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").map(str::trim_end).unwrap_or(rest)
}

/// Lenient timestamp parse for the model's `time_hint`. A malformed time is
/// dropped, not a schema failure — the field is "reported time or null".
pub fn parse_time_hint(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"[{
        "kind": "strike",
        "location": "Khan Younis",
        "coords": null,
        "entities": ["idf"],
        "time_hint": "2026-08-01T14:05:00Z",
        "summary": "airstrike reported",
        "confidence_self": 0.9,
        "source_msg_indices": [0, 1]
    }]"#;

    #[test]
    fn valid_payload_parses() {
        let out = parse_response(VALID, 2).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EventKind::Strike);
        assert_eq!(out[0].source_msg_indices, vec![0, 1]);
    }

    #[test]
    fn fenced_payload_parses() {
        let fenced = format!("```json\n{}\n```", VALID);
        assert_eq!(parse_response(&fenced, 2).unwrap().len(), 1);
    }

    #[test]
    fn empty_array_is_valid() {
        assert!(parse_response("[]", 5).unwrap().is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let bad = VALID.replace("strike", "earthquake");
        assert!(parse_response(&bad, 2).is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let bad = VALID.replace("0.9", "1.7");
        assert!(parse_response(&bad, 2).is_err());
    }

    #[test]
    fn index_beyond_batch_is_rejected() {
        assert!(parse_response(VALID, 1).is_err());
    }

    #[test]
    fn prose_is_rejected() {
        assert!(parse_response("Here are the events I found: none.", 3).is_err());
    }

    #[test]
    fn time_hint_formats() {
        assert!(parse_time_hint("2026-08-01T14:05:00Z").is_some());
        assert!(parse_time_hint("2026-08-01 14:05").is_some());
        assert!(parse_time_hint("around two pm").is_none());
    }
}
