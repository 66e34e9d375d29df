//! Message canonicalization.
//!
//! Two reports of the same text must fingerprint identically even when they
//! differ in diacritics, punctuation, directionality marks, or a channel's
//! signature trailer. Steps run in a fixed order; the function is
//! deterministic and idempotent on its own output.

use sha2::{Digest, Sha256};

use crate::types::{Lang, NormalizedMessage, RawMessage};

/// Number of digest bytes kept for the content fingerprint (160 bits).
const HASH_BYTES: usize = 20;

/// Canonicalize a raw message.
///
/// `signature_patterns` is the configured list of bracketed trailer strings
/// channels append to every post (e.g. `"[via Frontline]"`); a matching
/// suffix is stripped before fingerprinting.
pub fn normalize(raw: &RawMessage, signature_patterns: &[String]) -> NormalizedMessage {
    let text_norm = normalize_text(&raw.text, signature_patterns);
    let lang_guess = guess_lang(&text_norm);
    let hash = fingerprint(&text_norm);

    NormalizedMessage {
        source_id: raw.source_id.clone(),
        source_class: raw.source_class,
        message_id: raw.message_id,
        arrived_at: raw.arrived_at,
        empty: text_norm.is_empty(),
        text_norm,
        hash,
        lang_guess,
        reply_to: raw.reply_to,
    }
}

/// First 160 bits of SHA-256 over the normalized text, lowercase hex.
pub fn fingerprint(text_norm: &str) -> String {
    let digest = Sha256::digest(text_norm.as_bytes());
    hex::encode(&digest[..HASH_BYTES])
}

fn normalize_text(text: &str, signature_patterns: &[String]) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !is_bidi_mark(*c) && !is_rtl_diacritic(*c))
        .collect();

    let collapsed = collapse_whitespace(&stripped);
    let trimmed = strip_signature_trailer(&collapsed, signature_patterns);

    let depunctuated: String = trimmed.chars().filter(|c| !is_punctuation(*c)).collect();

    collapse_whitespace(&depunctuated).to_lowercase()
}

/// Directionality control characters common in mixed RTL/LTR posts.
fn is_bidi_mark(c: char) -> bool {
    matches!(
        c,
        '\u{200C}' | '\u{200D}' | '\u{200E}' | '\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2066}'..='\u{2069}'
            | '\u{061C}'
            | '\u{FEFF}'
    )
}

/// Combining marks of the right-to-left scripts in the source corpus:
/// Arabic harakat, tanwin, shadda, superscript alef, Quranic annotation
/// signs, tatweel, and Hebrew points/cantillation.
fn is_rtl_diacritic(c: char) -> bool {
    matches!(
        c,
        '\u{0610}'..='\u{061A}'
            | '\u{064B}'..='\u{065F}'
            | '\u{0670}'
            | '\u{06D6}'..='\u{06ED}'
            | '\u{0640}'
            | '\u{0591}'..='\u{05BD}'
            | '\u{05BF}'
            | '\u{05C1}' | '\u{05C2}'
            | '\u{05C4}' | '\u{05C5}'
            | '\u{05C7}'
    )
}

/// Punctuation that must not defeat content dedup ("strike!!" vs "strike").
fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c,
            '؟' | '،'
                | '؛'
                | '«'
                | '»'
                | '…'
                | '—'
                | '–'
                | '\u{2018}'
                | '\u{2019}'
                | '\u{201C}'
                | '\u{201D}'
        )
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_signature_trailer(text: &str, patterns: &[String]) -> String {
    let mut out = text.trim_end();
    // Channels sometimes stack trailers ("… [via X] [via X]"); strip repeatedly.
    loop {
        let before = out.len();
        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            if let Some(rest) = out.strip_suffix(pattern) {
                out = rest.trim_end();
            }
        }
        if out.len() == before {
            break;
        }
    }
    out.to_string()
}

fn guess_lang(text: &str) -> Lang {
    let mut arabic = 0usize;
    let mut hebrew = 0usize;
    let mut latin = 0usize;

    for c in text.chars() {
        match c {
            '\u{0600}'..='\u{06FF}' | '\u{0750}'..='\u{077F}' => arabic += 1,
            '\u{0590}'..='\u{05FF}' => hebrew += 1,
            'a'..='z' | 'A'..='Z' => latin += 1,
            _ => {}
        }
    }

    let max = arabic.max(hebrew).max(latin);
    if max == 0 {
        Lang::Other
    } else if max == arabic {
        Lang::Arabic
    } else if max == hebrew {
        Lang::Hebrew
    } else {
        Lang::Latin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SourceClass, SourceId};
    use chrono::Utc;

    fn raw(text: &str) -> RawMessage {
        RawMessage {
            source_id: SourceId::from("frontline"),
            source_class: SourceClass::Arab,
            message_id: 1,
            arrived_at: Utc::now(),
            text: text.to_string(),
            reply_to: None,
            media_refs: Vec::new(),
        }
    }

    #[test]
    fn diacritics_and_punctuation_do_not_change_hash() {
        let a = normalize(&raw("انفجار في غزة اليوم"), &[]);
        let b = normalize(&raw("انفجارٌ في غزّة اليوم!!"), &[]);
        assert_eq!(a.text_norm, b.text_norm);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn latin_text_is_lowercased_and_collapsed() {
        let n = normalize(&raw("  Israeli  STRIKE\tin   Khan Yunis "), &[]);
        assert_eq!(n.text_norm, "israeli strike in khan yunis");
        assert_eq!(n.lang_guess, Lang::Latin);
    }

    #[test]
    fn signature_trailer_is_stripped() {
        let patterns = vec!["[via Frontline]".to_string()];
        let with = normalize(&raw("breaking news from the north [via Frontline]"), &patterns);
        let without = normalize(&raw("breaking news from the north"), &patterns);
        assert_eq!(with.hash, without.hash);
    }

    #[test]
    fn stacked_trailers_are_stripped() {
        let patterns = vec!["[via Frontline]".to_string()];
        let n = normalize(
            &raw("update [via Frontline] [via Frontline]"),
            &patterns,
        );
        assert_eq!(n.text_norm, "update");
    }

    #[test]
    fn bidi_marks_are_removed() {
        let a = normalize(&raw("\u{200F}غارة جوية\u{200E}"), &[]);
        let b = normalize(&raw("غارة جوية"), &[]);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.lang_guess, Lang::Arabic);
    }

    #[test]
    fn empty_after_normalization_sets_flag() {
        let n = normalize(&raw("  !!! \u{200F} "), &[]);
        assert!(n.empty);
        assert_eq!(n.text_norm, "");
        // digest of the empty string, truncated to 160 bits
        assert_eq!(n.hash, fingerprint(""));
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(&raw("Explosion reported — heavy smoke, sirens!"), &[]);
        let twice = normalize(&raw(&once.text_norm), &[]);
        assert_eq!(once.text_norm, twice.text_norm);
        assert_eq!(once.hash, twice.hash);
    }

    #[test]
    fn hebrew_guess() {
        let n = normalize(&raw("אזעקות בצפון"), &[]);
        assert_eq!(n.lang_guess, Lang::Hebrew);
    }
}
