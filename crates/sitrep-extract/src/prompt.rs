//! Prompt construction for the extraction call.
//!
//! The wording is deliberately language-neutral: source messages arrive in
//! Arabic, Hebrew, and English, and the model must not translate entity
//! names away. Only the schema is load-bearing — it is re-validated on our
//! side in [`crate::schema`].

use sitrep_core::types::NormalizedMessage;

pub fn extraction_prompt(messages: &[NormalizedMessage]) -> String {
    let mut numbered = String::new();
    for (i, msg) in messages.iter().enumerate() {
        numbered.push_str(&format!("{}: {}\n", i, msg.text_norm));
    }

    format!(
        "You are an event extraction engine for conflict monitoring. Below is a \
numbered list of chat messages from news channels, in their original language.\n\
\n\
Messages:\n{numbered}\n\
Extract every distinct real-world event the messages report. Rules:\n\
- A message may yield zero, one, or several events.\n\
- When several messages clearly describe the same single occurrence, emit ONE \
event listing all of their indices in source_msg_indices.\n\
- Keep summaries short, neutral, and factual. Do not speculate.\n\
- entities are the named actors involved (organizations, units, places acting).\n\
- kind must be exactly one of: strike, movement, casualty, claim, statement, other.\n\
- time_hint is the time the event reportedly happened (ISO-8601), or null.\n\
- confidence_self is your own confidence in the extraction, 0.0 to 1.0.\n\
\n\
Respond with ONLY a JSON array (no prose, no markdown fences), each element:\n\
{{\"kind\": \"strike\", \"location\": \"<place>\", \"coords\": [lat, lon] or null, \
\"entities\": [\"...\"], \"time_hint\": \"...\" or null, \"summary\": \"...\", \
\"confidence_self\": 0.0, \"source_msg_indices\": [0]}}\n\
\n\
An empty array [] is the correct answer when no message reports an event."
    )
}

/// One repair attempt is allowed after a schema failure; tell the model
/// exactly what was wrong with its previous answer.
pub fn repair_prompt(original: &str, bad_output: &str, problem: &str) -> String {
    format!(
        "{original}\n\
\n\
Your previous answer was rejected: {problem}\n\
Previous answer:\n{bad_output}\n\
\n\
Answer again with ONLY a valid JSON array matching the schema exactly."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sitrep_core::normalize::fingerprint;
    use sitrep_core::types::{Lang, SourceClass, SourceId};

    fn msg(i: i64, text: &str) -> NormalizedMessage {
        NormalizedMessage {
            source_id: SourceId::from("alpha"),
            source_class: SourceClass::Arab,
            message_id: i,
            arrived_at: Utc::now(),
            text_norm: text.to_string(),
            hash: fingerprint(text),
            lang_guess: Lang::Latin,
            empty: false,
            reply_to: None,
        }
    }

    #[test]
    fn prompt_numbers_messages_in_order() {
        let prompt = extraction_prompt(&[msg(1, "first report"), msg(2, "second report")]);
        let first = prompt.find("0: first report").unwrap();
        let second = prompt.find("1: second report").unwrap();
        assert!(first < second);
    }

    #[test]
    fn repair_prompt_carries_problem_and_bad_output() {
        let repaired = repair_prompt("base", "not json", "expected an array");
        assert!(repaired.contains("base"));
        assert!(repaired.contains("not json"));
        assert!(repaired.contains("expected an array"));
    }
}
