//! System prompts for the analysis backends.
//!
//! Every prompt asks for the same JSON verdict so one parser serves all
//! adapters (see [`crate::providers::response`]).

/// Maximum characters of page text sent to a backend.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// System prompt for text classification.
pub const PROMPT_SYSTEM: &str = r#"
You classify short pieces of web page content against a user-defined criterion.

Decide whether the content meets the criterion. Judge only the criterion you
are given. Do not invent extra conditions.

Respond with a single JSON object and nothing else:
{
  "matches": true | false,
  "confidence": 0.0-1.0,
  "explanation": "one short sentence"
}

Confidence is your certainty that "matches" is correct. Use values below 0.5
when the content is ambiguous or too short to judge.
"#;

/// System prompt for screenshot classification.
pub const VISION_SYSTEM: &str = r#"
You classify a screenshot of one element of a web page against a user-defined
criterion.

Decide whether what is visible meets the criterion. Judge only the criterion
you are given. Text rendered inside the image counts as visible content.

Respond with a single JSON object and nothing else:
{
  "matches": true | false,
  "confidence": 0.0-1.0,
  "explanation": "one short sentence"
}
"#;

/// Build the user message for text classification.
pub fn build_prompt_message(text: &str, criteria: &str) -> String {
    format!(
        "Criterion: {}\n\nContent:\n\"\"\"\n{}\n\"\"\"",
        criteria.trim(),
        truncate_chars(text.trim(), MAX_CONTENT_CHARS)
    )
}

/// Build the user message that accompanies a screenshot.
pub fn build_vision_message(criteria: &str) -> String {
    format!(
        "Criterion: {}\n\nDoes the screenshot meet the criterion?",
        criteria.trim()
    )
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
