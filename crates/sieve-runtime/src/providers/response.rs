//! Parsing model output into verdicts.
//!
//! Every analysis backend is asked to answer with a JSON object:
//!
//! ```json
//! { "matches": true, "confidence": 0.83, "explanation": "Sponsored label" }
//! ```
//!
//! [`parse_verdict`] is strict apart from stripping markdown code fences.
//! [`parse_verdict_lenient`] is used by the federated adapter, whose
//! upstream models sometimes mangle JSON: it repairs common escaping
//! mistakes, validates against [`VERDICT_SCHEMA`], and as a last resort
//! recovers `matches`/`confidence` with regexes and flags the result.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::OnceLock;

use super::ProviderError;

lazy_static! {
    static ref MATCHES_FIELD: Regex =
        Regex::new(r#"(?i)"?matches"?\s*:\s*"?(true|false)"?"#).unwrap();
    static ref CONFIDENCE_FIELD: Regex =
        Regex::new(r#"(?i)"?confidence"?\s*:\s*"?([0-9]*\.?[0-9]+)"?"#).unwrap();
    static ref EXPLANATION_FIELD: Regex =
        Regex::new(r#"(?i)"?explanation"?\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap();
}

/// JSON schema a verdict must satisfy.
pub const VERDICT_SCHEMA: &str = r#"{
  "type": "object",
  "properties": {
    "matches": { "type": "boolean" },
    "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
    "explanation": { "type": "string" }
  },
  "required": ["matches", "confidence", "explanation"],
  "additionalProperties": false
}"#;

static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// The schema as a JSON value, for request bodies.
pub fn verdict_schema() -> JsonValue {
    serde_json::from_str(VERDICT_SCHEMA).unwrap_or(JsonValue::Null)
}

fn schema_validator() -> Option<&'static jsonschema::Validator> {
    let compiled = COMPILED_SCHEMA.get_or_init(|| {
        let schema: JsonValue = serde_json::from_str(VERDICT_SCHEMA)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;
        jsonschema::options()
            .build(&schema)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    match compiled {
        Ok(validator) => Some(validator),
        Err(e) => {
            tracing::error!(error = %e, "Verdict schema unavailable");
            None
        }
    }
}

/// A backend's judgment of one subject against one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub matches: bool,

    /// Clamped to [0, 1]
    pub confidence: f64,

    #[serde(default)]
    pub explanation: String,

    /// Set when the verdict was recovered from malformed JSON
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub had_json_error: bool,
}

#[derive(Deserialize)]
struct VerdictWire {
    matches: bool,
    confidence: f64,
    #[serde(default)]
    explanation: String,
}

impl From<VerdictWire> for Verdict {
    fn from(wire: VerdictWire) -> Self {
        Verdict {
            matches: wire.matches,
            confidence: clamp_confidence(wire.confidence),
            explanation: wire.explanation,
            had_json_error: false,
        }
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Remove a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line.
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Fix escaping mistakes some models make inside JSON strings.
///
/// Rewrites the invalid escape `\'` to `'`. Escape pairs are consumed as
/// a unit, so an escaped backslash followed by a quote (`\\'`) is kept.
pub fn repair_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\'') => out.push('\''),
            Some(escaped) => {
                out.push('\\');
                out.push(escaped);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Parse a verdict strictly (code fences aside).
pub fn parse_verdict(text: &str) -> Result<Verdict, ProviderError> {
    let body = strip_code_fences(text);
    serde_json::from_str::<VerdictWire>(body)
        .map(Verdict::from)
        .map_err(|e| ProviderError::MalformedResponse(format!("{}: {}", e, preview(body))))
}

/// Parse a verdict, repairing and finally regex-recovering when needed.
///
/// Only fails when not even `matches` can be found.
pub fn parse_verdict_lenient(text: &str) -> Result<Verdict, ProviderError> {
    let repaired = repair_json(strip_code_fences(text));

    if let Ok(value) = serde_json::from_str::<JsonValue>(&repaired) {
        let schema_ok = schema_validator().map_or(true, |v| v.is_valid(&value));
        if schema_ok {
            if let Ok(wire) = serde_json::from_value::<VerdictWire>(value) {
                return Ok(wire.into());
            }
        } else {
            tracing::warn!(body = %preview(&repaired), "Verdict failed schema validation");
        }
    }

    match recover_verdict(&repaired) {
        Some(verdict) => {
            tracing::warn!(
                matches = verdict.matches,
                confidence = verdict.confidence,
                "Recovered verdict from malformed JSON"
            );
            Ok(verdict)
        }
        None => Err(ProviderError::MalformedResponse(format!(
            "no verdict found in: {}",
            preview(&repaired)
        ))),
    }
}

/// Regex-based partial extraction of a verdict from broken JSON.
pub fn recover_verdict(text: &str) -> Option<Verdict> {
    let matches = MATCHES_FIELD
        .captures(text)
        .map(|c| c[1].eq_ignore_ascii_case("true"))?;

    let confidence = CONFIDENCE_FIELD
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(clamp_confidence)
        .unwrap_or(if matches { 0.5 } else { 0.0 });

    let explanation = EXPLANATION_FIELD
        .captures(text)
        .map(|c| c[1].replace("\\\"", "\""))
        .unwrap_or_else(|| "Recovered from malformed response".to_string());

    Some(Verdict {
        matches,
        confidence,
        explanation,
        had_json_error: true,
    })
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
