//! Multi-strategy recovery of structured data from semi-structured
//! responses.
//!
//! Agents and models frequently wrap JSON in prose, quotes, or markdown.
//! Strategies are tried in order, stopping at the first that succeeds:
//!
//! 1. A pre-parsed value supplied by the agent wins outright.
//! 2. A non-string native value is already structured.
//! 3. Strict parse after trimming whitespace and balanced quotes.
//! 4. Greedy (then shortest-match) `[...]` / `{...}` window extraction.
//! 5. Ask the LLM to repair the text to valid JSON, then retry 3–4.
//! 6. Give up and return the trimmed raw string.
//!
//! The chain is deterministic and idempotent on already-parsed inputs.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::backend::{CompletionRequest, LlmBackend};

/// Longest text sent to the repair model.
const REPAIR_INPUT_CAP: usize = 2000;

const REPAIR_SYSTEM: &str = "You are a JSON repair tool. Output ONLY valid JSON.";

fn window_patterns() -> &'static [(Regex, Regex)] {
    static PATTERNS: OnceLock<Vec<(Regex, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"\[[\s\S]*\]").expect("valid regex"),
                Regex::new(r"\[[\s\S]*?\]").expect("valid regex"),
            ),
            (
                Regex::new(r"\{[\s\S]*\}").expect("valid regex"),
                Regex::new(r"\{[\s\S]*?\}").expect("valid regex"),
            ),
        ]
    })
}

/// Recover a structured value from a raw response.
///
/// `parsed` is the agent's own schema-validated output when available.
/// `repair` enables strategy 5; pass `None` where a model round-trip is
/// unwanted (the chain stays fully deterministic without it).
pub async fn parse_result(
    raw: Value,
    parsed: Option<Value>,
    repair: Option<&dyn LlmBackend>,
) -> Value {
    // Strategy 1: trust the pre-parsed payload.
    if let Some(value) = parsed {
        return value;
    }

    // Strategy 2: non-string values are already structured.
    let text = match raw {
        Value::String(s) => s,
        other => return other,
    };

    let trimmed = text.trim().trim_matches('"');

    // Strategy 3: strict parse.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }

    // Strategy 4: window extraction.
    if let Some(value) = extract_json_window(trimmed) {
        return value;
    }

    // Strategy 5: model-assisted repair.
    if let Some(llm) = repair {
        match llm_repair(trimmed, llm).await {
            Some(value) => return value,
            None => {
                tracing::debug!("json repair produced nothing usable");
            }
        }
    }

    // Strategy 6: surrender the trimmed text.
    tracing::warn!("all parse strategies failed, returning raw text");
    Value::String(trimmed.to_string())
}

/// Find the first parseable JSON array or object window in `text`.
///
/// Greedy matching captures nested structures whole; when the greedy window
/// is not valid JSON the shortest match within the same window is tried.
fn extract_json_window(text: &str) -> Option<Value> {
    for (greedy, nongreedy) in window_patterns() {
        for pattern in [greedy, nongreedy] {
            if let Some(m) = pattern.find(text) {
                if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
                    return Some(value);
                }
            }
        }
    }
    None
}

async fn llm_repair(malformed: &str, llm: &dyn LlmBackend) -> Option<Value> {
    let capped: String = malformed.chars().take(REPAIR_INPUT_CAP).collect();
    let request = CompletionRequest {
        system: REPAIR_SYSTEM.to_string(),
        user: format!(
            "The following text was supposed to be valid JSON but is malformed. \
             Extract the data and return ONLY valid JSON. No explanation.\n\n\
             Malformed input:\n{capped}"
        ),
        temperature: 0.0,
        max_tokens: 1024,
    };

    let reply = match llm.complete(&request).await {
        Ok(r) => r.text,
        Err(e) => {
            tracing::debug!(error = %e, "json repair call failed");
            return None;
        }
    };

    let trimmed = reply.trim().trim_matches('"');
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    extract_json_window(trimmed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
