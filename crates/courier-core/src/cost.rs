//! Cost accounting for step execution.

/// Flat cost of one browser-agent step, in USD.
const BROWSER_PER_STEP_USD: f64 = 0.002;

/// LLM token rates in USD per 1k tokens.
const LLM_INPUT_PER_1K: f64 = 0.00006;
const LLM_OUTPUT_PER_1K: f64 = 0.00024;

/// Words-to-tokens fudge factor for the estimate.
const TOKENS_PER_WORD: f64 = 1.3;

/// Estimate the cost of one LLM invocation from its prompt and reply text.
pub fn estimate_llm_cost(input_text: &str, output_text: &str) -> f64 {
    let input_tokens = input_text.split_whitespace().count() as f64 * TOKENS_PER_WORD;
    let output_tokens = output_text.split_whitespace().count() as f64 * TOKENS_PER_WORD;
    let usd =
        input_tokens / 1000.0 * LLM_INPUT_PER_1K + output_tokens / 1000.0 * LLM_OUTPUT_PER_1K;
    round6(usd)
}

/// Cost of one browser-agent step.
pub fn estimate_browser_cost() -> f64 {
    BROWSER_PER_STEP_USD
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}
