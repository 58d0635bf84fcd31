//! Step executor: dispatches one step to the right backend with retry,
//! circuit breaking, and cost accounting.
//!
//! Browser steps get a short, focused instruction; search actions on known
//! retail sites navigate straight to the results URL rather than fighting
//! through the site's search UI. LLM steps get a per-action system prompt
//! plus the collected context from completed dependencies.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use courier_store::models::{Action, ExecutorKind, Step};

use crate::backend::{ActRequest, BackendError, BrowserBackend, CompletionRequest, LlmBackend};
use crate::breaker::ServiceBreakers;
use crate::cost::{estimate_browser_cost, estimate_llm_cost};
use crate::parse::parse_result;
use crate::session::SessionPool;

/// Error kinds that will fail the same way every time; retrying is wasted.
const NO_RETRY_PATTERNS: &[&str] = &["ExceededMaxSteps", "ActExceededMaxSteps"];

/// Direct search URL templates for known sites. Bypasses popups, overlays,
/// and bot detection that block the agent from using the site search UI.
fn search_url_templates() -> &'static [(&'static str, &'static str)] {
    &[
        ("amazon.com", "https://www.amazon.com/s?k={q}"),
        ("bestbuy.com", "https://www.bestbuy.com/site/searchpage.jsp?st={q}"),
        ("newegg.com", "https://www.newegg.com/p/pl?d={q}"),
        ("walmart.com", "https://www.walmart.com/search?q={q}"),
        ("ebay.com", "https://www.ebay.com/sch/i.html?_nkw={q}"),
        ("target.com", "https://www.target.com/s?searchTerm={q}"),
    ]
}

fn default_llm_system() -> &'static str {
    "You are a helpful AI assistant. Process the provided data according to the \
     instructions. Reply ONLY with JSON."
}

/// Per-action system prompts for LLM steps.
fn system_prompt_for(action: Action) -> &'static str {
    match action {
        Action::Compare => {
            "You are a data analyst. You will receive extracted data from multiple sources. \
             Compare the items and rank them. Consider price, ratings, features, and value. \
             Reply with a JSON object containing:\n\
             \x20 - \"ranked\": array of items sorted best to worst\n\
             \x20 - \"analysis\": brief text explaining the ranking\n\
             Reply ONLY with JSON."
        }
        Action::Summarize => {
            "You are a research summarizer. You will receive data and analysis from prior steps. \
             Produce a clear, actionable summary with specific recommendations. \
             Reply with a JSON object containing:\n\
             \x20 - \"summary\": a 2-4 sentence summary with the top recommendation\n\
             \x20 - \"highlights\": array of key findings (3-5 items)\n\
             \x20 - \"recommendation\": the single best option with reasoning\n\
             Reply ONLY with JSON."
        }
        Action::Analyze => {
            "You are a research analyst. Analyze the provided data and extract insights. \
             Reply with a JSON object containing:\n\
             \x20 - \"findings\": array of key insights\n\
             \x20 - \"patterns\": any patterns you noticed\n\
             \x20 - \"gaps\": any missing information\n\
             Reply ONLY with JSON."
        }
        Action::Rank => {
            "You are a ranking engine. Rank the provided items by the criteria in the \
             description. Reply with a JSON object containing:\n\
             \x20 - \"ranked\": array of items sorted best to worst with scores\n\
             \x20 - \"criteria\": the criteria used for ranking\n\
             Reply ONLY with JSON."
        }
        _ => default_llm_system(),
    }
}

/// Extraction schema handed to the agent for structured actions.
pub fn schema_for_action(action: Action) -> Option<Value> {
    match action {
        Action::Extract => Some(json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "price": {"type": "number"},
                    "rating": {"type": "number"},
                    "url": {"type": "string"},
                    "source": {"type": "string"},
                },
                "required": ["name"],
            },
        })),
        Action::Search => Some(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "results_count": {"type": "integer"},
            },
        })),
        _ => None,
    }
}

fn strip_site(target: &str) -> String {
    target
        .replace("https://www.", "")
        .replace("http://www.", "")
        .trim_end_matches('/')
        .to_string()
}

/// Pull the raw search terms out of the planner's description.
fn extract_search_query(step: &Step) -> String {
    let mut desc = step.description.clone();
    let site = strip_site(&step.target);

    for prefix in ["Search for ", "Search "] {
        if let Some(rest) = desc.strip_prefix(prefix) {
            desc = rest.to_string();
            break;
        }
    }
    for suffix in [format!(" on {site}"), format!(" on {}", step.target)] {
        if desc.to_lowercase().ends_with(&suffix.to_lowercase()) {
            desc.truncate(desc.len() - suffix.len());
            break;
        }
    }
    desc.trim().to_string()
}

/// Direct search-results URL for a known site, else `None`.
fn search_url_for(target: &str, query: &str) -> Option<String> {
    let domain = strip_site(target);
    search_url_templates()
        .iter()
        .find(|(site, _)| *site == domain)
        .map(|(_, template)| template.replace("{q}", &urlencoding::encode(query)))
}

/// Build the short instruction sent to the browser agent.
fn build_browser_prompt(step: &Step) -> String {
    match step.action {
        Action::Navigate => format!("Go to {}", step.target),
        Action::Search => {
            let query = extract_search_query(step);
            match search_url_for(&step.target, &query) {
                // Skip the UI entirely, straight to results.
                Some(url) => format!("Go to {url}"),
                None => format!("Use the site search to find: {query}"),
            }
        }
        Action::Extract => {
            "Extract the product names, prices, and ratings visible on this page".to_string()
        }
        _ => step.description.clone(),
    }
}

/// Outcome of executing one step, retries included. Never an Err: failures
/// are data, and the scheduler records them without aborting siblings.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub payload: Option<Value>,
    pub error: Option<String>,
    pub cost_usd: f64,
    pub retries: u32,
}

impl StepOutcome {
    fn failed(error: String, retries: u32) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error),
            cost_usd: 0.0,
            retries,
        }
    }
}

pub struct StepExecutor {
    browser: Arc<dyn BrowserBackend>,
    llm: Arc<dyn LlmBackend>,
    breakers: ServiceBreakers,
    browser_timeout: Duration,
}

impl StepExecutor {
    pub fn new(
        browser: Arc<dyn BrowserBackend>,
        llm: Arc<dyn LlmBackend>,
        breakers: ServiceBreakers,
        browser_timeout: Duration,
    ) -> Self {
        Self {
            browser,
            llm,
            breakers,
            browser_timeout,
        }
    }

    pub fn browser_backend(&self) -> &Arc<dyn BrowserBackend> {
        &self.browser
    }

    pub fn llm_backend(&self) -> &Arc<dyn LlmBackend> {
        &self.llm
    }

    /// Execute one step with retry and exponential backoff.
    ///
    /// `context` is the ordered list of completed dependency results for
    /// LLM steps; browser steps ignore it.
    pub async fn execute(
        &self,
        step: &Step,
        context: &[Value],
        pool: &SessionPool,
    ) -> StepOutcome {
        let mut last_error = String::from("unknown error");
        let mut attempts_made = 0;

        for attempt in 0..=step.max_retries {
            let breaker = match step.executor {
                ExecutorKind::Browser => &self.breakers.browser,
                ExecutorKind::Llm => &self.breakers.llm,
            };

            let permit = match breaker.admit() {
                Ok(permit) => permit,
                Err(open) => {
                    // Fast-fail: surface the breaker error verbatim, no retry.
                    tracing::warn!(
                        step_id = %step.id,
                        breaker = %open.name,
                        "step rejected by open circuit"
                    );
                    return StepOutcome::failed(open.to_string(), attempt);
                }
            };

            let result = match step.executor {
                ExecutorKind::Browser => self.attempt_browser(step, pool).await,
                ExecutorKind::Llm => self.attempt_llm(step, context).await,
            };

            match result {
                Ok(payload) => {
                    permit.success();
                    let cost = payload
                        .get("cost_usd")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    tracing::info!(
                        step_id = %step.id,
                        action = %step.action,
                        attempt = attempt + 1,
                        "step executed"
                    );
                    return StepOutcome {
                        success: true,
                        payload: Some(payload),
                        error: None,
                        cost_usd: cost,
                        retries: attempt,
                    };
                }
                Err(e) => {
                    permit.failure();
                    attempts_made = attempt + 1;
                    last_error = format_backend_error(&e);

                    let kind = e.kind().to_string();
                    if NO_RETRY_PATTERNS.iter().any(|pat| kind.contains(pat)) {
                        tracing::error!(
                            step_id = %step.id,
                            action = %step.action,
                            target = %step.target,
                            kind = %kind,
                            "step failed with non-retryable error"
                        );
                        break;
                    }

                    if attempt < step.max_retries {
                        let wait = Duration::from_secs(1u64 << attempt.min(16));
                        tracing::warn!(
                            step_id = %step.id,
                            attempt = attempt + 1,
                            error = %last_error,
                            wait_secs = wait.as_secs(),
                            "step attempt failed, retrying"
                        );
                        tokio::time::sleep(wait).await;
                    } else {
                        tracing::error!(
                            step_id = %step.id,
                            action = %step.action,
                            target = %step.target,
                            attempts = attempts_made,
                            error = %last_error,
                            "step failed after all attempts"
                        );
                    }
                }
            }
        }

        StepOutcome::failed(last_error, attempts_made)
    }

    async fn attempt_browser(
        &self,
        step: &Step,
        pool: &SessionPool,
    ) -> Result<Value, BackendError> {
        let request = ActRequest {
            action: step.action,
            prompt: build_browser_prompt(step),
            target: step.target.clone(),
            schema: schema_for_action(step.action),
        };
        tracing::debug!(step_id = %step.id, prompt = %request.prompt, "browser prompt");

        let session = pool.acquire(&step.target).await;
        let acted = tokio::time::timeout(
            self.browser_timeout,
            self.browser.act(session.as_ref(), &request),
        )
        .await;
        pool.release(&step.target);

        let response = match acted {
            Ok(result) => result?,
            Err(_elapsed) => {
                return Err(BackendError::Agent {
                    kind: "Timeout".to_string(),
                    message: format!(
                        "browser call exceeded {}s budget",
                        self.browser_timeout.as_secs()
                    ),
                });
            }
        };

        let mut payload = json!({
            "success": true,
            "url": step.target,
            "cost_usd": estimate_browser_cost(),
            "executor": "browser",
        });

        if response.parsed.is_some() || response.response.is_some() {
            let raw = response
                .response
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null);
            let parsed = parse_result(raw, response.parsed.clone(), Some(&*self.llm)).await;
            payload["response"] = parsed;
        }
        if let Some(n) = response.steps_taken {
            payload["steps_taken"] = json!(n);
        }

        Ok(payload)
    }

    async fn attempt_llm(&self, step: &Step, context: &[Value]) -> Result<Value, BackendError> {
        let context_json = serde_json::to_string_pretty(&Value::Array(context.to_vec()))
            .unwrap_or_else(|_| "[]".to_string());
        let request = CompletionRequest {
            system: system_prompt_for(step.action).to_string(),
            user: format!(
                "Task: {}\n\nData from prior steps:\n{context_json}",
                step.description
            ),
            temperature: 0.2,
            max_tokens: 2048,
        };

        let reply = self.llm.complete(&request).await?;
        let parsed = parse_result(Value::String(reply.text.clone()), None, Some(&*self.llm)).await;

        Ok(json!({
            "success": true,
            "response": parsed,
            "raw_text": reply.text,
            "cost_usd": estimate_llm_cost(&request.user, &reply.text),
            "executor": "llm",
        }))
    }
}

fn format_backend_error(e: &BackendError) -> String {
    match e {
        BackendError::Agent { .. } => e.to_string(),
        BackendError::Transport(inner) => format!("Transport: {inner}"),
        BackendError::Protocol(msg) => format!("Protocol: {msg}"),
        BackendError::Unconfigured => "Unconfigured: backend not configured".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
