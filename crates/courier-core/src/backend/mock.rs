//! Deterministic stand-in backends used when the external services are
//! unconfigured (local dev, CI). They answer through the same traits as the
//! live services so nothing upstream branches on "mock mode".

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use courier_store::models::Action;

use super::{
    ActRequest, ActResponse, BackendError, BrowserBackend, CompletionRequest,
    CompletionResponse, LlmBackend, SessionHandle,
};

fn catalogue() -> &'static [Value] {
    static PRODUCTS: OnceLock<Vec<Value>> = OnceLock::new();
    PRODUCTS.get_or_init(|| {
        vec![
            json!({"name": "ASUS TUF Gaming A15", "price": 749.99, "rating": 4.5, "source": "amazon.com"}),
            json!({"name": "Lenovo IdeaPad Gaming 3", "price": 699.99, "rating": 4.3, "source": "amazon.com"}),
            json!({"name": "Acer Nitro V 15", "price": 779.99, "rating": 4.4, "source": "amazon.com"}),
            json!({"name": "HP Victus 15", "price": 599.99, "rating": 4.2, "source": "bestbuy.com"}),
            json!({"name": "Dell G15 Gaming", "price": 749.99, "rating": 4.3, "source": "bestbuy.com"}),
            json!({"name": "MSI Thin 15", "price": 699.99, "rating": 4.1, "source": "bestbuy.com"}),
            json!({"name": "ASUS TUF Gaming A16", "price": 789.99, "rating": 4.6, "source": "newegg.com"}),
            json!({"name": "Lenovo LOQ 15", "price": 729.99, "rating": 4.4, "source": "newegg.com"}),
            json!({"name": "Acer Aspire 5 Gaming", "price": 649.99, "rating": 4.0, "source": "newegg.com"}),
        ]
    })
}

fn rating(p: &Value) -> f64 {
    p.get("rating").and_then(Value::as_f64).unwrap_or(0.0)
}

fn price(p: &Value) -> f64 {
    p.get("price").and_then(Value::as_f64).unwrap_or(0.0)
}

fn products_for_domain(domain: &str) -> Vec<Value> {
    let matched: Vec<Value> = catalogue()
        .iter()
        .filter(|p| p.get("source").and_then(Value::as_str) == Some(domain))
        .cloned()
        .collect();
    if matched.is_empty() {
        catalogue().iter().take(3).cloned().collect()
    } else {
        matched
    }
}

fn ranked_catalogue() -> Vec<Value> {
    let mut all: Vec<Value> = catalogue().to_vec();
    all.sort_by(|a, b| {
        rating(b)
            .partial_cmp(&rating(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                price(a)
                    .partial_cmp(&price(b))
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    all
}

fn strip_www(target: &str) -> String {
    target
        .replace("https://www.", "")
        .replace("http://www.", "")
        .trim_end_matches('/')
        .to_string()
}

async fn jitter() {
    let millis = rand::random_range(100..300);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

/// Mock browser agent with a small fixed product catalogue per domain.
pub struct MockBrowser {
    configured: bool,
    counter: AtomicU64,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self {
            configured: true,
            counter: AtomicU64::new(0),
        }
    }

    /// A browser backend that reports itself unconfigured; the session pool
    /// hands out no sessions for it.
    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserBackend for MockBrowser {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn open_session(&self, start_url: &str) -> Result<SessionHandle, BackendError> {
        if !self.configured {
            return Err(BackendError::Unconfigured);
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(SessionHandle {
            id: format!("mock-session-{n}"),
            domain: strip_www(start_url),
        })
    }

    async fn close_session(&self, _session: &SessionHandle) {}

    async fn act(
        &self,
        _session: Option<&SessionHandle>,
        request: &ActRequest,
    ) -> Result<ActResponse, BackendError> {
        if !self.configured {
            return Err(BackendError::Unconfigured);
        }
        jitter().await;

        let domain = strip_www(&request.target);
        let parsed = match request.action {
            Action::Navigate => json!({"page_title": format!("Homepage — {}", request.target)}),
            Action::Search => {
                let products = products_for_domain(&domain);
                json!({"products": products, "results_count": products.len()})
            }
            Action::Extract => json!({"extracted": products_for_domain(&domain)}),
            _ => json!({"message": format!("Executed {} on {}", request.action, request.target)}),
        };

        Ok(ActResponse {
            response: None,
            parsed: Some(parsed),
            steps_taken: Some(1),
        })
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Mock reasoning service. Recognizes the executor's system prompts and
/// answers with the same JSON shapes the live model is asked for.
pub struct MockLlm;

impl MockLlm {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull the context JSON out of the executor's user message.
fn context_from_user(user: &str) -> Value {
    const MARKER: &str = "Data from prior steps:\n";
    user.find(MARKER)
        .and_then(|i| serde_json::from_str(&user[i + MARKER.len()..]).ok())
        .unwrap_or(Value::Array(vec![]))
}

#[async_trait]
impl LlmBackend for MockLlm {
    fn is_configured(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        jitter().await;

        let best = ranked_catalogue().into_iter().next().unwrap_or(Value::Null);
        let reply = if request.system.contains("data analyst") {
            json!({
                "ranked": context_from_user(&request.user),
                "analysis": "Mock comparison: items ranked by available data.",
            })
        } else if request.system.contains("research summarizer") {
            json!({
                "summary": "Mock summary of collected research data.",
                "highlights": ["Finding 1", "Finding 2", "Finding 3"],
                "recommendation": format!(
                    "Based on mock data, {} is recommended.",
                    best.get("name").and_then(Value::as_str).unwrap_or("the first result")
                ),
            })
        } else if request.system.contains("ranking engine") {
            json!({
                "ranked": ranked_catalogue(),
                "criteria": "rating desc, price asc",
            })
        } else if request.system.contains("research analyst") {
            json!({
                "findings": ["Mock finding"],
                "patterns": "none observed",
                "gaps": [],
            })
        } else if request.system.contains("JSON repair") {
            // Not JSON on purpose: the parser must fall through to its
            // raw-text strategy instead of trusting a canned repair.
            return Ok(CompletionResponse {
                text: "mock model cannot repair JSON".to_string(),
            });
        } else {
            // Planner prompts: a mock model cannot plan, so reply with
            // something that is not a step array and let the caller's
            // heuristic fallback take over.
            json!({"note": "mock reply"})
        };

        Ok(CompletionResponse {
            text: reply.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn act_request(action: Action, target: &str) -> ActRequest {
        ActRequest {
            action,
            prompt: "test".to_string(),
            target: target.to_string(),
            schema: None,
        }
    }

    #[tokio::test]
    async fn extract_returns_domain_products() {
        let browser = MockBrowser::new();
        let resp = browser
            .act(None, &act_request(Action::Extract, "https://www.amazon.com"))
            .await
            .unwrap();
        let parsed = resp.parsed.unwrap();
        let extracted = parsed["extracted"].as_array().unwrap();
        assert!(!extracted.is_empty());
        for p in extracted {
            assert_eq!(p["source"], "amazon.com");
        }
    }

    #[tokio::test]
    async fn search_reports_result_count() {
        let browser = MockBrowser::new();
        let resp = browser
            .act(None, &act_request(Action::Search, "https://www.bestbuy.com"))
            .await
            .unwrap();
        let parsed = resp.parsed.unwrap();
        assert_eq!(
            parsed["results_count"].as_u64().unwrap() as usize,
            parsed["products"].as_array().unwrap().len()
        );
    }

    #[tokio::test]
    async fn unknown_domain_still_yields_products() {
        let browser = MockBrowser::new();
        let resp = browser
            .act(None, &act_request(Action::Extract, "https://www.example.org"))
            .await
            .unwrap();
        let parsed = resp.parsed.unwrap();
        assert_eq!(parsed["extracted"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unconfigured_browser_rejects() {
        let browser = MockBrowser::unconfigured();
        assert!(!browser.is_configured());
        let err = browser.open_session("https://www.amazon.com").await;
        assert!(matches!(err, Err(BackendError::Unconfigured)));
    }

    #[tokio::test]
    async fn sessions_get_unique_ids() {
        let browser = MockBrowser::new();
        let a = browser.open_session("https://www.amazon.com").await.unwrap();
        let b = browser.open_session("https://www.amazon.com").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.domain, "amazon.com");
    }

    #[tokio::test]
    async fn llm_compare_echoes_context() {
        let llm = MockLlm::new();
        let context = json!([{"name": "X"}]);
        let resp = llm
            .complete(&CompletionRequest {
                system: "You are a data analyst. Compare things.".to_string(),
                user: format!("Task: compare\n\nData from prior steps:\n{context}"),
                temperature: 0.2,
                max_tokens: 2048,
            })
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&resp.text).unwrap();
        assert_eq!(parsed["ranked"], context);
    }

    #[tokio::test]
    async fn llm_summarize_shape() {
        let llm = MockLlm::new();
        let resp = llm
            .complete(&CompletionRequest {
                system: "You are a research summarizer.".to_string(),
                user: "Task: summarize\n\nData from prior steps:\n[]".to_string(),
                temperature: 0.2,
                max_tokens: 2048,
            })
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&resp.text).unwrap();
        assert!(parsed["summary"].is_string());
        assert!(parsed["recommendation"].is_string());
        assert!(parsed["highlights"].is_array());
    }

    #[tokio::test]
    async fn llm_unknown_prompt_is_not_a_step_array() {
        let llm = MockLlm::new();
        let resp = llm
            .complete(&CompletionRequest {
                system: "You are an autonomous task planner.".to_string(),
                user: "find a laptop".to_string(),
                temperature: 0.2,
                max_tokens: 2048,
            })
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&resp.text).unwrap();
        assert!(!parsed.is_array());
    }
}
