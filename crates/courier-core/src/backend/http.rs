//! Live service clients.
//!
//! Both external services speak JSON over HTTP. The LLM client follows the
//! provider's message-list invoke shape; the browser client talks to the
//! agent gateway's session/act endpoints. Credentials come from the
//! environment (see the binary's settings).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ActRequest, ActResponse, BackendError, BrowserBackend, CompletionRequest,
    CompletionResponse, LlmBackend, SessionHandle,
};

// ---------------------------------------------------------------------------
// LLM client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct InvokeBody<'a> {
    messages: Vec<Message<'a>>,
    system: Vec<TextBlock<'a>>,
    #[serde(rename = "inferenceConfig")]
    inference_config: InferenceConfig,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<TextBlock<'a>>,
}

#[derive(Serialize)]
struct TextBlock<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct InferenceConfig {
    #[serde(rename = "maxTokens")]
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct InvokeReply {
    output: InvokeOutput,
}

#[derive(Deserialize)]
struct InvokeOutput {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Vec<ReplyBlock>,
}

#[derive(Deserialize)]
struct ReplyBlock {
    text: String,
}

/// HTTP client for the external LLM reasoning service.
pub struct HttpLlm {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpLlm {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmBackend for HttpLlm {
    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.endpoint.is_empty()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError> {
        if !self.is_configured() {
            return Err(BackendError::Unconfigured);
        }

        let body = InvokeBody {
            messages: vec![Message {
                role: "user",
                content: vec![TextBlock {
                    text: &request.user,
                }],
            }],
            system: vec![TextBlock {
                text: &request.system,
            }],
            inference_config: InferenceConfig {
                max_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        };

        let url = format!("{}/model/{}/invoke", self.endpoint.trim_end_matches('/'), self.model);
        let reply = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<InvokeReply>()
            .await?;

        let text = reply
            .output
            .message
            .content
            .into_iter()
            .next()
            .map(|b| b.text)
            .ok_or_else(|| BackendError::Protocol("model reply had no content".to_string()))?;

        Ok(CompletionResponse { text })
    }
}

// ---------------------------------------------------------------------------
// Browser-agent client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct OpenSessionBody<'a> {
    starting_page: &'a str,
    headless: bool,
}

#[derive(Deserialize)]
struct OpenSessionReply {
    session_id: String,
}

#[derive(Serialize)]
struct AgentActBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a Value>,
}

#[derive(Deserialize)]
struct AgentActReply {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    parsed_response: Option<Value>,
    #[serde(default)]
    steps_taken: Option<u32>,
    /// Error class name when the agent gave up (e.g. `ActExceededMaxSteps`).
    #[serde(default)]
    error_kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the external browser-agent gateway.
pub struct HttpBrowser {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    headless: bool,
}

impl HttpBrowser {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, headless: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            headless,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl BrowserBackend for HttpBrowser {
    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.endpoint.is_empty()
    }

    async fn open_session(&self, start_url: &str) -> Result<SessionHandle, BackendError> {
        if !self.is_configured() {
            return Err(BackendError::Unconfigured);
        }

        let reply = self
            .client
            .post(self.url("/sessions"))
            .bearer_auth(&self.api_key)
            .json(&OpenSessionBody {
                starting_page: start_url,
                headless: self.headless,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<OpenSessionReply>()
            .await?;

        Ok(SessionHandle {
            id: reply.session_id,
            domain: start_url.to_string(),
        })
    }

    async fn close_session(&self, session: &SessionHandle) {
        let result = self
            .client
            .delete(self.url(&format!("/sessions/{}", session.id)))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(session_id = %session.id, error = %e, "failed to close browser session");
        }
    }

    async fn act(
        &self,
        session: Option<&SessionHandle>,
        request: &ActRequest,
    ) -> Result<ActResponse, BackendError> {
        if !self.is_configured() {
            return Err(BackendError::Unconfigured);
        }

        let reply = self
            .client
            .post(self.url("/act"))
            .bearer_auth(&self.api_key)
            .json(&AgentActBody {
                session_id: session.map(|s| s.id.as_str()),
                prompt: &request.prompt,
                schema: request.schema.as_ref(),
            })
            .send()
            .await?
            .error_for_status()?
            .json::<AgentActReply>()
            .await?;

        if let Some(kind) = reply.error_kind {
            return Err(BackendError::Agent {
                kind,
                message: reply.error.unwrap_or_else(|| "agent error".to_string()),
            });
        }

        Ok(ActResponse {
            response: reply.response,
            parsed: reply.parsed_response,
            steps_taken: reply.steps_taken,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_clients_report_it() {
        let llm = HttpLlm::new("", "", "nova-lite");
        assert!(!llm.is_configured());

        let browser = HttpBrowser::new("https://agent.example.com", "", true);
        assert!(!browser.is_configured());

        let configured = HttpBrowser::new("https://agent.example.com", "key", true);
        assert!(configured.is_configured());
    }

    #[tokio::test]
    async fn unconfigured_llm_fails_fast() {
        let llm = HttpLlm::new("", "", "nova-lite");
        let err = llm
            .complete(&CompletionRequest {
                system: "s".to_string(),
                user: "u".to_string(),
                temperature: 0.0,
                max_tokens: 16,
            })
            .await;
        assert!(matches!(err, Err(BackendError::Unconfigured)));
    }
}
