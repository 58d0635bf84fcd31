//! Adapter interfaces for the two external services: the browser automation
//! agent and the LLM reasoning service.
//!
//! Both traits are object-safe so the executor, planner, and session pool
//! can hold `Arc<dyn ...>` and tests can substitute fakes. Live
//! implementations live in [`http`]; deterministic stand-ins used when the
//! services are unconfigured live in [`mock`].

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde_json::Value;

use courier_store::models::Action;

/// Errors surfaced by the external services.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// An error class reported by the agent itself (e.g. `ExceededMaxSteps`).
    #[error("{kind}: {message}")]
    Agent { kind: String, message: String },
    /// Network-level failure talking to the service.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The service answered with something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// No credentials / endpoint configured for this service.
    #[error("backend not configured")]
    Unconfigured,
}

impl BackendError {
    /// Short error-kind name used for retry classification.
    pub fn kind(&self) -> &str {
        match self {
            Self::Agent { kind, .. } => kind,
            Self::Transport(_) => "Transport",
            Self::Protocol(_) => "Protocol",
            Self::Unconfigured => "Unconfigured",
        }
    }
}

/// Opaque handle to one live browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub domain: String,
}

/// One instruction for the browser agent.
#[derive(Debug, Clone)]
pub struct ActRequest {
    pub action: Action,
    /// Short natural-language instruction built by the executor.
    pub prompt: String,
    pub target: String,
    /// Extraction schema for structured actions, when one applies.
    pub schema: Option<Value>,
}

/// The browser agent's reply.
#[derive(Debug, Clone, Default)]
pub struct ActResponse {
    /// Raw textual response, when the agent produced one.
    pub response: Option<String>,
    /// Schema-validated payload the agent already parsed.
    pub parsed: Option<Value>,
    /// Number of browser actions the agent took.
    pub steps_taken: Option<u32>,
}

/// One LLM invocation.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// The LLM's reply text.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
}

/// Adapter for the external browser-automation agent.
///
/// The underlying SDKs are synchronous and long-running; implementations
/// must do their blocking work off the cooperative scheduler (a worker
/// thread or an async HTTP client) so `act` never stalls the caller.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Whether credentials for the agent are present. When false the
    /// session pool hands out no sessions.
    fn is_configured(&self) -> bool;

    /// Open a session starting at `start_url`.
    async fn open_session(&self, start_url: &str) -> Result<SessionHandle, BackendError>;

    /// Close a session. Best-effort; errors are logged by implementations.
    async fn close_session(&self, session: &SessionHandle);

    /// Execute one instruction, optionally inside an existing session.
    async fn act(
        &self,
        session: Option<&SessionHandle>,
        request: &ActRequest,
    ) -> Result<ActResponse, BackendError>;
}

/// Adapter for the external LLM reasoning service.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Whether credentials for the service are present. When false the
    /// planner skips straight to its heuristic fallback.
    fn is_configured(&self) -> bool;

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError>;
}

// Compile-time assertions: both traits must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn BrowserBackend, _: &dyn LlmBackend) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_kind_and_display() {
        let err = BackendError::Agent {
            kind: "ActExceededMaxSteps".to_string(),
            message: "gave up after 30 steps".to_string(),
        };
        assert_eq!(err.kind(), "ActExceededMaxSteps");
        assert_eq!(err.to_string(), "ActExceededMaxSteps: gave up after 30 steps");
    }

    #[test]
    fn protocol_error_kind() {
        let err = BackendError::Protocol("missing output field".to_string());
        assert_eq!(err.kind(), "Protocol");
    }
}
