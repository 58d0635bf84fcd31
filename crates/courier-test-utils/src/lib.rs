//! Shared test fixtures for courier integration tests.
//!
//! Provides scripted browser/LLM backends with controllable failure modes,
//! a fully wired [`Pipeline`] factory, and an event collector that drains a
//! broadcaster subscription until the terminal event.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use courier_core::backend::mock::{MockBrowser, MockLlm};
use courier_core::backend::{
    ActRequest, ActResponse, BackendError, BrowserBackend, LlmBackend, SessionHandle,
};
use courier_core::breaker::ServiceBreakers;
use courier_core::events::{EventBroadcaster, Subscription};
use courier_core::executor::StepExecutor;
use courier_core::pipeline::{Pipeline, PipelineConfig};
use courier_core::planner::PlannerAdapter;
use courier_store::TaskStore;
use courier_store::models::{EventKind, TaskEvent};

/// A browser agent that fails its first `fail_first` act calls with a
/// retryable error, then behaves like [`MockBrowser`].
pub struct FlakyBrowser {
    fail_first: u32,
    calls: AtomicU32,
    inner: MockBrowser,
}

impl FlakyBrowser {
    pub fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: AtomicU32::new(0),
            inner: MockBrowser::new(),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserBackend for FlakyBrowser {
    fn is_configured(&self) -> bool {
        true
    }

    async fn open_session(&self, start_url: &str) -> Result<SessionHandle, BackendError> {
        self.inner.open_session(start_url).await
    }

    async fn close_session(&self, session: &SessionHandle) {
        self.inner.close_session(session).await;
    }

    async fn act(
        &self,
        session: Option<&SessionHandle>,
        request: &ActRequest,
    ) -> Result<ActResponse, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(BackendError::Agent {
                kind: "FlakyNetwork".to_string(),
                message: format!("injected failure {call}"),
            });
        }
        self.inner.act(session, request).await
    }
}

/// A browser agent where every act call fails with the given error kind.
pub struct BrokenBrowser {
    pub kind: String,
    calls: AtomicU32,
}

impl BrokenBrowser {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserBackend for BrokenBrowser {
    fn is_configured(&self) -> bool {
        true
    }

    async fn open_session(&self, start_url: &str) -> Result<SessionHandle, BackendError> {
        Ok(SessionHandle {
            id: "broken".to_string(),
            domain: start_url.to_string(),
        })
    }

    async fn close_session(&self, _session: &SessionHandle) {}

    async fn act(
        &self,
        _session: Option<&SessionHandle>,
        _request: &ActRequest,
    ) -> Result<ActResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Agent {
            kind: self.kind.clone(),
            message: "forced failure".to_string(),
        })
    }
}

/// A browser agent that succeeds after an artificial delay, for
/// cancellation and ordering tests.
pub struct SlowBrowser {
    pub delay: Duration,
    inner: MockBrowser,
}

impl SlowBrowser {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: MockBrowser::new(),
        }
    }
}

#[async_trait]
impl BrowserBackend for SlowBrowser {
    fn is_configured(&self) -> bool {
        true
    }

    async fn open_session(&self, start_url: &str) -> Result<SessionHandle, BackendError> {
        self.inner.open_session(start_url).await
    }

    async fn close_session(&self, session: &SessionHandle) {
        self.inner.close_session(session).await;
    }

    async fn act(
        &self,
        session: Option<&SessionHandle>,
        request: &ActRequest,
    ) -> Result<ActResponse, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.act(session, request).await
    }
}

/// An LLM that always replies with the same fixed text.
pub struct ScriptedLlm(pub String);

#[async_trait]
impl LlmBackend for ScriptedLlm {
    fn is_configured(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        _request: &courier_core::backend::CompletionRequest,
    ) -> Result<courier_core::backend::CompletionResponse, BackendError> {
        Ok(courier_core::backend::CompletionResponse {
            text: self.0.clone(),
        })
    }
}

/// Build a fully wired pipeline over the given backends with an in-memory
/// store and a fresh breaker pair.
pub fn build_pipeline(
    browser: Arc<dyn BrowserBackend>,
    llm: Arc<dyn LlmBackend>,
) -> Arc<Pipeline> {
    let store = Arc::new(TaskStore::in_memory());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let planner = PlannerAdapter::new(Arc::clone(&llm));
    let executor = Arc::new(StepExecutor::new(
        Arc::clone(&browser),
        llm,
        ServiceBreakers::new(),
        Duration::from_secs(10),
    ));

    Arc::new(Pipeline::new(
        store,
        broadcaster,
        planner,
        executor,
        browser,
        PipelineConfig {
            max_sessions: 3,
            browser_timeout: Duration::from_secs(10),
        },
    ))
}

/// Pipeline over the default mock backends.
pub fn mock_pipeline() -> Arc<Pipeline> {
    build_pipeline(Arc::new(MockBrowser::new()), Arc::new(MockLlm::new()))
}

/// Drain a subscription until `task_done` (or the stream closes), with a
/// guard timeout so a broken pipeline fails the test instead of hanging it.
pub async fn collect_until_done(mut subscription: Subscription) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    let deadline = Duration::from_secs(60);

    loop {
        match tokio::time::timeout(deadline, subscription.recv()).await {
            Ok(Some(event)) => {
                let done = event.kind == EventKind::TaskDone;
                events.push(event);
                if done {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for task_done; got {} events", events.len()),
        }
    }
    events
}

/// Ordered list of event kinds, convenient for sequence assertions.
pub fn kinds(events: &[TaskEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// The `data` payloads of all events of one kind.
pub fn data_of(events: &[TaskEvent], kind: EventKind) -> Vec<serde_json::Value> {
    events
        .iter()
        .filter(|e| e.kind == kind)
        .map(|e| e.data.clone())
        .collect()
}

/// A browser agent whose act calls echo which step ran, for assertions on
/// scheduling order without real work.
pub struct RecordingBrowser {
    pub log: std::sync::Mutex<Vec<String>>,
    inner: MockBrowser,
}

impl RecordingBrowser {
    pub fn new() -> Self {
        Self {
            log: std::sync::Mutex::new(Vec::new()),
            inner: MockBrowser::new(),
        }
    }

    pub fn recorded(&self) -> Vec<String> {
        self.log.lock().expect("log lock poisoned").clone()
    }
}

impl Default for RecordingBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserBackend for RecordingBrowser {
    fn is_configured(&self) -> bool {
        true
    }

    async fn open_session(&self, start_url: &str) -> Result<SessionHandle, BackendError> {
        self.inner.open_session(start_url).await
    }

    async fn close_session(&self, session: &SessionHandle) {
        self.inner.close_session(session).await;
    }

    async fn act(
        &self,
        session: Option<&SessionHandle>,
        request: &ActRequest,
    ) -> Result<ActResponse, BackendError> {
        self.log
            .lock()
            .expect("log lock poisoned")
            .push(format!("{} {}", request.action, request.target));
        self.inner.act(session, request).await
    }
}
