//! Bounded pool of reusable browser sessions, keyed by domain.
//!
//! A semaphore caps how many sessions can be active at once; steps
//! targeting the same domain share one session rather than paying the
//! browser startup cost per step. Sessions are created lazily and closed
//! only on [`SessionPool::shutdown`], which every task must call on both
//! its success and failure paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::backend::{BrowserBackend, SessionHandle};

/// Fallback starting page for non-URL targets.
const DEFAULT_START_PAGE: &str = "https://www.google.com";

/// Extract the `host[:port]` session key from a step target.
///
/// Non-URL targets (e.g. the literal `aggregated`) key by the raw string.
pub fn domain_key(target: &str) -> String {
    if !target.starts_with("http") {
        return target.to_string();
    }
    let rest = match target.split_once("://") {
        Some((_, rest)) => rest,
        None => target,
    };
    let netloc = rest.split(['/', '?', '#']).next().unwrap_or("");
    if netloc.is_empty() {
        target.to_string()
    } else {
        netloc.to_string()
    }
}

pub struct SessionPool {
    backend: Arc<dyn BrowserBackend>,
    max_sessions: usize,
    slots: Semaphore,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Serializes session creation per domain so concurrent acquires for a
    /// new domain yield exactly one session.
    creation_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionPool {
    pub fn new(backend: Arc<dyn BrowserBackend>, max_sessions: usize) -> Self {
        Self {
            backend,
            max_sessions,
            slots: Semaphore::new(max_sessions),
            sessions: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a session for `target`, blocking while the pool is full.
    ///
    /// Returns the existing session for the target's domain when there is
    /// one, otherwise creates one. Returns `None` when the browser agent is
    /// unconfigured or creation fails; the slot is still held and must be
    /// paired with [`release`](Self::release).
    pub async fn acquire(&self, target: &str) -> Option<SessionHandle> {
        let permit = self
            .slots
            .acquire()
            .await
            .expect("session pool semaphore closed");
        // Slots are released explicitly via release(), not by permit drop.
        permit.forget();

        if !self.backend.is_configured() {
            return None;
        }

        let domain = domain_key(target);
        let creation_lock = {
            let mut locks = self.creation_locks.lock().expect("creation lock poisoned");
            locks
                .entry(domain.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let _guard = creation_lock.lock().await;

        if let Some(existing) = self
            .sessions
            .lock()
            .expect("session map poisoned")
            .get(&domain)
            .cloned()
        {
            tracing::debug!(domain = %domain, "reusing browser session");
            return Some(existing);
        }

        let start_page = if target.starts_with("http") {
            target
        } else {
            DEFAULT_START_PAGE
        };

        match self.backend.open_session(start_page).await {
            Ok(handle) => {
                let mut sessions = self.sessions.lock().expect("session map poisoned");
                sessions.insert(domain.clone(), handle.clone());
                tracing::info!(
                    domain = %domain,
                    active = sessions.len(),
                    max = self.max_sessions,
                    "created browser session"
                );
                Some(handle)
            }
            Err(e) => {
                tracing::error!(domain = %domain, error = %e, "failed to create browser session");
                None
            }
        }
    }

    /// Non-blocking lookup of an existing session for `target`'s domain.
    /// Never suspends and never consumes a pool slot.
    pub fn peek(&self, target: &str) -> Option<SessionHandle> {
        let domain = domain_key(target);
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(&domain)
            .cloned()
    }

    /// Release one pool slot. Does not close the session.
    pub fn release(&self, _target: &str) {
        self.slots.add_permits(1);
    }

    /// Close every session and clear the pool. Idempotent.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, SessionHandle)> = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            sessions.drain().collect()
        };

        for (domain, handle) in drained {
            self.backend.close_session(&handle).await;
            tracing::info!(domain = %domain, "closed browser session");
        }
        tracing::debug!("session pool shutdown complete");
    }

    /// Number of currently open sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.lock().expect("session map poisoned").len()
    }

    /// Domains with an open session.
    pub fn session_domains(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
