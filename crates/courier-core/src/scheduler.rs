//! DAG scheduler: runs a plan's independent branches in parallel.
//!
//! Each tick computes the ready set (pending steps whose dependencies all
//! completed), launches a worker per ready step, then waits for the *first*
//! completion before rescanning. A failed step never cancels its siblings;
//! it only skips its own dependents, transitively.
//!
//! ```text
//! 1. Skip-cascade and collect ready steps (scan shrinks the pending set)
//! 2. Launch workers for ready steps, emitting step_started
//! 3. Nothing running? Done.
//! 4. Wait for one completion; record it, emit step_completed/step_failed
//! 5. Repeat
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use courier_store::models::{EventKind, ExecutorKind, Plan, StepStatus, TaskEvent};

use crate::events::EventBroadcaster;
use crate::executor::{StepExecutor, StepOutcome};
use crate::session::SessionPool;

/// How long a cancelled run waits for in-flight steps before abandoning them.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Counts and artifacts from one plan execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Results of completed steps in completion order.
    pub completed_results: Vec<(String, Value)>,
    pub failed_ids: Vec<String>,
}

/// Message sent from a step worker back to the scheduling loop.
struct StepDone {
    step_id: String,
    outcome: StepOutcome,
}

/// Execute a plan to quiescence, mutating its steps in place.
pub async fn run_plan(
    plan: &mut Plan,
    executor: &Arc<StepExecutor>,
    pool: &Arc<SessionPool>,
    broadcaster: &EventBroadcaster,
    cancel: &CancellationToken,
) -> ExecutionSummary {
    let task_id = plan.task_id.clone();
    let total = plan.steps.len();

    let mut pending: HashSet<String> = plan.steps.iter().map(|s| s.id.clone()).collect();
    // Completed results in completion order; LLM steps without explicit
    // dependencies consume the whole list as context.
    let mut completed: Vec<(String, Value)> = Vec::new();
    let mut completed_ids: HashSet<String> = HashSet::new();
    // Failed and skipped ids; dependents of anything here get skipped.
    let mut broken: HashSet<String> = HashSet::new();

    let (tx, mut rx) = mpsc::channel::<StepDone>(total.max(1));
    let mut handles: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        if cancel.is_cancelled() {
            drain_cancelled(plan, &mut handles, &mut rx, &mut completed, &mut completed_ids)
                .await;
            break;
        }

        let ready = ready_scan(plan, &mut pending, &completed_ids, &mut broken);

        for step_id in ready {
            let step = plan
                .steps
                .iter_mut()
                .find(|s| s.id == step_id)
                .expect("ready step must exist");
            step.mark_running();
            tracing::info!(
                task_id = %task_id,
                step_id = %step.id,
                action = %step.action,
                group = %step.group,
                "launching step"
            );
            broadcaster.publish(&TaskEvent::new(
                &task_id,
                EventKind::StepStarted,
                json!({
                    "step_id": step.id,
                    "action": step.action,
                    "description": step.description,
                    "group": step.group,
                    "executor": step.executor,
                }),
            ));

            let context = collect_context(step.executor, &step.depends_on, &completed);
            let step_clone = step.clone();
            let executor = Arc::clone(executor);
            let pool = Arc::clone(pool);
            let tx = tx.clone();

            let handle = tokio::spawn(async move {
                let outcome = executor.execute(&step_clone, &context, &pool).await;
                let _ = tx
                    .send(StepDone {
                        step_id: step_clone.id,
                        outcome,
                    })
                    .await;
            });
            handles.insert(step_id, handle);
        }

        if handles.is_empty() {
            break;
        }

        // Wait for the first worker to finish, or for cancellation.
        tokio::select! {
            done = rx.recv() => {
                if let Some(done) = done {
                    handles.remove(&done.step_id);
                    record_outcome(
                        plan,
                        &task_id,
                        done,
                        broadcaster,
                        &mut completed,
                        &mut completed_ids,
                        &mut broken,
                    );
                }
            }
            _ = cancel.cancelled() => {
                // Handled at the top of the next iteration.
                continue;
            }
        }
    }

    let summary = summarize(plan, total, completed, &broken);
    tracing::info!(
        task_id = %task_id,
        completed = summary.completed,
        failed = summary.failed,
        skipped = summary.skipped,
        total = summary.total,
        "plan execution complete"
    );
    summary
}

/// One pass over the pending set: cascade skips, return newly-ready steps.
///
/// Runs to a fixpoint so a skip chain (A failed, B depends on A, C depends
/// on B) resolves within one tick.
fn ready_scan(
    plan: &mut Plan,
    pending: &mut HashSet<String>,
    completed_ids: &HashSet<String>,
    broken: &mut HashSet<String>,
) -> Vec<String> {
    let mut ready: Vec<String> = Vec::new();

    loop {
        let mut changed = false;
        let mut remove: Vec<String> = Vec::new();

        for step in plan.steps.iter_mut() {
            if !pending.contains(&step.id) {
                continue;
            }
            if step.status != StepStatus::Pending {
                remove.push(step.id.clone());
                continue;
            }

            if step.depends_on.iter().any(|dep| broken.contains(dep)) {
                step.mark_skipped("dependency failed");
                broken.insert(step.id.clone());
                remove.push(step.id.clone());
                changed = true;
                tracing::info!(
                    step_id = %step.id,
                    action = %step.action,
                    "skipping step, dependency chain broken"
                );
                continue;
            }

            if step.depends_on.iter().all(|dep| completed_ids.contains(dep)) {
                ready.push(step.id.clone());
                remove.push(step.id.clone());
            }
        }

        for id in remove {
            pending.remove(&id);
        }
        if !changed {
            break;
        }
    }

    ready
}

/// Context for a step: results of its explicit dependencies in declaration
/// order. LLM steps with no explicit dependencies implicitly read every
/// result completed so far, in completion order.
fn collect_context(
    executor: ExecutorKind,
    depends_on: &[String],
    completed: &[(String, Value)],
) -> Vec<Value> {
    if depends_on.is_empty() {
        if executor == ExecutorKind::Llm {
            return completed.iter().map(|(_, v)| v.clone()).collect();
        }
        return Vec::new();
    }

    depends_on
        .iter()
        .filter_map(|dep| {
            completed
                .iter()
                .find(|(id, _)| id == dep)
                .map(|(_, v)| v.clone())
        })
        .collect()
}

fn record_outcome(
    plan: &mut Plan,
    task_id: &str,
    done: StepDone,
    broadcaster: &EventBroadcaster,
    completed: &mut Vec<(String, Value)>,
    completed_ids: &mut HashSet<String>,
    broken: &mut HashSet<String>,
) {
    let Some(step) = plan.steps.iter_mut().find(|s| s.id == done.step_id) else {
        return;
    };
    step.retries = done.outcome.retries;
    step.cost_usd = done.outcome.cost_usd;

    if done.outcome.success {
        let payload = done.outcome.payload.unwrap_or(Value::Null);
        step.mark_completed(payload.clone());
        completed.push((done.step_id.clone(), payload));
        completed_ids.insert(done.step_id.clone());
        tracing::info!(
            task_id = %task_id,
            step_id = %done.step_id,
            action = %step.action,
            group = %step.group,
            "step completed"
        );
        broadcaster.publish(&TaskEvent::new(
            task_id,
            EventKind::StepCompleted,
            json!({
                "step_id": done.step_id,
                "result": step.result,
            }),
        ));
    } else {
        let error = done
            .outcome
            .error
            .unwrap_or_else(|| "unknown error".to_string());
        step.mark_failed(error.clone());
        broken.insert(done.step_id.clone());
        tracing::error!(
            task_id = %task_id,
            step_id = %done.step_id,
            action = %step.action,
            target = %step.target,
            error = %error,
            "step failed"
        );
        broadcaster.publish(&TaskEvent::new(
            task_id,
            EventKind::StepFailed,
            json!({
                "step_id": done.step_id,
                "error": error,
            }),
        ));
    }
}

/// Cooperative cancellation: stop launching, give in-flight steps a bounded
/// window to finish, then abandon whatever is left.
async fn drain_cancelled(
    plan: &mut Plan,
    handles: &mut HashMap<String, JoinHandle<()>>,
    rx: &mut mpsc::Receiver<StepDone>,
    completed: &mut Vec<(String, Value)>,
    completed_ids: &mut HashSet<String>,
) {
    tracing::info!(task_id = %plan.task_id, in_flight = handles.len(), "cancelled, draining in-flight steps");

    let deadline = tokio::time::Instant::now() + CANCEL_DRAIN_TIMEOUT;
    while !handles.is_empty() {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(done)) => {
                handles.remove(&done.step_id);
                if let Some(step) = plan.steps.iter_mut().find(|s| s.id == done.step_id) {
                    // Results of cancelled tasks are discarded downstream,
                    // but keep the step record consistent.
                    if done.outcome.success {
                        let payload = done.outcome.payload.unwrap_or(Value::Null);
                        step.mark_completed(payload.clone());
                        completed.push((done.step_id.clone(), payload));
                        completed_ids.insert(done.step_id);
                    } else {
                        step.mark_failed(
                            done.outcome
                                .error
                                .unwrap_or_else(|| "unknown error".to_string()),
                        );
                    }
                }
            }
            _ => break,
        }
    }

    for (step_id, handle) in handles.drain() {
        handle.abort();
        if let Some(step) = plan.steps.iter_mut().find(|s| s.id == step_id) {
            if step.status == StepStatus::Running {
                step.mark_failed("cancelled");
            }
        }
        tracing::warn!(step_id = %step_id, "abandoned in-flight step after cancellation");
    }
}

fn summarize(
    plan: &Plan,
    total: usize,
    completed: Vec<(String, Value)>,
    _broken: &HashSet<String>,
) -> ExecutionSummary {
    let failed_ids: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .map(|s| s.id.clone())
        .collect();
    let skipped = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Skipped)
        .count();

    ExecutionSummary {
        total,
        completed: completed.len(),
        failed: failed_ids.len(),
        skipped,
        completed_results: completed,
        failed_ids,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
