//! Pipeline driver: the end-to-end task lifecycle.
//!
//! plan -> execute -> (one replan on total failure) -> format -> finalize.
//! The driver is the only component that mutates task status, every
//! transition is validated against the state graph, and an outer fault
//! floor guarantees that a `task_done` event is emitted and the session
//! pool is shut down no matter what went wrong.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use courier_store::TaskStore;
use courier_store::models::{
    EventKind, OutputFormat, Plan, Task, TaskEvent, TaskStatus,
};

use crate::backend::BrowserBackend;
use crate::events::EventBroadcaster;
use crate::executor::StepExecutor;
use crate::output::format_output;
use crate::planner::{PlannerAdapter, planning_reasoning};
use crate::scheduler::run_plan;
use crate::session::SessionPool;

/// Per-task resource knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Browser session pool capacity per task.
    pub max_sessions: usize,
    /// Wall-clock budget per external browser call.
    pub browser_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_sessions: 3,
            browser_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Pipeline {
    store: Arc<TaskStore>,
    broadcaster: Arc<EventBroadcaster>,
    planner: PlannerAdapter,
    executor: Arc<StepExecutor>,
    browser: Arc<dyn BrowserBackend>,
    config: PipelineConfig,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl Pipeline {
    pub fn new(
        store: Arc<TaskStore>,
        broadcaster: Arc<EventBroadcaster>,
        planner: PlannerAdapter,
        executor: Arc<StepExecutor>,
        browser: Arc<dyn BrowserBackend>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            planner,
            executor,
            browser,
            config,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    /// Register a new queued task. Emits no event.
    pub async fn submit(
        &self,
        command: impl Into<String>,
        output_format: OutputFormat,
        owner: Option<String>,
    ) -> Task {
        self.store.create(command, output_format, owner).await
    }

    /// Request cooperative cancellation of a running task.
    ///
    /// The driver stops issuing steps at its next loop boundary; in-flight
    /// external calls may still finish but their results are discarded.
    pub async fn cancel(&self, task_id: &str) -> Option<Task> {
        let task = self.store.get(task_id).await?;
        if task.status.is_terminal() {
            return Some(task);
        }

        if let Some(token) = self
            .cancellations
            .lock()
            .expect("cancellation lock poisoned")
            .get(task_id)
        {
            token.cancel();
        }
        tracing::info!(task_id = %task_id, "cancellation requested");
        Some(task)
    }

    /// Drive a submitted task to a terminal state and return it.
    pub async fn run(&self, task_id: &str) -> Option<Task> {
        let mut task = self.store.get(task_id).await?;
        if task.status != TaskStatus::Queued {
            tracing::warn!(task_id = %task_id, status = %task.status, "task is not queued, refusing to run");
            return Some(task);
        }

        let cancel = CancellationToken::new();
        self.cancellations
            .lock()
            .expect("cancellation lock poisoned")
            .insert(task_id.to_string(), cancel.clone());

        // One pool per task: bounds browser concurrency and guarantees the
        // sessions die with the task.
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&self.browser),
            self.config.max_sessions,
        ));

        let outcome = self.run_inner(&mut task, &pool, &cancel).await;

        // Fault floor: anything unexpected still terminates the task,
        // emits task_done, and cleans up.
        if let Err(e) = outcome {
            tracing::error!(task_id = %task_id, error = %format!("{e:#}"), "pipeline failed");
            if !task.status.is_terminal() {
                task.status = TaskStatus::Failed;
            }
            task.error = Some(format!("{e:#}"));
            self.stamp_finish(&mut task);
            self.store.save(&task).await;
            self.emit(
                task_id,
                EventKind::TaskDone,
                json!({
                    "status": task.status,
                    "error": task.error,
                    "cost_usd": task.cost_usd,
                    "duration_ms": task.duration_ms,
                }),
            );
        }

        pool.shutdown().await;
        self.cancellations
            .lock()
            .expect("cancellation lock poisoned")
            .remove(task_id);

        Some(task)
    }

    async fn run_inner(
        &self,
        task: &mut Task,
        pool: &Arc<SessionPool>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let task_id = task.task_id.clone();

        // ---- Planning ----
        self.transition(task, TaskStatus::Planning)?;
        self.store.save(task).await;
        self.emit(&task_id, EventKind::PlanningStarted, json!({}));
        self.emit(
            &task_id,
            EventKind::PlanningReasoning,
            json!({"text": planning_reasoning(&task.command)}),
        );

        let planning_started = Instant::now();
        let mut plan = self
            .planner
            .plan(&task_id, &task.command)
            .await
            .context("planning failed")?;
        let planning_ms = planning_started.elapsed().as_millis() as u64;

        self.store.set_plan(&task_id, &plan).await;
        task.plan = Some(plan.clone());
        self.emit(
            &task_id,
            EventKind::PlanReady,
            json!({
                "steps": serialize_steps(&plan),
                "planning_ms": planning_ms,
                "is_replan": false,
            }),
        );

        // ---- Execution ----
        self.transition(task, TaskStatus::Executing)?;
        self.store.save(task).await;

        let execution_started = Instant::now();
        let mut summary = run_plan(&mut plan, &self.executor, pool, &self.broadcaster, cancel).await;
        let mut execution_ms = execution_started.elapsed().as_millis() as u64;
        let mut total_planning_ms = planning_ms;

        // ---- Degrade: one replan when every branch failed ----
        if !cancel.is_cancelled() && summary.completed == 0 && summary.failed > 0 {
            tracing::warn!(
                task_id = %task_id,
                failed = summary.failed,
                "all branches failed, replanning once"
            );
            self.transition(task, TaskStatus::Replanning)?;
            self.store.save(task).await;
            self.emit(
                &task_id,
                EventKind::Replanning,
                json!({"failed_steps": summary.failed_ids}),
            );

            let failed_steps: Vec<(String, String)> = plan
                .steps
                .iter()
                .filter(|s| summary.failed_ids.contains(&s.id))
                .map(|s| {
                    (
                        s.id.clone(),
                        s.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                    )
                })
                .collect();
            let context: Vec<Value> = summary
                .completed_results
                .iter()
                .map(|(_, v)| v.clone())
                .collect();

            let replan_started = Instant::now();
            match self
                .planner
                .replan(&task_id, &task.command, &failed_steps, &context)
                .await
            {
                Ok(new_plan) => {
                    let replanning_ms = replan_started.elapsed().as_millis() as u64;
                    total_planning_ms += replanning_ms;
                    plan = new_plan;
                    self.store.set_plan(&task_id, &plan).await;
                    task.plan = Some(plan.clone());
                    self.emit(
                        &task_id,
                        EventKind::PlanReady,
                        json!({
                            "steps": serialize_steps(&plan),
                            "planning_ms": replanning_ms,
                            "is_replan": true,
                        }),
                    );

                    self.transition(task, TaskStatus::Executing)?;
                    self.store.save(task).await;

                    let second_started = Instant::now();
                    summary =
                        run_plan(&mut plan, &self.executor, pool, &self.broadcaster, cancel).await;
                    execution_ms += second_started.elapsed().as_millis() as u64;
                }
                Err(e) => {
                    // Keep the first run's outcome; finalization below will
                    // mark the task failed.
                    tracing::warn!(task_id = %task_id, error = %e, "replan failed");
                    self.transition(task, TaskStatus::Executing)?;
                }
            }
        }

        // ---- Finalize ----
        self.store.set_plan(&task_id, &plan).await;
        task.plan = Some(plan.clone());

        let status = if cancel.is_cancelled() {
            TaskStatus::Cancelled
        } else if summary.failed == 0 && summary.skipped == 0 {
            TaskStatus::Completed
        } else if summary.completed > 0 {
            TaskStatus::Partial
        } else {
            TaskStatus::Failed
        };
        self.transition(task, status)?;

        if status != TaskStatus::Cancelled {
            task.output = Some(format_output(&plan, task.output_format));
        }
        task.cost_usd = plan.steps.iter().map(|s| s.cost_usd).sum();
        self.stamp_finish(task);
        self.store.save(task).await;

        self.emit(
            &task_id,
            EventKind::TaskDone,
            json!({
                "status": task.status,
                "error": task.error,
                "cost_usd": task.cost_usd,
                "duration_ms": task.duration_ms,
                "steps_completed": summary.completed,
                "steps_failed": summary.failed,
                "steps_skipped": summary.skipped,
                "steps_total": summary.total,
                "timing": timing_trace(&plan, total_planning_ms, execution_ms),
            }),
        );

        tracing::info!(
            task_id = %task_id,
            status = %task.status,
            duration_ms = task.duration_ms,
            cost_usd = task.cost_usd,
            "task finished"
        );
        Ok(())
    }

    fn transition(&self, task: &mut Task, to: TaskStatus) -> Result<()> {
        anyhow::ensure!(
            task.status.can_transition_to(to),
            "invalid task transition: {} -> {} for task {}",
            task.status,
            to,
            task.task_id
        );
        task.status = to;
        Ok(())
    }

    fn stamp_finish(&self, task: &mut Task) {
        let finished = chrono::Utc::now();
        task.finished_at = Some(finished);
        task.duration_ms = Some((finished - task.created_at).num_milliseconds());
    }

    fn emit(&self, task_id: &str, kind: EventKind, data: Value) {
        self.broadcaster
            .publish(&TaskEvent::new(task_id, kind, data));
    }
}

fn serialize_steps(plan: &Plan) -> Value {
    Value::Array(
        plan.steps
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "action": s.action,
                    "target": s.target,
                    "description": s.description,
                    "group": s.group,
                    "executor": s.executor,
                    "depends_on": s.depends_on,
                })
            })
            .collect(),
    )
}

/// Per-step timing entries for the task_done trace.
fn timing_trace(plan: &Plan, planning_ms: u64, execution_ms: u64) -> Value {
    let steps: Vec<Value> = plan
        .steps
        .iter()
        .map(|s| {
            let duration_ms = match (s.started_at, s.finished_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            };
            json!({
                "step_id": s.id,
                "action": s.action,
                "status": s.status,
                "started_at": s.started_at,
                "finished_at": s.finished_at,
                "duration_ms": duration_ms,
                "retries": s.retries,
                "cost_usd": s.cost_usd,
            })
        })
        .collect();

    json!({
        "planning_ms": planning_ms,
        "execution_ms": execution_ms,
        "steps": steps,
    })
}
