//! Authoritative task/plan store.
//!
//! The in-process maps are the source of truth for the lifetime of the
//! process; when a Redis URL is configured they are fronted by [`RedisKv`]
//! so task history survives restarts and can be read by other instances.
//! Reads always hit the in-process map first to avoid repeated
//! deserialization.
//!
//! The store is not a coordination primitive: concurrent mutations to the
//! same task must be serialized by the pipeline driver's control flow.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::kv::RedisKv;
use crate::models::{OutputFormat, Plan, Task};

pub struct TaskStore {
    tasks: RwLock<HashMap<String, Task>>,
    plans: RwLock<HashMap<String, Plan>>,
    /// (creation epoch seconds, task id), newest first.
    timeline: RwLock<Vec<(i64, String)>>,
    kv: Option<RedisKv>,
}

impl TaskStore {
    /// Store backed only by process memory.
    pub fn in_memory() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            timeline: RwLock::new(Vec::new()),
            kv: None,
        }
    }

    /// Store with an optional Redis front.
    ///
    /// An unreachable Redis degrades to memory-only with a warning rather
    /// than failing startup, matching local-dev and CI environments.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let kv = match redis_url {
            Some(url) if !url.is_empty() => match RedisKv::connect(url).await {
                Ok(kv) => {
                    tracing::info!(url = %url, "task store connected to redis");
                    Some(kv)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "redis unavailable, using in-memory store");
                    None
                }
            },
            _ => None,
        };

        Self {
            tasks: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            timeline: RwLock::new(Vec::new()),
            kv,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        if self.kv.is_some() { "redis" } else { "memory" }
    }

    /// Create and persist a new queued task.
    pub async fn create(
        &self,
        command: impl Into<String>,
        output_format: OutputFormat,
        owner: Option<String>,
    ) -> Task {
        let task = Task::new(command, output_format, owner);
        let created = task.created_at.timestamp();

        {
            let mut timeline = self.timeline.write().expect("timeline lock poisoned");
            timeline.insert(0, (created, task.task_id.clone()));
        }
        self.persist(&task).await;

        if let Some(kv) = &self.kv {
            if let Err(e) = kv.add_to_timeline(&task.task_id, created as f64).await {
                tracing::warn!(task_id = %task.task_id, error = %e, "failed to index task in redis");
            }
        }

        task
    }

    /// Fetch a task, falling back to the KV front on a cache miss.
    pub async fn get(&self, task_id: &str) -> Option<Task> {
        if let Some(task) = self
            .tasks
            .read()
            .expect("task lock poisoned")
            .get(task_id)
            .cloned()
        {
            return Some(task);
        }

        let kv = self.kv.as_ref()?;
        let raw = kv.get_task(task_id).await.ok().flatten()?;
        match serde_json::from_str::<Task>(&raw) {
            Ok(task) => {
                self.tasks
                    .write()
                    .expect("task lock poisoned")
                    .insert(task_id.to_string(), task.clone());
                Some(task)
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "corrupt task record in redis");
                None
            }
        }
    }

    /// Persist current task state. Call after every mutation.
    pub async fn save(&self, task: &Task) {
        self.persist(task).await;
    }

    /// Attach (or replace) a task's plan.
    pub async fn set_plan(&self, task_id: &str, plan: &Plan) {
        self.plans
            .write()
            .expect("plan lock poisoned")
            .insert(task_id.to_string(), plan.clone());

        if let Some(kv) = &self.kv {
            match serde_json::to_string(plan) {
                Ok(json) => {
                    if let Err(e) = kv.set_plan(task_id, &json).await {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to persist plan");
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to serialize plan");
                }
            }
        }

        // Keep the task's embedded plan reference current.
        let updated = {
            let mut tasks = self.tasks.write().expect("task lock poisoned");
            tasks.get_mut(task_id).map(|task| {
                task.plan = Some(plan.clone());
                task.clone()
            })
        };
        if let Some(task) = updated {
            self.persist(&task).await;
        }
    }

    pub async fn get_plan(&self, task_id: &str) -> Option<Plan> {
        if let Some(plan) = self
            .plans
            .read()
            .expect("plan lock poisoned")
            .get(task_id)
            .cloned()
        {
            return Some(plan);
        }

        let kv = self.kv.as_ref()?;
        let raw = kv.get_plan(task_id).await.ok().flatten()?;
        let plan: Plan = serde_json::from_str(&raw).ok()?;
        self.plans
            .write()
            .expect("plan lock poisoned")
            .insert(task_id.to_string(), plan.clone());
        Some(plan)
    }

    /// Most recent tasks, newest first.
    pub async fn list_recent(&self, limit: usize) -> Vec<Task> {
        let ids: Vec<String> = if let Some(kv) = &self.kv {
            match kv.timeline(limit).await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read redis timeline, using memory");
                    self.memory_timeline(limit)
                }
            }
        } else {
            self.memory_timeline(limit)
        };

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get(&id).await {
                tasks.push(task);
            }
        }
        tasks
    }

    fn memory_timeline(&self, limit: usize) -> Vec<String> {
        self.timeline
            .read()
            .expect("timeline lock poisoned")
            .iter()
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect()
    }

    async fn persist(&self, task: &Task) {
        self.tasks
            .write()
            .expect("task lock poisoned")
            .insert(task.task_id.clone(), task.clone());

        if let Some(kv) = &self.kv {
            match serde_json::to_string(task) {
                Ok(json) => {
                    if let Err(e) = kv.set_task(&task.task_id, &json).await {
                        tracing::warn!(task_id = %task.task_id, error = %e, "failed to persist task");
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.task_id, error = %e, "failed to serialize task");
                }
            }
        }
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Step, TaskStatus};

    #[tokio::test]
    async fn create_and_get() {
        let store = TaskStore::in_memory();
        let task = store
            .create("find a laptop", OutputFormat::Json, None)
            .await;

        let fetched = store.get(&task.task_id).await.expect("task should exist");
        assert_eq!(fetched.task_id, task.task_id);
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.command, "find a laptop");
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = TaskStore::in_memory();
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn save_overwrites_state() {
        let store = TaskStore::in_memory();
        let mut task = store.create("cmd", OutputFormat::Csv, None).await;

        task.status = TaskStatus::Planning;
        store.save(&task).await;

        let fetched = store.get(&task.task_id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Planning);
    }

    #[tokio::test]
    async fn set_plan_attaches_to_task() {
        let store = TaskStore::in_memory();
        let task = store.create("cmd", OutputFormat::Json, None).await;

        let step = Step::new(Action::Navigate, "https://example.com", "Open", "g", vec![]);
        let plan = Plan::new(task.task_id.clone(), "cmd", vec![step]);
        store.set_plan(&task.task_id, &plan).await;

        let fetched_plan = store.get_plan(&task.task_id).await.unwrap();
        assert_eq!(fetched_plan.steps.len(), 1);

        let fetched_task = store.get(&task.task_id).await.unwrap();
        assert!(fetched_task.plan.is_some());
    }

    #[tokio::test]
    async fn replan_replaces_prior_plan() {
        let store = TaskStore::in_memory();
        let task = store.create("cmd", OutputFormat::Json, None).await;

        let first = Plan::new(
            task.task_id.clone(),
            "cmd",
            vec![Step::new(Action::Navigate, "https://a.com", "Open a", "a", vec![])],
        );
        store.set_plan(&task.task_id, &first).await;

        let second = Plan::new(
            task.task_id.clone(),
            "cmd",
            vec![
                Step::new(Action::Navigate, "https://b.com", "Open b", "b", vec![]),
                Step::new(Action::Extract, "https://b.com", "Extract", "b", vec![]),
            ],
        );
        store.set_plan(&task.task_id, &second).await;

        let plan = store.get_plan(&task.task_id).await.unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].target, "https://b.com");
    }

    #[tokio::test]
    async fn list_recent_newest_first() {
        let store = TaskStore::in_memory();
        let a = store.create("first", OutputFormat::Json, None).await;
        let b = store.create("second", OutputFormat::Json, None).await;
        let c = store.create("third", OutputFormat::Json, None).await;

        let recent = store.list_recent(10).await;
        let ids: Vec<&str> = recent.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec![&c.task_id[..], &b.task_id[..], &a.task_id[..]]);
    }

    #[tokio::test]
    async fn list_recent_respects_limit() {
        let store = TaskStore::in_memory();
        for i in 0..5 {
            store.create(format!("cmd {i}"), OutputFormat::Json, None).await;
        }
        assert_eq!(store.list_recent(2).await.len(), 2);
    }

    #[tokio::test]
    async fn serialized_task_roundtrips_through_store() {
        let store = TaskStore::in_memory();
        let mut task = store.create("cmd", OutputFormat::Summary, Some("u1".into())).await;
        task.status = TaskStatus::Completed;
        task.cost_usd = 0.01;
        task.output = Some(serde_json::json!({"results": []}));

        // Feed the serialized form back in, as an external KV reader would.
        let json = serde_json::to_string(&task).unwrap();
        let restored: Task = serde_json::from_str(&json).unwrap();
        store.save(&restored).await;

        let fetched = store.get(&task.task_id).await.unwrap();
        assert_eq!(fetched, task);
    }

    #[test]
    fn backend_name_for_memory() {
        let store = TaskStore::in_memory();
        assert_eq!(store.backend_name(), "memory");
    }
}
