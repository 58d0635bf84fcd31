use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default retry budget for a step when the planner does not specify one.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Generate a task identifier: 12 random hex characters.
pub fn new_task_id() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(12);
    hex
}

/// Generate a step identifier: 8 random hex characters.
pub fn new_step_id() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(8);
    hex
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Requested output format for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Csv,
    Summary,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Summary => "summary",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputFormat {
    type Err = OutputFormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "summary" => Ok(Self::Summary),
            other => Err(OutputFormatParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OutputFormat`] string.
#[derive(Debug, Clone)]
pub struct OutputFormatParseError(pub String);

impl fmt::Display for OutputFormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid output format: {:?}", self.0)
    }
}

impl std::error::Error for OutputFormatParseError {}

// ---------------------------------------------------------------------------

/// Status of a single step within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = StepStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(StepStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepStatus`] string.
#[derive(Debug, Clone)]
pub struct StepStatusParseError(pub String);

impl fmt::Display for StepStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid step status: {:?}", self.0)
    }
}

impl std::error::Error for StepStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// The transition graph (enforced by the pipeline driver, which is the only
/// component allowed to mutate task status):
///
/// ```text
/// queued     -> planning
/// planning   -> executing
/// executing  -> replanning         (all branches failed, one replan allowed)
/// replanning -> executing
/// executing  -> completed | partial | failed | cancelled
/// any non-terminal -> failed | cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Planning,
    Executing,
    Replanning,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    /// Check whether `self -> to` is a valid edge in the task state graph.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Self::Queued, Self::Planning) => true,
            (Self::Planning, Self::Executing) => true,
            (Self::Executing, Self::Replanning) => true,
            (Self::Replanning, Self::Executing) => true,
            (Self::Executing, Self::Completed | Self::Partial) => true,
            // The fault floor and cancellation can terminate any live task.
            (_, Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Replanning => "replanning",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "replanning" => Ok(Self::Replanning),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Which backend executes a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Browser,
    Llm,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Browser => "browser",
            Self::Llm => "llm",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutorKind {
    type Err = ExecutorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "browser" => Ok(Self::Browser),
            "llm" => Ok(Self::Llm),
            other => Err(ExecutorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutorKind`] string.
#[derive(Debug, Clone)]
pub struct ExecutorKindParseError(pub String);

impl fmt::Display for ExecutorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid executor kind: {:?}", self.0)
    }
}

impl std::error::Error for ExecutorKindParseError {}

// ---------------------------------------------------------------------------

/// The action a step performs.
///
/// `navigate`/`search`/`extract`/`click`/`fill` are always browser-executed;
/// `compare`/`analyze`/`rank`/`summarize` are always LLM-executed. Plan
/// ingestion normalizes the executor to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Navigate,
    Search,
    Extract,
    Click,
    Fill,
    Compare,
    Analyze,
    Rank,
    Summarize,
}

impl Action {
    /// The executor mandated for this action.
    pub fn required_executor(self) -> ExecutorKind {
        match self {
            Self::Navigate | Self::Search | Self::Extract | Self::Click | Self::Fill => {
                ExecutorKind::Browser
            }
            Self::Compare | Self::Analyze | Self::Rank | Self::Summarize => ExecutorKind::Llm,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Navigate => "navigate",
            Self::Search => "search",
            Self::Extract => "extract",
            Self::Click => "click",
            Self::Fill => "fill",
            Self::Compare => "compare",
            Self::Analyze => "analyze",
            Self::Rank => "rank",
            Self::Summarize => "summarize",
        };
        f.write_str(s)
    }
}

impl FromStr for Action {
    type Err = ActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "navigate" => Ok(Self::Navigate),
            "search" => Ok(Self::Search),
            "extract" => Ok(Self::Extract),
            "click" => Ok(Self::Click),
            "fill" => Ok(Self::Fill),
            "compare" => Ok(Self::Compare),
            "analyze" => Ok(Self::Analyze),
            "rank" => Ok(Self::Rank),
            "summarize" => Ok(Self::Summarize),
            other => Err(ActionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Action`] string.
#[derive(Debug, Clone)]
pub struct ActionParseError(pub String);

impl fmt::Display for ActionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid action: {:?}", self.0)
    }
}

impl std::error::Error for ActionParseError {}

// ---------------------------------------------------------------------------
// Core structs
// ---------------------------------------------------------------------------

/// A single step within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub action: Action,
    pub target: String,
    pub description: String,
    pub executor: ExecutorKind,
    /// Branch label. Steps sharing a group form an independent branch.
    pub group: String,
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub max_retries: u32,
    pub cost_usd: f64,
}

impl Step {
    /// Create a pending step with a fresh 8-hex-char identifier.
    pub fn new(
        action: Action,
        target: impl Into<String>,
        description: impl Into<String>,
        group: impl Into<String>,
        depends_on: Vec<String>,
    ) -> Self {
        Self {
            id: new_step_id(),
            action,
            target: target.into(),
            description: description.into(),
            executor: action.required_executor(),
            group: group.into(),
            depends_on,
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            cost_usd: 0.0,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: Value) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }
}

/// The decomposed plan produced by the planner adapter.
///
/// Immutable once installed on a task; a replan produces a whole new plan
/// that replaces this one atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub task_id: String,
    pub command: String,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(task_id: impl Into<String>, command: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            task_id: task_id.into(),
            command: command.into(),
            steps,
            created_at: Utc::now(),
        }
    }

    /// Look up a step by identifier.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// The top-level unit of work: one user command and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub command: String,
    pub output_format: OutputFormat,
    pub owner: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub cost_usd: f64,
    pub error: Option<String>,
    pub output: Option<Value>,
    pub plan: Option<Plan>,
}

impl Task {
    /// Create a queued task with a fresh 12-hex-char identifier.
    pub fn new(
        command: impl Into<String>,
        output_format: OutputFormat,
        owner: Option<String>,
    ) -> Self {
        Self {
            task_id: new_task_id(),
            command: command.into(),
            output_format,
            owner,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            cost_usd: 0.0,
            error: None,
            output: None,
            plan: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Kind of event emitted during a task's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlanningStarted,
    PlanningReasoning,
    PlanReady,
    StepStarted,
    StepCompleted,
    StepFailed,
    Replanning,
    TaskDone,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PlanningStarted => "planning_started",
            Self::PlanningReasoning => "planning_reasoning",
            Self::PlanReady => "plan_ready",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::Replanning => "replanning",
            Self::TaskDone => "task_done",
        };
        f.write_str(s)
    }
}

/// A lifecycle event pushed to subscribers as one JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub data: Value,
}

impl TaskEvent {
    pub fn new(task_id: impl Into<String>, kind: EventKind, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_display_roundtrip() {
        let variants = [OutputFormat::Json, OutputFormat::Csv, OutputFormat::Summary];
        for v in &variants {
            let s = v.to_string();
            let parsed: OutputFormat = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn output_format_invalid() {
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn step_status_display_roundtrip() {
        let variants = [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Skipped,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: StepStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Planning,
            TaskStatus::Executing,
            TaskStatus::Replanning,
            TaskStatus::Completed,
            TaskStatus::Partial,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn action_display_roundtrip() {
        let variants = [
            Action::Navigate,
            Action::Search,
            Action::Extract,
            Action::Click,
            Action::Fill,
            Action::Compare,
            Action::Analyze,
            Action::Rank,
            Action::Summarize,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Action = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn action_executor_mapping() {
        assert_eq!(Action::Navigate.required_executor(), ExecutorKind::Browser);
        assert_eq!(Action::Search.required_executor(), ExecutorKind::Browser);
        assert_eq!(Action::Extract.required_executor(), ExecutorKind::Browser);
        assert_eq!(Action::Click.required_executor(), ExecutorKind::Browser);
        assert_eq!(Action::Fill.required_executor(), ExecutorKind::Browser);
        assert_eq!(Action::Compare.required_executor(), ExecutorKind::Llm);
        assert_eq!(Action::Analyze.required_executor(), ExecutorKind::Llm);
        assert_eq!(Action::Rank.required_executor(), ExecutorKind::Llm);
        assert_eq!(Action::Summarize.required_executor(), ExecutorKind::Llm);
    }

    #[test]
    fn terminal_statuses_admit_no_transitions() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Partial,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskStatus::Executing));
            assert!(!terminal.can_transition_to(TaskStatus::Failed));
        }
    }

    #[test]
    fn task_status_happy_path_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Planning));
        assert!(TaskStatus::Planning.can_transition_to(TaskStatus::Executing));
        assert!(TaskStatus::Executing.can_transition_to(TaskStatus::Replanning));
        assert!(TaskStatus::Replanning.can_transition_to(TaskStatus::Executing));
        assert!(TaskStatus::Executing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Executing.can_transition_to(TaskStatus::Partial));
    }

    #[test]
    fn task_status_fault_floor_transitions() {
        for live in [
            TaskStatus::Queued,
            TaskStatus::Planning,
            TaskStatus::Executing,
            TaskStatus::Replanning,
        ] {
            assert!(live.can_transition_to(TaskStatus::Failed));
            assert!(live.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn task_status_rejects_skips() {
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Executing));
        assert!(!TaskStatus::Planning.can_transition_to(TaskStatus::Replanning));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn id_lengths() {
        assert_eq!(new_task_id().len(), 12);
        assert_eq!(new_step_id().len(), 8);
        assert!(new_task_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn step_ids_are_unique() {
        let a = new_step_id();
        let b = new_step_id();
        assert_ne!(a, b);
    }

    #[test]
    fn step_mark_helpers_set_timestamps() {
        let mut step = Step::new(Action::Navigate, "https://example.com", "Open it", "main", vec![]);
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.started_at.is_none());

        step.mark_running();
        assert_eq!(step.status, StepStatus::Running);
        assert!(step.started_at.is_some());

        step.mark_completed(serde_json::json!({"success": true}));
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.result.is_some());
        assert!(step.finished_at.is_some());
    }

    #[test]
    fn step_mark_failed_records_error() {
        let mut step = Step::new(Action::Extract, "https://example.com", "Grab data", "main", vec![]);
        step.mark_running();
        step.mark_failed("boom");
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("boom"));
    }

    #[test]
    fn task_serde_roundtrip() {
        let mut task = Task::new("find a laptop", OutputFormat::Json, Some("u1".into()));
        task.status = TaskStatus::Completed;
        task.cost_usd = 0.004;
        task.output = Some(serde_json::json!({"total_results": 2}));

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    #[test]
    fn plan_serde_roundtrip() {
        let step = Step::new(Action::Search, "https://www.amazon.com", "Search", "amazon", vec![]);
        let plan = Plan::new("abc123def456", "find a laptop", vec![step]);

        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn event_serializes_with_event_key() {
        let ev = TaskEvent::new("t1", EventKind::StepStarted, serde_json::json!({"step_id": "s1"}));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "step_started");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["data"]["step_id"], "s1");
    }

    #[test]
    fn plan_step_lookup() {
        let step = Step::new(Action::Navigate, "https://example.com", "Open", "g", vec![]);
        let id = step.id.clone();
        let plan = Plan::new("t", "cmd", vec![step]);
        assert!(plan.step(&id).is_some());
        assert!(plan.step("missing").is_none());
    }
}
