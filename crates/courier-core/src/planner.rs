//! Planner adapter: turns a command into a validated plan.
//!
//! The external LLM is asked for a JSON array of step descriptors. When the
//! service is unconfigured, unreachable, or replies with something that is
//! not a step array, a deterministic keyword heuristic produces the plan
//! instead. Ingestion assigns fresh step identifiers, converts index-based
//! dependencies, normalizes the executor per action, and validates the
//! dependency graph; a cycle or dangling reference is a hard error.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use courier_store::models::{Action, Plan, Step};

use crate::backend::{CompletionRequest, LlmBackend};
use crate::parse::parse_result;

const PLANNER_SYSTEM_PROMPT: &str = "\
You are an autonomous task planner. Given a user command, decompose it into
concrete steps for a browser-automation agent and a reasoning model.

Reply ONLY with a JSON array. Each element must have:
  - \"action\": one of \"navigate\", \"search\", \"extract\", \"click\", \"fill\", \
\"compare\", \"analyze\", \"rank\", \"summarize\"
  - \"target\": URL, or the literal \"aggregated\" for reasoning steps
  - \"description\": short human-readable description
  - \"executor\": \"browser\" or \"llm\"
  - \"group\": branch label; steps in different groups may run in parallel
  - \"depends_on\": array of zero-based indices of prerequisite steps

Do NOT include any text outside the JSON array.
";

/// Where the heuristic planner sends a command that names no known site.
const DEFAULT_SEARCH_SITE: &str = "https://www.google.com";

/// Site keywords the heuristic planner recognizes.
const KNOWN_SITES: &[(&str, &str, &str)] = &[
    ("amazon", "https://www.amazon.com", "amazon"),
    ("best buy", "https://www.bestbuy.com", "bestbuy"),
    ("newegg", "https://www.newegg.com", "newegg"),
    ("walmart", "https://www.walmart.com", "walmart"),
    ("ebay", "https://www.ebay.com", "ebay"),
    ("linkedin", "https://www.linkedin.com", "linkedin"),
    ("indeed", "https://www.indeed.com", "indeed"),
    ("zillow", "https://www.zillow.com", "zillow"),
    ("yelp", "https://www.yelp.com", "yelp"),
];

/// Errors from plan ingestion and validation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan must contain at least one step")]
    NoSteps,

    #[error("unknown action {action:?} at step {index}")]
    UnknownAction { index: usize, action: String },

    #[error("step {index} depends on out-of-range step {dependency}")]
    DependencyOutOfRange { index: usize, dependency: i64 },

    #[error("dependency cycle detected involving steps: {0}")]
    CycleDetected(String),
}

/// One raw step descriptor as emitted by the planner model.
#[derive(Debug, Clone, Deserialize)]
pub struct StepDescriptor {
    pub action: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<i64>,
}

pub struct PlannerAdapter {
    llm: Arc<dyn LlmBackend>,
}

impl PlannerAdapter {
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }

    /// Produce a plan for a fresh command.
    pub async fn plan(&self, task_id: &str, command: &str) -> Result<Plan, PlanError> {
        let descriptors = match self.llm_descriptors(command, None, 0.2).await {
            Some(raw) => {
                tracing::info!(steps = raw.len(), "plan generated by llm");
                raw
            }
            None => {
                let raw = heuristic_plan(command);
                tracing::info!(steps = raw.len(), "plan generated by heuristic fallback");
                raw
            }
        };
        ingest(task_id, command, descriptors)
    }

    /// Produce a replacement plan after every branch of the first failed.
    pub async fn replan(
        &self,
        task_id: &str,
        command: &str,
        failed_steps: &[(String, String)],
        context: &[Value],
    ) -> Result<Plan, PlanError> {
        let failure_summary: String = failed_steps
            .iter()
            .map(|(id, error)| format!("- step {id}: {error}\n"))
            .collect();
        let context_json = serde_json::to_string_pretty(&Value::Array(context.to_vec()))
            .unwrap_or_else(|_| "[]".to_string());
        let user = format!(
            "The previous plan for this command failed entirely.\n\n\
             Command: {command}\n\n\
             Failed steps:\n{failure_summary}\n\
             Results from successful steps:\n{context_json}\n\n\
             Produce a corrected plan that avoids the failures above."
        );

        let descriptors = match self.llm_descriptors(command, Some(user), 0.3).await {
            Some(raw) => {
                tracing::info!(steps = raw.len(), "replan generated by llm");
                raw
            }
            None => {
                let raw = heuristic_plan(command);
                tracing::info!(steps = raw.len(), "replan generated by heuristic fallback");
                raw
            }
        };
        ingest(task_id, command, descriptors)
    }

    /// Ask the model for step descriptors. `None` means the service is
    /// unconfigured, failed, or did not reply with a step array; callers
    /// fall back to the heuristic.
    async fn llm_descriptors(
        &self,
        command: &str,
        user_override: Option<String>,
        temperature: f32,
    ) -> Option<Vec<StepDescriptor>> {
        if !self.llm.is_configured() {
            return None;
        }

        let request = CompletionRequest {
            system: PLANNER_SYSTEM_PROMPT.to_string(),
            user: user_override.unwrap_or_else(|| command.to_string()),
            temperature,
            max_tokens: 2048,
        };

        let reply = match self.llm.complete(&request).await {
            Ok(r) => r.text,
            Err(e) => {
                tracing::warn!(error = %e, "planner llm call failed, using heuristic");
                return None;
            }
        };

        let parsed = parse_result(Value::String(reply), None, None).await;
        if !parsed.is_array() {
            tracing::warn!("planner reply was not a step array, using heuristic");
            return None;
        }

        match serde_json::from_value::<Vec<StepDescriptor>>(parsed) {
            Ok(raw) if !raw.is_empty() => Some(raw),
            Ok(_) => {
                tracing::warn!("planner reply was an empty array, using heuristic");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "planner reply did not match the step schema");
                None
            }
        }
    }
}

/// Which known sites a command mentions.
fn detect_sites(command: &str) -> Vec<(&'static str, &'static str)> {
    let lowered = command.to_lowercase();
    KNOWN_SITES
        .iter()
        .filter(|(keyword, _, _)| lowered.contains(keyword))
        .map(|(_, url, group)| (*url, *group))
        .collect()
}

/// Deterministic fallback plan: per detected site, navigate -> search ->
/// extract with sequential dependencies, then one compare over all extract
/// steps and one summarize over the compare.
pub fn heuristic_plan(command: &str) -> Vec<StepDescriptor> {
    let mut sites = detect_sites(command);
    if sites.is_empty() {
        sites.push((DEFAULT_SEARCH_SITE, "search"));
    }

    let mut steps: Vec<StepDescriptor> = Vec::with_capacity(sites.len() * 3 + 2);
    let mut extract_indices: Vec<i64> = Vec::with_capacity(sites.len());

    for (url, group) in &sites {
        let base = steps.len() as i64;
        steps.push(StepDescriptor {
            action: "navigate".to_string(),
            target: (*url).to_string(),
            description: format!("Open {url}"),
            executor: Some("browser".to_string()),
            group: Some((*group).to_string()),
            depends_on: vec![],
        });
        steps.push(StepDescriptor {
            action: "search".to_string(),
            target: (*url).to_string(),
            description: format!("Search for the requested product on {url}"),
            executor: Some("browser".to_string()),
            group: Some((*group).to_string()),
            depends_on: vec![base],
        });
        steps.push(StepDescriptor {
            action: "extract".to_string(),
            target: (*url).to_string(),
            description: format!("Extract top results from {url}"),
            executor: Some("browser".to_string()),
            group: Some((*group).to_string()),
            depends_on: vec![base + 1],
        });
        extract_indices.push(base + 2);
    }

    let compare_index = steps.len() as i64;
    steps.push(StepDescriptor {
        action: "compare".to_string(),
        target: "aggregated".to_string(),
        description: "Compare extracted results across sites".to_string(),
        executor: Some("llm".to_string()),
        group: Some("analysis".to_string()),
        depends_on: extract_indices,
    });
    steps.push(StepDescriptor {
        action: "summarize".to_string(),
        target: "aggregated".to_string(),
        description: "Produce final ranked summary".to_string(),
        executor: Some("llm".to_string()),
        group: Some("analysis".to_string()),
        depends_on: vec![compare_index],
    });

    steps
}

/// Human-readable planning narration, generated locally so the UI has
/// something to show while the external planner call is in flight.
pub fn planning_reasoning(command: &str) -> String {
    let sites = detect_sites(command);
    if sites.is_empty() {
        "Analyzing the request. No specific sites mentioned, so I'll run a web \
         search, extract the most relevant results, and produce a ranked summary."
            .to_string()
    } else {
        let names: Vec<String> = sites
            .iter()
            .map(|(url, _)| url.trim_start_matches("https://www.").to_string())
            .collect();
        format!(
            "Analyzing the request. I'll check {} in parallel, extract matching \
             results from each, then compare everything and summarize the best options.",
            names.join(" and ")
        )
    }
}

/// Convert raw descriptors into a validated [`Plan`].
fn ingest(task_id: &str, command: &str, raw: Vec<StepDescriptor>) -> Result<Plan, PlanError> {
    if raw.is_empty() {
        return Err(PlanError::NoSteps);
    }

    // Validate actions and dependency indices before allocating ids.
    let mut actions: Vec<Action> = Vec::with_capacity(raw.len());
    for (index, descriptor) in raw.iter().enumerate() {
        let action: Action =
            descriptor
                .action
                .parse()
                .map_err(|_| PlanError::UnknownAction {
                    index,
                    action: descriptor.action.clone(),
                })?;
        actions.push(action);

        for &dep in &descriptor.depends_on {
            if dep < 0 || dep as usize >= raw.len() {
                return Err(PlanError::DependencyOutOfRange {
                    index,
                    dependency: dep,
                });
            }
        }
    }

    check_for_cycles(&raw)?;

    let mut steps: Vec<Step> = Vec::with_capacity(raw.len());
    for (index, descriptor) in raw.iter().enumerate() {
        let action = actions[index];
        let group = descriptor
            .group
            .clone()
            .unwrap_or_else(|| "main".to_string());

        let mut step = Step::new(
            action,
            descriptor.target.clone(),
            descriptor.description.clone(),
            group,
            vec![],
        );

        // The executor is mandated by the action; a descriptor that says
        // otherwise is normalized rather than rejected.
        if let Some(ref claimed) = descriptor.executor {
            if *claimed != step.executor.to_string() {
                tracing::debug!(
                    step = index,
                    claimed = %claimed,
                    normalized = %step.executor,
                    "normalized step executor"
                );
            }
        }
        steps.push(step);
    }

    // Second pass: map index-based dependencies onto the fresh ids.
    let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    for (index, descriptor) in raw.iter().enumerate() {
        steps[index].depends_on = descriptor
            .depends_on
            .iter()
            .map(|&dep| ids[dep as usize].clone())
            .collect();
    }

    Ok(Plan::new(task_id, command, steps))
}

/// Kahn's algorithm over index-based dependencies. Errors with the indices
/// left unsorted when the graph has a cycle.
fn check_for_cycles(raw: &[StepDescriptor]) -> Result<(), PlanError> {
    let n = raw.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (index, descriptor) in raw.iter().enumerate() {
        for &dep in &descriptor.depends_on {
            adj[dep as usize].push(index);
            in_degree[index] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = 0;

    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted != n {
        let stuck: Vec<String> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| i.to_string())
            .collect();
        return Err(PlanError::CycleDetected(stuck.join(", ")));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
