//! End-to-end pipeline tests over mock backends: full runs per output
//! format, the event contract, replan-on-total-failure, partial outcomes,
//! cancellation, and the fault floor.

use std::sync::Arc;
use std::time::Duration;

use courier_core::backend::mock::{MockBrowser, MockLlm};
use courier_core::pipeline::Pipeline;
use courier_store::models::{EventKind, OutputFormat, TaskStatus};
use courier_test_utils::{
    BrokenBrowser, ScriptedLlm, SlowBrowser, build_pipeline, collect_until_done, data_of, kinds,
    mock_pipeline,
};

async fn run_to_done(
    pipeline: &Arc<Pipeline>,
    command: &str,
    format: OutputFormat,
) -> (courier_store::models::Task, Vec<courier_store::models::TaskEvent>) {
    let task = pipeline.submit(command, format, None).await;
    let subscription = pipeline.broadcaster().subscribe(&task.task_id);

    let events_fut = tokio::spawn(collect_until_done(subscription));
    let task = pipeline.run(&task.task_id).await.expect("task exists");
    let events = events_fut.await.expect("collector finished");
    (task, events)
}

#[tokio::test]
async fn full_pipeline_json() {
    let pipeline = mock_pipeline();
    let (task, events) = run_to_done(
        &pipeline,
        "Find me the best laptop under $800 from Amazon and Best Buy",
        OutputFormat::Json,
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    let output = task.output.expect("output present");
    assert!(output["total_results"].as_u64().unwrap() > 0);
    assert!(task.duration_ms.unwrap() >= 0);
    assert!(task.cost_usd > 0.0);

    let done = data_of(&events, EventKind::TaskDone);
    assert_eq!(done.len(), 1, "exactly one task_done");
    assert_eq!(done[0]["status"], "completed");
    assert_eq!(done[0]["steps_completed"], 8);
    assert_eq!(done[0]["steps_failed"], 0);
    assert!(done[0]["timing"]["planning_ms"].is_u64());
    assert_eq!(done[0]["timing"]["steps"].as_array().unwrap().len(), 8);
}

#[tokio::test]
async fn full_pipeline_csv() {
    let pipeline = mock_pipeline();
    let (task, _) = run_to_done(
        &pipeline,
        "Find me the best laptop under $800 from Amazon",
        OutputFormat::Csv,
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    let output = task.output.unwrap();
    assert!(output.as_str().unwrap().starts_with("name,price,rating,source\n"));
}

#[tokio::test]
async fn full_pipeline_summary() {
    let pipeline = mock_pipeline();
    let (task, _) = run_to_done(
        &pipeline,
        "Find me the best laptop under $800 from Amazon",
        OutputFormat::Summary,
    )
    .await;

    assert_eq!(task.status, TaskStatus::Completed);
    let output = task.output.unwrap();
    assert!(output.as_str().unwrap().starts_with("Results for: "));
}

#[tokio::test]
async fn event_sequence_contract() {
    let pipeline = mock_pipeline();
    let (_, events) = run_to_done(&pipeline, "Find laptops on Amazon", OutputFormat::Json).await;

    let sequence = kinds(&events);
    assert_eq!(sequence[0], EventKind::PlanningStarted);
    assert_eq!(sequence[1], EventKind::PlanningReasoning);
    assert_eq!(sequence[2], EventKind::PlanReady);
    assert_eq!(*sequence.last().unwrap(), EventKind::TaskDone);

    assert!(sequence.iter().filter(|k| **k == EventKind::StepStarted).count() > 0);
    assert!(sequence.iter().filter(|k| **k == EventKind::StepCompleted).count() > 0);
    assert_eq!(sequence.iter().filter(|k| **k == EventKind::TaskDone).count(), 1);
}

#[tokio::test]
async fn total_failure_triggers_exactly_one_replan() {
    let browser = Arc::new(BrokenBrowser::new("SiteDown"));
    let pipeline = build_pipeline(browser, Arc::new(MockLlm::new()));

    let (task, events) = run_to_done(&pipeline, "search newegg for blenders", OutputFormat::Json).await;

    assert_eq!(task.status, TaskStatus::Failed);

    let sequence = kinds(&events);
    assert_eq!(
        sequence.iter().filter(|k| **k == EventKind::Replanning).count(),
        1,
        "exactly one replanning regardless of the second plan's outcome"
    );

    let plans = data_of(&events, EventKind::PlanReady);
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[0]["is_replan"], false);
    assert_eq!(plans[1]["is_replan"], true);

    let done = data_of(&events, EventKind::TaskDone);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["status"], "failed");
}

#[tokio::test]
async fn mixed_outcome_is_partial_without_replan() {
    // Browser fails only bestbuy targets; amazon branch completes.
    struct HalfBroken {
        inner: MockBrowser,
    }

    #[async_trait::async_trait]
    impl courier_core::backend::BrowserBackend for HalfBroken {
        fn is_configured(&self) -> bool {
            true
        }

        async fn open_session(
            &self,
            start_url: &str,
        ) -> Result<courier_core::backend::SessionHandle, courier_core::backend::BackendError>
        {
            self.inner.open_session(start_url).await
        }

        async fn close_session(&self, session: &courier_core::backend::SessionHandle) {
            self.inner.close_session(session).await;
        }

        async fn act(
            &self,
            session: Option<&courier_core::backend::SessionHandle>,
            request: &courier_core::backend::ActRequest,
        ) -> Result<courier_core::backend::ActResponse, courier_core::backend::BackendError>
        {
            if request.target.contains("bestbuy.com") {
                return Err(courier_core::backend::BackendError::Agent {
                    kind: "ActExceededMaxSteps".to_string(),
                    message: "stuck in a popup".to_string(),
                });
            }
            self.inner.act(session, request).await
        }
    }

    let pipeline = build_pipeline(
        Arc::new(HalfBroken {
            inner: MockBrowser::new(),
        }),
        Arc::new(MockLlm::new()),
    );

    let (task, events) = run_to_done(
        &pipeline,
        "Find me the best laptop under $800 from Amazon and Best Buy",
        OutputFormat::Json,
    )
    .await;

    assert_eq!(task.status, TaskStatus::Partial);
    assert!(kinds(&events).iter().all(|k| *k != EventKind::Replanning));

    let done = data_of(&events, EventKind::TaskDone);
    assert_eq!(done[0]["steps_completed"], 3);
    assert_eq!(done[0]["steps_failed"], 1);
    assert_eq!(done[0]["steps_skipped"], 4);

    // Results from the healthy branch still make it to the output.
    assert!(task.output.unwrap()["total_results"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn cancellation_is_cooperative_and_terminal() {
    let pipeline = build_pipeline(
        Arc::new(SlowBrowser::new(Duration::from_millis(1500))),
        Arc::new(MockLlm::new()),
    );

    let task = pipeline
        .submit("Find laptops on Amazon", OutputFormat::Json, None)
        .await;
    let subscription = pipeline.broadcaster().subscribe(&task.task_id);
    let events_fut = tokio::spawn(collect_until_done(subscription));

    let runner = {
        let pipeline = Arc::clone(&pipeline);
        let task_id = task.task_id.clone();
        tokio::spawn(async move { pipeline.run(&task_id).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    pipeline.cancel(&task.task_id).await.expect("task exists");

    let finished = runner.await.unwrap().expect("task exists");
    assert_eq!(finished.status, TaskStatus::Cancelled);

    let events = events_fut.await.unwrap();
    let done = data_of(&events, EventKind::TaskDone);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["status"], "cancelled");
}

#[tokio::test]
async fn cancel_after_terminal_is_a_noop() {
    let pipeline = mock_pipeline();
    let (task, _) = run_to_done(&pipeline, "Find laptops on Amazon", OutputFormat::Json).await;
    assert_eq!(task.status, TaskStatus::Completed);

    let after = pipeline.cancel(&task.task_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
}

#[tokio::test]
async fn planner_hard_error_hits_the_fault_floor() {
    // The scripted LLM emits a dependency cycle, which plan ingestion
    // rejects outright.
    let cycle = r#"[
        {"action": "navigate", "target": "https://a.com", "description": "a", "depends_on": [1]},
        {"action": "extract", "target": "https://a.com", "description": "b", "depends_on": [0]}
    ]"#;
    let pipeline = build_pipeline(
        Arc::new(MockBrowser::new()),
        Arc::new(ScriptedLlm(cycle.to_string())),
    );

    let (task, events) = run_to_done(&pipeline, "anything at all", OutputFormat::Json).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("cycle"));

    let done = data_of(&events, EventKind::TaskDone);
    assert_eq!(done.len(), 1, "fault floor still emits task_done");
    assert_eq!(done[0]["status"], "failed");
}

#[tokio::test]
async fn task_state_survives_store_roundtrip() {
    let pipeline = mock_pipeline();
    let (task, _) = run_to_done(&pipeline, "Find laptops on Amazon", OutputFormat::Json).await;

    let stored = pipeline.store().get(&task.task_id).await.unwrap();
    assert_eq!(stored, task);

    let json = serde_json::to_string(&stored).unwrap();
    let back: courier_store::models::Task = serde_json::from_str(&json).unwrap();
    assert_eq!(back, stored);
}

#[tokio::test]
async fn run_refuses_non_queued_tasks() {
    let pipeline = mock_pipeline();
    let (task, _) = run_to_done(&pipeline, "Find laptops on Amazon", OutputFormat::Json).await;

    // Running again must not restart a terminal task.
    let again = pipeline.run(&task.task_id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Completed);
    assert_eq!(again.finished_at, task.finished_at);
}
