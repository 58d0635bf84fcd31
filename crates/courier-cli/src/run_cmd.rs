//! One-shot execution: run a single command to completion and print the
//! formatted output.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use courier_core::pipeline::Pipeline;
use courier_store::models::{OutputFormat, TaskStatus};

pub async fn run_command(
    pipeline: &Arc<Pipeline>,
    command: &str,
    format: OutputFormat,
) -> Result<()> {
    let trimmed = command.trim();
    if trimmed.is_empty() || trimmed.len() > 2000 {
        bail!("command must be between 1 and 2000 characters");
    }

    let task = pipeline.submit(trimmed, format, None).await;
    tracing::info!(task_id = %task.task_id, "task submitted");

    let finished = pipeline
        .run(&task.task_id)
        .await
        .context("task vanished during execution")?;

    match &finished.output {
        Some(Value::String(text)) => println!("{text}"),
        Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
        None => {}
    }

    eprintln!(
        "task {} finished: {} ({} ms, ${:.4})",
        finished.task_id,
        finished.status,
        finished.duration_ms.unwrap_or(0),
        finished.cost_usd,
    );

    if finished.status == TaskStatus::Failed {
        bail!(
            "task failed: {}",
            finished.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
