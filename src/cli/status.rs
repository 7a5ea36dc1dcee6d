// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Status command - report task states

use colored::Colorize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::StepflowResult;
use crate::orchestrator::running_job_ids;
use crate::state::ping::PingFiles;
use crate::state::{StateQuery, TaskState};

pub async fn run(
    config_path: &Path,
    details: bool,
    cluster: &str,
    cluster_config: Option<&Path>,
    no_tool_checks: bool,
) -> StepflowResult<()> {
    let ctx = super::load_context(config_path, no_tool_checks).await?;
    let workflow = &ctx.workflow;

    // Queue evidence matters only when queued pings exist; the stat call
    // is skipped (with a warning) when no cluster can be reached.
    let has_queued = workflow.tasks.iter().any(|task| {
        let run = workflow.run_of(task);
        PingFiles::new(&run.output_dir(&workflow.config.destination_path))
            .queued_path()
            .exists()
    });
    let running = if has_queued {
        let table = super::load_cluster_table(cluster_config)?;
        match table.resolve(cluster).await {
            Ok(cluster_type) => {
                let jobs = running_job_ids(table.get(&cluster_type)?).await;
                if jobs.is_none() {
                    tracing::warn!(
                        "Cannot check queued ping files; the cluster stat command failed"
                    );
                }
                jobs
            }
            Err(_) => {
                tracing::warn!(
                    "Cannot check queued ping files; no cluster engine is available here"
                );
                None
            }
        }
    } else {
        None
    };

    let query = StateQuery::new(workflow, &ctx.tools, ctx.check_fingerprints)
        .with_running_jobs(running);

    let mut counts: BTreeMap<TaskState, usize> = BTreeMap::new();
    let mut listing: Vec<(String, TaskState)> = Vec::new();
    for task in &workflow.tasks {
        let state = query.state_of(&task.id());
        *counts.entry(state).or_default() += 1;
        listing.push((task.id(), state));
    }

    if details {
        for (task_id, state) in &listing {
            println!("[{}] {}", paint(*state), task_id);
            if matches!(state, TaskState::Bad | TaskState::Undeterminable) {
                if let Some(reason) = query.diagnose(task_id) {
                    println!("    {}", reason.dimmed());
                }
            }
        }
        println!();
    }

    for state in TaskState::all() {
        if let Some(count) = counts.get(&state) {
            println!("{:>5} {}", count, paint(state));
        }
    }
    println!("{:>5} total", workflow.tasks.len());

    Ok(())
}

fn paint(state: TaskState) -> colored::ColoredString {
    let text = state.to_string();
    match state {
        TaskState::Finished | TaskState::Volatilized => text.green(),
        TaskState::Executing | TaskState::Queued => text.blue(),
        TaskState::Ready => text.cyan(),
        TaskState::Waiting => text.normal(),
        TaskState::Changed => text.yellow(),
        TaskState::Bad | TaskState::Undeterminable => text.red(),
    }
}
