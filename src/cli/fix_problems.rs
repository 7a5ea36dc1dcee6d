// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Fix-problems command - report and optionally delete stale ping files
//!
//! Diagnostic only unless `--srsly` is given; nothing is mutated by a
//! plain invocation.

use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::errors::StepflowResult;
use crate::orchestrator::running_job_ids;
use crate::state::annotation::Annotation;
use crate::state::ping::PingFiles;
use crate::utils::duration_to_str;

pub async fn run(
    config_path: &Path,
    details: bool,
    first_error: bool,
    srsly: bool,
    cluster: &str,
    cluster_config: Option<&Path>,
    no_tool_checks: bool,
) -> StepflowResult<()> {
    let ctx = super::load_context(config_path, no_tool_checks).await?;
    let workflow = &ctx.workflow;

    let running = {
        let table = super::load_cluster_table(cluster_config)?;
        match table.resolve(cluster).await {
            Ok(cluster_type) => running_job_ids(table.get(&cluster_type)?).await,
            Err(_) => None,
        }
    };
    if running.is_none() {
        println!(
            "Attention, stale queued ping files cannot be checked because this host \
             has no working cluster engine."
        );
    }

    // (task id, ping path, description)
    let mut run_problems: Vec<(String, PathBuf, String)> = Vec::new();
    let mut queue_problems: Vec<(String, PathBuf, String)> = Vec::new();
    let mut bad_problems: Vec<(String, PathBuf, String)> = Vec::new();

    for task in &workflow.tasks {
        let task_id = task.id();
        let run = workflow.run_of(task);
        let out_dir = run.output_dir(&workflow.config.destination_path);
        let pings = PingFiles::new(&out_dir);

        if pings.is_stale() {
            let dead_for = pings
                .executing_age()
                .map(duration_to_str)
                .unwrap_or_else(|| "?".into());
            run_problems.push((
                task_id.clone(),
                pings.executing_path(),
                format!("dead since {}", dead_for),
            ));
        }

        if let Some(jobs) = &running {
            if let Ok(Some(queued)) = pings.read_queued() {
                if !jobs.contains(&queued.cluster_job_id) {
                    queue_problems.push((
                        task_id.clone(),
                        pings.queued_path(),
                        format!(
                            "submitted job {} at {}",
                            queued.cluster_job_id, queued.submit_time
                        ),
                    ));
                }
            }
        }

        if let Ok(Some(bad)) = pings.read_queued_bad() {
            bad_problems.push((
                task_id.clone(),
                pings.queued_bad_path(),
                format!(
                    "submitted job {} at {}",
                    bad.cluster_job_id, bad.submit_time
                ),
            ));
        }
    }

    let mut show_hint = false;
    if !run_problems.is_empty() {
        show_hint = true;
        println!(
            "{}",
            format!(
                "Warning: There are {} stale run ping files.",
                run_problems.len()
            )
            .yellow()
        );
        print_details(&run_problems, details);
    }
    if !queue_problems.is_empty() {
        show_hint = true;
        println!(
            "{}",
            format!(
                "Warning: There are {} tasks marked as queued, but they do not seem \
                 to be queued.",
                queue_problems.len()
            )
            .yellow()
        );
        print_details(&queue_problems, details);
    }
    if !bad_problems.is_empty() {
        println!(
            "Info: Found {} queue files of failed tasks.",
            bad_problems.len()
        );
        print_details(&bad_problems, details);
    }

    if first_error {
        print_first_error(workflow);
    }

    if srsly {
        for (_, path, _) in run_problems
            .iter()
            .chain(queue_problems.iter())
            .chain(bad_problems.iter())
        {
            println!("Now deleting {}...", path.display());
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Could not delete {}: {}", path.display(), e);
            }
        }
    } else if show_hint || !bad_problems.is_empty() {
        println!("Hint: Run 'stepflow fix-problems --details' to see the details.");
        println!("Hint: Run 'stepflow fix-problems --first-error' to investigate what happened.");
        println!(
            "Hint: Run 'stepflow fix-problems --srsly' to fix these problems (that is, \
             delete all problematic ping files)."
        );
    } else {
        println!("No problematic ping files were found.");
    }

    Ok(())
}

fn print_details(problems: &[(String, PathBuf, String)], details: bool) {
    if !details {
        return;
    }
    for (task_id, _, description) in problems {
        println!("  {}: {}", description, task_id);
    }
    println!();
}

/// Show the recorded failure of the first task with a failed annotation.
fn print_first_error(workflow: &crate::workflow::Workflow) {
    for task in &workflow.tasks {
        let run = workflow.run_of(task);
        let out_dir = run.output_dir(&workflow.config.destination_path);
        let Ok(Some(annotation)) = Annotation::load(&out_dir) else {
            continue;
        };
        if annotation.succeeded {
            continue;
        }
        println!();
        println!("{}", format!("First error, in task {}:", task.id()).red());
        if let Some(error) = &annotation.error {
            println!("  {}", error);
        }
        for report in &annotation.processes {
            let failed = !matches!(&report.exit, Some(kind) if kind.success());
            if !failed {
                continue;
            }
            if let Some(stream) = report.stderr.as_ref().or(report.stdout.as_ref()) {
                if !stream.tail.is_empty() {
                    println!("  tail of {}:", report.name);
                    for line in stream.tail.lines() {
                        println!("    {}", line.dimmed());
                    }
                }
            }
        }
        return;
    }
    println!("No failed task annotations were found.");
}
