// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! End-to-end execution of one task
//!
//! Writes the executing ping and keeps its heartbeat alive, runs the exec
//! groups strictly sequentially with outputs staged in the temp subtree,
//! publishes outputs by atomic rename only after the whole task succeeded,
//! and records an annotation either way.

use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;

use crate::errors::{StepflowError, StepflowResult};
use crate::exec::runner::{GroupOutcome, PoolRunner};
use crate::state::annotation::Annotation;
use crate::state::ping::{ExecutingPing, PingFiles, HEARTBEAT_INTERVAL};
use crate::state::FingerprintBook;
use crate::tools::ToolRegistry;
use crate::workflow::{Task, Workflow};

/// Execute a task to completion. Blocking; the orchestrator drives this
/// through its worker pool.
pub fn execute_task(
    workflow: &Workflow,
    tools: &ToolRegistry,
    task: &Task,
    cancel: Arc<AtomicBool>,
) -> StepflowResult<()> {
    let run = workflow.run_of(task);
    let destination = &workflow.config.destination_path;
    let out_dir = run.output_dir(destination);
    let temp_dir = run.temp_dir(destination);
    let task_id = task.id();

    if !run.is_executable() {
        return Err(StepflowError::NotExecutable { task: task_id });
    }

    std::fs::create_dir_all(&temp_dir)
        .map_err(|e| StepflowError::write_error(&temp_dir, e))?;

    // Stale final outputs of a re-run are removed up front so a failure
    // leaves no declared output behind.
    for output in &run.outputs {
        let _ = std::fs::remove_file(&output.path);
    }

    let pings = PingFiles::new(&out_dir);
    pings.write_executing(&ExecutingPing {
        start_time: chrono::Utc::now(),
        host: crate::state::ping::hostname(),
        pid: std::process::id(),
        cores_requested: task.cores,
    })?;

    // Heartbeat: advance the executing ping's mtime until the task ends.
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let heartbeat_pings = pings.clone();
    let heartbeat = std::thread::spawn(move || loop {
        match stop_rx.recv_timeout(HEARTBEAT_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Err(e) = heartbeat_pings.touch_executing() {
                    tracing::warn!("Heartbeat touch failed: {}", e);
                }
            }
            _ => break,
        }
    });

    let result = run_groups(workflow, tools, task, &cancel);

    drop(stop_tx);
    let _ = heartbeat.join();
    pings.remove_executing()?;
    let _ = std::fs::remove_dir_all(&temp_dir);

    result
}

fn run_groups(
    workflow: &Workflow,
    tools: &ToolRegistry,
    task: &Task,
    cancel: &Arc<AtomicBool>,
) -> StepflowResult<()> {
    let run = workflow.run_of(task);
    let destination = &workflow.config.destination_path;
    let out_dir = run.output_dir(destination);
    let temp_dir = run.temp_dir(destination);
    let task_id = task.id();
    let node = workflow.graph.node(task.step_index);

    let mut runner = PoolRunner::new(&workflow.config.tools, Arc::clone(cancel));
    let mut reports = Vec::new();
    let mut pool_log = Vec::new();
    let mut failure: Option<StepflowError> = None;

    for group in &run.exec_groups {
        let GroupOutcome {
            reports: mut group_reports,
            failure: group_failure,
            log: mut group_log,
        } = runner.run_group(group);
        reports.append(&mut group_reports);
        pool_log.append(&mut group_log);
        if let Some(e) = group_failure {
            failure = Some(e);
            break;
        }
    }

    // Publish only after the entire task succeeded: atomic rename from the
    // temp subtree into the destination, one file at a time.
    if failure.is_none() {
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| StepflowError::write_error(&out_dir, e))?;
        for output in &run.outputs {
            let name = output
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let staged = temp_dir.join(&name);
            if !staged.exists() {
                failure = Some(StepflowError::TaskFailed {
                    task: task_id.clone(),
                    reason: format!("declared output '{}' was not produced", name),
                    help: None,
                });
                break;
            }
            std::fs::rename(&staged, &output.path)
                .map_err(|e| StepflowError::write_error(&output.path, e))?;
        }
    }

    let fingerprints = FingerprintBook::new(workflow, tools);
    let annotation = Annotation {
        task: task_id.clone(),
        config_id: workflow.config.id.clone(),
        created_at: chrono::Utc::now(),
        succeeded: failure.is_none(),
        version_fingerprint: fingerprints.expected(&task_id),
        tool_fingerprints: node
            .tools
            .iter()
            .map(|t| (t.clone(), tools.fingerprint(t).to_string()))
            .collect(),
        processes: reports,
        pool_log,
        error: failure.as_ref().map(|e| e.to_string()),
    };
    annotation.save(&out_dir)?;

    match failure {
        None => Ok(()),
        Some(StepflowError::Interrupted) => Err(StepflowError::Interrupted),
        Some(e) => {
            let tail = annotation
                .processes
                .iter()
                .find(|r| !matches!(&r.exit, Some(kind) if kind.success()))
                .and_then(|r| r.stderr.as_ref().or(r.stdout.as_ref()))
                .map(|s| s.tail.clone())
                .filter(|t| !t.is_empty());
            Err(StepflowError::TaskFailed {
                task: task_id,
                reason: e.to_string(),
                help: tail.map(|t| format!("tail of failing stream:\n{}", t)),
            })
        }
    }
}
