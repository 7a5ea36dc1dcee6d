// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Execution orchestrator
//!
//! Drives READY tasks to completion. Locally, a bounded worker pool runs
//! tasks via the process-pipeline executor; a failure stops admission of
//! new tasks but lets outstanding ones finish. In cluster mode, tasks are
//! rendered into submission commands from the cluster command table and
//! the resulting job re-invokes the driver with `run <task-id>`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;

use crate::config::{ClusterCommands, ClusterTable};
use crate::errors::{StepflowError, StepflowResult};
use crate::exec::task::execute_task;
use crate::state::ping::{PingFiles, QueuedPing};
use crate::state::{StateQuery, TaskState};
use crate::tools::ToolRegistry;
use crate::workflow::Workflow;

/// Options for local execution.
#[derive(Debug, Clone)]
pub struct LocalOptions {
    /// Maximum concurrently running tasks.
    pub max_parallel: usize,

    /// Core budget shared by running tasks.
    pub total_cores: u32,

    /// Compare stored fingerprints when deriving states.
    pub check_fingerprints: bool,
}

impl Default for LocalOptions {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            max_parallel: 4,
            total_cores: cores,
            check_fingerprints: true,
        }
    }
}

/// Run eligible tasks locally until nothing more can be admitted.
///
/// On SIGINT, admission stops and running tasks are terminated with the
/// executor's usual grace; cluster jobs are left untouched.
pub async fn run_local(
    workflow: Arc<Workflow>,
    tools: Arc<ToolRegistry>,
    wish_patterns: &[String],
    options: LocalOptions,
) -> StepflowResult<()> {
    let selected: BTreeSet<String> = workflow
        .wish_list(wish_patterns)?
        .into_iter()
        .map(|t| t.id())
        .collect();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, waiting for running tasks...");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut join_set: tokio::task::JoinSet<(String, StepflowResult<()>)> =
        tokio::task::JoinSet::new();
    let mut scheduled: BTreeSet<String> = BTreeSet::new();
    let mut running_cores: u32 = 0;
    let mut first_failure: Option<StepflowError> = None;

    loop {
        let interrupted = cancel.load(Ordering::Relaxed);

        // Errors inside one task never cancel running siblings; they only
        // prevent admission of new ones.
        if first_failure.is_none() && !interrupted {
            let query = StateQuery::new(&workflow, &tools, options.check_fingerprints);

            // A wished task whose evidence is inconsistent is a hard
            // diagnostic, never silently skipped or regenerated.
            for id in selected.iter().filter(|id| !scheduled.contains(*id)) {
                if query.state_of(id) == TaskState::Undeterminable {
                    first_failure = Some(StepflowError::StateInconsistency {
                        task: id.clone(),
                        reason: query
                            .diagnose(id)
                            .unwrap_or_else(|| "filesystem evidence is inconsistent".into()),
                    });
                    break;
                }
            }

            let ready: Vec<String> = if first_failure.is_none() {
                selected
                    .iter()
                    .filter(|id| !scheduled.contains(*id))
                    .filter(|id| query.state_of(id) == TaskState::Ready)
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };

            for task_id in ready {
                let task = workflow
                    .task(&task_id)
                    .expect("wish list contains known tasks");
                let fits = join_set.len() < options.max_parallel
                    && (join_set.is_empty()
                        || running_cores + task.cores <= options.total_cores);
                if !fits {
                    break;
                }
                tracing::info!("Starting task {}", task_id);
                scheduled.insert(task_id.clone());
                running_cores += task.cores;

                let workflow = Arc::clone(&workflow);
                let tools = Arc::clone(&tools);
                let cancel = Arc::clone(&cancel);
                let id_for_worker = task_id.clone();
                join_set.spawn_blocking(move || {
                    let task = workflow.task(&id_for_worker).expect("known task");
                    let result = execute_task(&workflow, &tools, task, cancel);
                    (id_for_worker, result)
                });
            }
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let (task_id, result) = joined.map_err(|e| StepflowError::Io {
            message: format!("task worker panicked: {}", e),
        })?;
        if let Some(task) = workflow.task(&task_id) {
            running_cores = running_cores.saturating_sub(task.cores);
        }
        match result {
            Ok(()) => tracing::info!("Task {} finished", task_id),
            Err(e) => {
                tracing::error!("Task {} failed: {}", task_id, e);
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
    }

    if cancel.load(Ordering::Relaxed) {
        return Err(StepflowError::Interrupted);
    }
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Job ids listed by the cluster stat command. `None` means the stat call
/// itself failed, in which case queue checking is disabled for this
/// invocation.
pub async fn running_job_ids(commands: &ClusterCommands) -> Option<BTreeSet<String>> {
    let program = commands.stat.first()?;
    let output = Command::new(program)
        .args(&commands.stat[1..])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut ids = BTreeSet::new();
    for line in stdout.lines() {
        if let Some(first) = line.split_whitespace().next() {
            let id: String = first.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !id.is_empty() {
                ids.insert(id);
            }
        }
    }
    Some(ids)
}

/// Queued-or-executing jobs currently recorded for this configuration,
/// counted from ping files.
pub fn active_job_count(workflow: &Workflow) -> usize {
    workflow
        .tasks
        .iter()
        .filter(|task| {
            let run = workflow.run_of(task);
            let pings = PingFiles::new(&run.output_dir(&workflow.config.destination_path));
            pings.queued_path().exists() || pings.executing_path().exists()
        })
        .count()
}

/// Submit eligible tasks to the batch system.
pub async fn submit_to_cluster(
    workflow: &Workflow,
    tools: &ToolRegistry,
    wish_patterns: &[String],
    table: &ClusterTable,
    cluster_type: &str,
    check_fingerprints: bool,
) -> StepflowResult<()> {
    let commands = table.get(cluster_type)?;
    let running = running_job_ids(commands).await;
    if running.is_none() {
        tracing::warn!(
            "Queue status is unavailable; stale queued ping files cannot be detected"
        );
    }

    let query =
        StateQuery::new(workflow, tools, check_fingerprints).with_running_jobs(running);
    let selected = workflow.wish_list(wish_patterns)?;
    let quota = workflow.config.cluster.default_job_quota;

    let mut submitted = 0usize;
    let mut active = active_job_count(workflow);
    for task in selected {
        let task_id = task.id();
        if query.state_of(&task_id) != TaskState::Ready {
            continue;
        }
        if quota > 0 && active >= quota as usize {
            tracing::warn!(
                "Job quota of {} reached; not submitting further tasks",
                quota
            );
            break;
        }

        submit_task(workflow, task_id.as_str(), task.cores, commands).await?;
        submitted += 1;
        active += 1;
    }

    tracing::info!("Submitted {} task(s)", submitted);
    Ok(())
}

async fn submit_task(
    workflow: &Workflow,
    task_id: &str,
    cores: u32,
    commands: &ClusterCommands,
) -> StepflowResult<()> {
    let run = workflow
        .run_of_id(task_id)
        .ok_or_else(|| StepflowError::NoMatchingTask {
            patterns: task_id.to_string(),
        })?;
    let out_dir = run.output_dir(&workflow.config.destination_path);
    std::fs::create_dir_all(&out_dir).map_err(|e| StepflowError::write_error(&out_dir, e))?;
    let pings = PingFiles::new(&out_dir);

    let job_name = format!("sf-{}", task_id.replace('/', "-"));
    let log_path = out_dir.join(".ping").join("submit.log");
    let log_str = log_path.to_string_lossy();
    let cores_str = cores.to_string();
    let mut argv =
        commands.render_submit(&[job_name.as_str(), cores_str.as_str(), log_str.as_ref()])?;

    let extra = if workflow.config.cluster.default_submit_options.is_empty() {
        &commands.default_options
    } else {
        &workflow.config.cluster.default_submit_options
    };
    argv.extend(extra.split_whitespace().map(str::to_string));

    // The submitted script re-invokes the driver for exactly this task.
    let script_path = write_submit_script(workflow, task_id, &out_dir)?;
    argv.push(script_path.to_string_lossy().into_owned());

    // The queued ping exists before the submission so a failure can be
    // recorded by renaming it to .bad.
    let mut ping = QueuedPing {
        submit_time: chrono::Utc::now(),
        cluster_job_id: "pending".into(),
        user: crate::state::ping::username(),
        host: crate::state::ping::hostname(),
        config_id: workflow.config.id.clone(),
    };
    pings.write_queued(&ping)?;

    tracing::info!("Submitting: {}", argv.join(" "));
    let output = Command::new(&argv[0]).args(&argv[1..]).output().await;

    let failed = |reason: String| -> StepflowError {
        if let Err(e) = pings.mark_queued_bad() {
            tracing::warn!("Could not mark queued ping bad: {}", e);
        }
        StepflowError::SubmissionFailed {
            task: task_id.to_string(),
            reason,
        }
    };

    let output = match output {
        Ok(o) => o,
        Err(e) => return Err(failed(e.to_string())),
    };
    if !output.status.success() {
        return Err(failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let job_id = match commands.extract_job_id(&stdout) {
        Ok(id) => id,
        Err(e) => return Err(failed(e.to_string())),
    };
    ping.cluster_job_id = job_id.clone();
    pings.write_queued(&ping)?;
    tracing::info!("Task {} queued as job {}", task_id, job_id);
    Ok(())
}

fn write_submit_script(
    workflow: &Workflow,
    task_id: &str,
    out_dir: &std::path::Path,
) -> StepflowResult<PathBuf> {
    let exe = std::env::current_exe().map_err(StepflowError::from)?;
    let config_path = workflow
        .config
        .source_path
        .clone()
        .unwrap_or_else(|| workflow.config.base_working_directory.join(&workflow.config.id));
    let script = format!(
        "#!/usr/bin/env bash\nexec {} --config {} run {}\n",
        exe.display(),
        config_path.display(),
        task_id
    );
    let path = out_dir.join(".ping").join("submit.sh");
    std::fs::create_dir_all(path.parent().expect("ping dir"))
        .map_err(|e| StepflowError::write_error(&path, e))?;
    std::fs::write(&path, script).map_err(|e| StepflowError::write_error(&path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigModel;
    use crate::steps::StepRegistry;

    fn workflow(dir: &std::path::Path, steps_yaml: &str) -> Arc<Workflow> {
        let yaml = format!(
            "destination_path: {}\nsteps:\n{}",
            dir.display(),
            steps_yaml
        );
        let config = ConfigModel::from_yaml(&yaml, dir, "test.yaml").unwrap();
        Arc::new(Workflow::build(config, &StepRegistry::builtin()).unwrap())
    }

    const CHAIN: &str = "
  make (shell):
    command: [\"printf\", \"line1\\\\n\"]
    output: \"a.txt\"
  use (shell):
    _depends: make
    command: [\"cat\", \"%input%\"]
    output: \"b.txt\"
";

    #[tokio::test]
    async fn test_chain_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let tools = Arc::new(ToolRegistry::unchecked());
        let options = LocalOptions {
            check_fingerprints: false,
            ..LocalOptions::default()
        };

        run_local(Arc::clone(&wf), Arc::clone(&tools), &[], options.clone())
            .await
            .unwrap();

        let b = dir.path().join("use").join("main").join("b.txt");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "line1\n");

        // Idempotence: a second invocation admits nothing and succeeds.
        run_local(Arc::clone(&wf), tools, &[], options).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_stops_admission() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "
  boom (shell):
    command: [\"cat\", \"/nonexistent-stepflow-input\"]
    output: \"a.txt\"
  after (shell):
    _depends: boom
    command: [\"cat\", \"%input%\"]
";
        let wf = workflow(dir.path(), yaml);
        let tools = Arc::new(ToolRegistry::unchecked());
        let options = LocalOptions {
            check_fingerprints: false,
            ..LocalOptions::default()
        };

        let err = run_local(wf, tools, &[], options).await.unwrap_err();
        assert!(matches!(err, StepflowError::TaskFailed { .. }));
        assert!(!dir.path().join("after").join("main").join("main.out").exists());
    }

    #[test]
    fn test_active_job_count_reads_pings() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        assert_eq!(active_job_count(&wf), 0);

        let run = wf.run_of_id("make/main").unwrap();
        let pings = PingFiles::new(&run.output_dir(&wf.config.destination_path));
        pings
            .write_queued(&QueuedPing {
                submit_time: chrono::Utc::now(),
                cluster_job_id: "9".into(),
                user: "u".into(),
                host: "h".into(),
                config_id: "c".into(),
            })
            .unwrap();
        assert_eq!(active_job_count(&wf), 1);
    }
}
