// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Task state machine
//!
//! A task's state is derived on demand from filesystem evidence and its
//! parents' states; nothing is persisted. When several conditions apply
//! the more advanced state wins, in the order
//! FINISHED > VOLATILIZED > EXECUTING > QUEUED > BAD > CHANGED > READY >
//! WAITING > UNDETERMINABLE.

pub mod annotation;
pub mod ping;

pub use annotation::{version_fingerprint, Annotation, InputComponent};
pub use ping::{ExecutingPing, PingFiles, QueuedPing, HEARTBEAT_INTERVAL, STALE_AFTER};

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::SystemTime;

use crate::tools::ToolRegistry;
use crate::volatile::Placeholder;
use crate::workflow::Workflow;

/// Possible states of a task. Variants are declared in ascending
/// precedence so the maximum of applicable candidates wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    Undeterminable,
    Waiting,
    Ready,
    Changed,
    Bad,
    Queued,
    Executing,
    Volatilized,
    Finished,
}

impl TaskState {
    /// Terminal states satisfy downstream dependencies.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Volatilized)
    }

    pub fn all() -> [TaskState; 9] {
        [
            Self::Waiting,
            Self::Ready,
            Self::Queued,
            Self::Executing,
            Self::Finished,
            Self::Bad,
            Self::Changed,
            Self::Volatilized,
            Self::Undeterminable,
        ]
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::Finished => "FINISHED",
            Self::Bad => "BAD",
            Self::Changed => "CHANGED",
            Self::Volatilized => "VOLATILIZED",
            Self::Undeterminable => "UNDETERMINABLE",
        };
        write!(f, "{}", name)
    }
}

/// Memoized computation of expected version fingerprints. The fingerprint
/// of a task chains its producers' fingerprints, so it is a pure function
/// of configuration, tool fingerprints and source files.
pub struct FingerprintBook<'a> {
    workflow: &'a Workflow,
    tools: &'a ToolRegistry,
    cache: RefCell<BTreeMap<String, String>>,
}

impl<'a> FingerprintBook<'a> {
    pub fn new(workflow: &'a Workflow, tools: &'a ToolRegistry) -> Self {
        Self {
            workflow,
            tools,
            cache: RefCell::new(BTreeMap::new()),
        }
    }

    /// Expected fingerprint of a task (executable or not).
    pub fn expected(&self, task_id: &str) -> String {
        if let Some(cached) = self.cache.borrow().get(task_id) {
            return cached.clone();
        }

        let fingerprint = self.compute(task_id);
        self.cache
            .borrow_mut()
            .insert(task_id.to_string(), fingerprint.clone());
        fingerprint
    }

    fn compute(&self, task_id: &str) -> String {
        let Some(run) = self.workflow.run_of_id(task_id) else {
            return String::new();
        };
        let Some(step_index) = self.workflow.graph.index_of(&run.step_name) else {
            return String::new();
        };
        let node = self.workflow.graph.node(step_index);

        let tool_pairs = self.tools.fingerprints_for(node.tools.iter());

        let mut inputs: Vec<InputComponent> = Vec::new();
        for path in self.workflow.index.inputs_of(task_id) {
            match self.workflow.index.producer_of(path) {
                Some(producer) if producer != task_id => {
                    inputs.push(InputComponent::Produced {
                        path: path.to_string_lossy().into_owned(),
                        fingerprint: self.expected(&producer.to_string()),
                    });
                }
                _ => {
                    let (size, mtime) = file_stamp(path);
                    inputs.push(InputComponent::Source {
                        path: path.to_string_lossy().into_owned(),
                        size,
                        mtime,
                    });
                }
            }
        }
        inputs.sort();

        let mut output_tags: Vec<(String, String)> = run
            .outputs
            .iter()
            .map(|o| {
                (
                    o.tag.clone(),
                    o.path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                )
            })
            .collect();
        output_tags.sort();

        version_fingerprint(&tool_pairs, &node.options, &inputs, &output_tags)
    }
}

fn file_stamp(path: &Path) -> (u64, i64) {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            (meta.len(), mtime)
        }
        Err(_) => (0, 0),
    }
}

/// Derives task states from filesystem evidence.
pub struct StateQuery<'a> {
    workflow: &'a Workflow,
    fingerprints: FingerprintBook<'a>,

    /// Whether stored fingerprints are compared (disabled with
    /// `--no-tool-checks`).
    check_fingerprints: bool,

    /// Batch job ids currently listed by the cluster stat command; `None`
    /// means queue checking is unavailable for this invocation.
    running_jobs: Option<BTreeSet<String>>,

    cache: RefCell<BTreeMap<String, TaskState>>,
}

impl<'a> StateQuery<'a> {
    pub fn new(workflow: &'a Workflow, tools: &'a ToolRegistry, check_fingerprints: bool) -> Self {
        Self {
            workflow,
            fingerprints: FingerprintBook::new(workflow, tools),
            check_fingerprints,
            running_jobs: None,
            cache: RefCell::new(BTreeMap::new()),
        }
    }

    /// Provide the job ids visible to the cluster stat command.
    pub fn with_running_jobs(mut self, jobs: Option<BTreeSet<String>>) -> Self {
        self.running_jobs = jobs;
        self
    }

    pub fn expected_fingerprint(&self, task_id: &str) -> String {
        self.fingerprints.expected(task_id)
    }

    /// State of a task by id.
    pub fn state_of(&self, task_id: &str) -> TaskState {
        if let Some(&cached) = self.cache.borrow().get(task_id) {
            return cached;
        }
        let state = self.compute(task_id);
        self.cache.borrow_mut().insert(task_id.to_string(), state);
        state
    }

    /// Human-readable reason for an abnormal state, for diagnostics.
    pub fn diagnose(&self, task_id: &str) -> Option<String> {
        let run = self.workflow.run_of_id(task_id)?;
        let destination = &self.workflow.config.destination_path;
        let pings = PingFiles::new(&run.output_dir(destination));

        if pings.is_stale() {
            return Some("executing ping heartbeat is stale".to_string());
        }
        if pings.queued_bad_path().exists() {
            return Some("a previous submission failed (queued.bad present)".to_string());
        }
        for path in self.workflow.index.inputs_of(task_id) {
            if let Some(producer) = self.workflow.index.producer_of(path) {
                let producer = producer.to_string();
                if self.state_of(&producer) == TaskState::Volatilized && !path.exists() {
                    return Some(format!(
                        "input {} was volatilized by {}; restore it before re-running",
                        path.display(),
                        producer
                    ));
                }
            }
        }
        None
    }

    fn compute(&self, task_id: &str) -> TaskState {
        let Some(run) = self.workflow.run_of_id(task_id) else {
            return TaskState::Undeterminable;
        };
        let destination = &self.workflow.config.destination_path;

        let output_paths: Vec<&Path> = run.outputs.iter().map(|o| o.path.as_path()).collect();
        let present = output_paths.iter().filter(|p| p.exists()).count();
        let all_present = !output_paths.is_empty() && present == output_paths.len();
        let any_present = present > 0;

        // A run without exec groups (a source) is satisfied by its files
        // simply existing.
        if !run.is_executable() {
            return if all_present {
                TaskState::Finished
            } else {
                TaskState::Waiting
            };
        }

        let mut candidates: Vec<TaskState> = Vec::new();

        // Placeholders with consistent metadata mean the artifacts were
        // legitimately replaced.
        let volatilized_all = !output_paths.is_empty()
            && output_paths.iter().all(|p| {
                !p.exists() && matches!(Placeholder::load(p), Ok(Some(_)))
            });
        if volatilized_all {
            candidates.push(TaskState::Volatilized);
        }

        // Ping evidence.
        let pings = PingFiles::new(&run.output_dir(destination));
        if pings.executing_path().exists() {
            if pings.is_stale() {
                candidates.push(TaskState::Bad);
            } else {
                candidates.push(TaskState::Executing);
            }
        }
        if let Ok(Some(queued)) = pings.read_queued() {
            match &self.running_jobs {
                // Stat output is trusted only when the stat call itself
                // succeeded.
                Some(jobs) if !jobs.contains(&queued.cluster_job_id) => {
                    candidates.push(TaskState::Bad)
                }
                _ => candidates.push(TaskState::Queued),
            }
        }
        if pings.queued_bad_path().exists() {
            candidates.push(TaskState::Bad);
        }

        // Output evidence.
        if all_present {
            let fingerprint_ok = if self.check_fingerprints {
                match Annotation::load(&run.output_dir(destination)) {
                    Ok(Some(annotation)) => {
                        annotation.version_fingerprint == self.fingerprints.expected(task_id)
                    }
                    _ => false,
                }
            } else {
                true
            };
            let newer_than_inputs = self.outputs_newer_than_inputs(task_id, &output_paths);
            if fingerprint_ok && newer_than_inputs {
                candidates.push(TaskState::Finished);
            } else {
                candidates.push(TaskState::Changed);
            }
        } else if any_present && candidates.is_empty() {
            // Partial outputs with no ping evidence: inconsistent.
            candidates.push(TaskState::Undeterminable);
        }

        // Parent evidence.
        if !all_present && !volatilized_all {
            let parents = self.workflow.index.parents_of(task_id);
            let all_terminal = parents
                .iter()
                .all(|parent| self.state_of(parent).is_terminal());
            if all_terminal {
                let mut inputs_ok = true;
                let mut volatilized_input = false;
                for path in self.workflow.index.inputs_of(task_id) {
                    if path.exists() {
                        continue;
                    }
                    match self.workflow.index.producer_of(path) {
                        Some(producer)
                            if self.state_of(&producer.to_string())
                                == TaskState::Volatilized =>
                        {
                            volatilized_input = true;
                        }
                        _ => inputs_ok = false,
                    }
                }
                if volatilized_input {
                    // Execution would need a file that was volatilized;
                    // never silently regenerate it.
                    candidates.push(TaskState::Undeterminable);
                } else if inputs_ok && !any_present {
                    candidates.push(TaskState::Ready);
                } else if !inputs_ok {
                    candidates.push(TaskState::Waiting);
                }
            } else {
                candidates.push(TaskState::Waiting);
            }
        }

        candidates
            .into_iter()
            .max()
            .unwrap_or(TaskState::Undeterminable)
    }

    fn outputs_newer_than_inputs(&self, task_id: &str, outputs: &[&Path]) -> bool {
        let newest_input = self
            .workflow
            .index
            .inputs_of(task_id)
            .filter_map(|p| std::fs::metadata(p).ok())
            .filter_map(|m| m.modified().ok())
            .max();
        let oldest_output = outputs
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .filter_map(|m| m.modified().ok())
            .min();
        match (newest_input, oldest_output) {
            (Some(input), Some(output)) => output >= input,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigModel;
    use crate::steps::StepRegistry;

    fn workflow(dir: &Path, steps_yaml: &str) -> Workflow {
        let yaml = format!(
            "destination_path: {}\nsteps:\n{}",
            dir.display(),
            steps_yaml
        );
        let config = ConfigModel::from_yaml(&yaml, dir, "test.yaml").unwrap();
        Workflow::build(config, &StepRegistry::builtin()).unwrap()
    }

    const CHAIN: &str = "
  make (shell):
    command: [\"printf\", \"x\"]
    output: \"a.txt\"
  use (shell):
    _depends: make
    command: [\"cat\", \"%input%\"]
    output: \"b.txt\"
";

    #[test]
    fn test_fresh_workspace_states() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, false);

        assert_eq!(query.state_of("make/main"), TaskState::Ready);
        assert_eq!(query.state_of("use/main"), TaskState::Waiting);
    }

    #[test]
    fn test_finished_after_outputs_exist() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let out_dir = dir.path().join("make").join("main");
        std::fs::create_dir_all(&out_dir).unwrap();
        std::fs::write(out_dir.join("a.txt"), "x").unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, false);
        assert_eq!(query.state_of("make/main"), TaskState::Finished);
        assert_eq!(query.state_of("use/main"), TaskState::Ready);
    }

    #[test]
    fn test_fingerprint_mismatch_is_changed() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let out_dir = dir.path().join("make").join("main");
        std::fs::create_dir_all(&out_dir).unwrap();
        std::fs::write(out_dir.join("a.txt"), "x").unwrap();
        let annotation = Annotation {
            task: "make/main".into(),
            config_id: "test.yaml".into(),
            created_at: chrono::Utc::now(),
            succeeded: true,
            version_fingerprint: "stale-fingerprint".into(),
            tool_fingerprints: Default::default(),
            processes: Vec::new(),
            pool_log: Vec::new(),
            error: None,
        };
        annotation.save(&out_dir).unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, true);
        assert_eq!(query.state_of("make/main"), TaskState::Changed);
    }

    #[test]
    fn test_matching_fingerprint_is_finished() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let out_dir = dir.path().join("make").join("main");
        std::fs::create_dir_all(&out_dir).unwrap();
        std::fs::write(out_dir.join("a.txt"), "x").unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, true);
        let expected = query.expected_fingerprint("make/main");
        let annotation = Annotation {
            task: "make/main".into(),
            config_id: "test.yaml".into(),
            created_at: chrono::Utc::now(),
            succeeded: true,
            version_fingerprint: expected,
            tool_fingerprints: Default::default(),
            processes: Vec::new(),
            pool_log: Vec::new(),
            error: None,
        };
        annotation.save(&out_dir).unwrap();

        let query = StateQuery::new(&wf, &tools, true);
        assert_eq!(query.state_of("make/main"), TaskState::Finished);
    }

    #[test]
    fn test_executing_ping_wins_over_ready() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let out_dir = dir.path().join("make").join("main");
        let pings = PingFiles::new(&out_dir);
        pings
            .write_executing(&ExecutingPing {
                start_time: chrono::Utc::now(),
                host: "h".into(),
                pid: 1,
                cores_requested: 1,
            })
            .unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, false);
        assert_eq!(query.state_of("make/main"), TaskState::Executing);
    }

    #[test]
    fn test_queued_ping_with_dead_job_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let out_dir = dir.path().join("make").join("main");
        let pings = PingFiles::new(&out_dir);
        pings
            .write_queued(&QueuedPing {
                submit_time: chrono::Utc::now(),
                cluster_job_id: "424242".into(),
                user: "u".into(),
                host: "h".into(),
                config_id: "test.yaml".into(),
            })
            .unwrap();

        let tools = ToolRegistry::unchecked();

        // Stat succeeded but does not list the job: failed.
        let query = StateQuery::new(&wf, &tools, false)
            .with_running_jobs(Some(BTreeSet::new()));
        assert_eq!(query.state_of("make/main"), TaskState::Bad);

        // Job id re-appears in stat output: queued again.
        let query = StateQuery::new(&wf, &tools, false)
            .with_running_jobs(Some(BTreeSet::from(["424242".to_string()])));
        assert_eq!(query.state_of("make/main"), TaskState::Queued);

        // Stat unavailable: queue checking disabled, stay queued.
        let query = StateQuery::new(&wf, &tools, false).with_running_jobs(None);
        assert_eq!(query.state_of("make/main"), TaskState::Queued);
    }

    #[test]
    fn test_volatilized_and_consumer_undeterminable() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let out_dir = dir.path().join("make").join("main");
        std::fs::create_dir_all(&out_dir).unwrap();
        let artifact = out_dir.join("a.txt");
        std::fs::write(&artifact, "x").unwrap();
        crate::volatile::volatilize_file(&artifact).unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, false);
        assert_eq!(query.state_of("make/main"), TaskState::Volatilized);
        // The consumer would need the volatilized file: never silently
        // regenerate.
        assert_eq!(query.state_of("use/main"), TaskState::Undeterminable);
        assert!(query.diagnose("use/main").unwrap().contains("volatilized"));
    }

    #[test]
    fn test_queued_bad_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), CHAIN);
        let out_dir = dir.path().join("make").join("main");
        let pings = PingFiles::new(&out_dir);
        pings
            .write_queued(&QueuedPing {
                submit_time: chrono::Utc::now(),
                cluster_job_id: "1".into(),
                user: "u".into(),
                host: "h".into(),
                config_id: "c".into(),
            })
            .unwrap();
        pings.mark_queued_bad().unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, false);
        assert_eq!(query.state_of("make/main"), TaskState::Bad);
    }
}
