// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Workflow context
//!
//! Assembles the full pipeline from a validated configuration: step graph,
//! enumerated runs, dependency index and the topologically ordered task
//! list. The workflow value is threaded through everything that needs it;
//! there is no process-wide singleton.

use std::collections::BTreeMap;

use crate::config::ConfigModel;
use crate::deps::DependencyIndex;
use crate::errors::{StepflowError, StepflowResult};
use crate::graph::StepGraph;
use crate::runs::{Run, RunSet};
use crate::steps::{StepKind, StepRegistry};

/// `(run, ordinal)`: one executable unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    pub step_index: usize,
    pub step_name: String,
    pub run_id: String,
    pub ordinal: usize,
    pub cores: u32,
}

impl Task {
    pub fn id(&self) -> String {
        format!("{}/{}", self.step_name, self.run_id)
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.step_name, self.run_id)
    }
}

/// The fully expanded pipeline for one configuration.
pub struct Workflow {
    pub config: ConfigModel,
    pub graph: StepGraph,
    pub runs: RunSet,
    pub index: DependencyIndex,

    /// Executable tasks (runs with at least one exec group) in
    /// topological order.
    pub tasks: Vec<Task>,

    task_by_id: BTreeMap<String, usize>,
}

impl Workflow {
    /// Expand a configuration into the concrete task graph.
    pub fn build(config: ConfigModel, registry: &StepRegistry) -> StepflowResult<Self> {
        let graph = StepGraph::build(&config, registry)?;

        let unused = config.unused_tools(&graph.used_tools());
        if !unused.is_empty() {
            tracing::warn!("Unused tool(s): {}", unused.join(", "));
        }

        let runs = RunSet::enumerate(&config, &graph)?;
        let index = DependencyIndex::build(&runs)?;

        let mut tasks = Vec::new();
        let mut task_by_id = BTreeMap::new();
        for &step_index in graph.order() {
            let node = graph.node(step_index);
            for run in runs.of_step(&node.name) {
                if !run.is_executable() {
                    continue;
                }
                let task = Task {
                    step_index,
                    step_name: node.name.clone(),
                    run_id: run.run_id.clone(),
                    ordinal: tasks.len(),
                    cores: node.cores,
                };
                task_by_id.insert(task.id(), tasks.len());
                tasks.push(task);
            }
        }

        Ok(Self {
            config,
            graph,
            runs,
            index,
            tasks,
            task_by_id,
        })
    }

    /// The run backing a task.
    pub fn run_of(&self, task: &Task) -> &Run {
        self.runs
            .get(&task.step_name, &task.run_id)
            .expect("task refers to an enumerated run")
    }

    /// The run backing a task id, executable or not.
    pub fn run_of_id(&self, task_id: &str) -> Option<&Run> {
        let (step, run_id) = task_id.split_once('/')?;
        self.runs.get(step, run_id)
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.task_by_id.get(task_id).map(|&i| &self.tasks[i])
    }

    /// Whether a task id belongs to an executable task.
    pub fn is_executable_task(&self, task_id: &str) -> bool {
        self.task_by_id.contains_key(task_id)
    }

    /// Resolve a user-supplied wish list against the task list. Patterns
    /// match exactly or by prefix; an empty wish list selects every task.
    pub fn wish_list(&self, patterns: &[String]) -> StepflowResult<Vec<&Task>> {
        if patterns.is_empty() {
            return Ok(self.tasks.iter().collect());
        }

        let mut selected: Vec<&Task> = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for pattern in patterns {
            if let Some(task) = self.task(pattern) {
                if seen.insert(task.ordinal) {
                    selected.push(task);
                }
                continue;
            }
            for task in &self.tasks {
                if task.id().starts_with(pattern.as_str()) && seen.insert(task.ordinal) {
                    selected.push(task);
                }
            }
        }

        if selected.is_empty() {
            return Err(StepflowError::NoMatchingTask {
                patterns: patterns.join(" "),
            });
        }
        selected.sort_by_key(|t| t.ordinal);
        Ok(selected)
    }

    /// Run ids of source steps, for `report-runs`.
    pub fn source_run_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        for &index in self.graph.order() {
            let node = self.graph.node(index);
            if node.kind != StepKind::Source {
                continue;
            }
            for run in self.runs.of_step(&node.name) {
                out.push(format!("{}/{}", node.name, run.run_id));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_workflow(steps_yaml: &str, dir: &std::path::Path) -> StepflowResult<Workflow> {
        let yaml = format!(
            "destination_path: {}\nsteps:\n{}",
            dir.display(),
            steps_yaml
        );
        let config = ConfigModel::from_yaml(&yaml, dir, "test.yaml")?;
        Workflow::build(config, &StepRegistry::builtin())
    }

    #[test]
    fn test_tasks_in_topological_order() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "
  make (shell):
    command: [\"printf\", \"x\"]
  use (shell):
    _depends: make
    command: [\"cat\", \"%input%\"]
";
        let workflow = build_workflow(yaml, dir.path()).unwrap();
        let ids: Vec<String> = workflow.tasks.iter().map(Task::id).collect();
        assert_eq!(ids, vec!["make/main", "use/main"]);
    }

    #[test]
    fn test_source_runs_are_not_tasks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("s1.txt"), "x").unwrap();
        let yaml = "
  input (file_source):
    pattern: \"*.txt\"
  count (shell):
    _depends: input
    command: [\"wc\", \"-c\", \"%input%\"]
";
        let workflow = build_workflow(yaml, dir.path()).unwrap();
        let ids: Vec<String> = workflow.tasks.iter().map(Task::id).collect();
        assert_eq!(ids, vec!["count/s1"]);
        // The source run still exists and publishes its port.
        assert!(workflow.run_of_id("input/s1").is_some());
        assert_eq!(workflow.source_run_ids(), vec!["input/s1"]);
    }

    #[test]
    fn test_wish_list_prefix_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("s1.txt"), "x").unwrap();
        std::fs::write(dir.path().join("s2.txt"), "y").unwrap();
        let yaml = "
  input (file_source):
    pattern: \"*.txt\"
  count (shell):
    _depends: input
    command: [\"wc\", \"-c\", \"%input%\"]
";
        let workflow = build_workflow(yaml, dir.path()).unwrap();

        let all = workflow.wish_list(&[]).unwrap();
        assert_eq!(all.len(), 2);

        let by_prefix = workflow.wish_list(&["count".to_string()]).unwrap();
        assert_eq!(by_prefix.len(), 2);

        let exact = workflow.wish_list(&["count/s2".to_string()]).unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].run_id, "s2");

        let err = workflow.wish_list(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, StepflowError::NoMatchingTask { .. }));
    }
}
