// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Runs: concrete invocations of a step
//!
//! A run is identified by `(step name, run id)`. It publishes output files
//! on named `out/` ports, declares the input files each output depends on,
//! and optionally carries exec groups. Runs are enumerated per step in
//! topological order and cached for the rest of the invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::ConfigModel;
use crate::errors::{StepflowError, StepflowResult};
use crate::exec::ExecGroup;
use crate::graph::StepGraph;
use crate::steps::StepContext;
use crate::utils::natural_cmp;

/// One declared output file of a run.
#[derive(Debug, Clone)]
pub struct OutputFile {
    /// Final path under the destination.
    pub path: PathBuf,

    /// Connection tag the file is published on (`out/<tag>`).
    pub tag: String,

    /// Input files this output depends on.
    pub inputs: Vec<PathBuf>,
}

/// A concrete execution unit attached to a step.
#[derive(Debug, Clone)]
pub struct Run {
    pub step_name: String,
    pub run_id: String,

    pub outputs: Vec<OutputFile>,

    /// Published files per `out/` port.
    pub out_ports: BTreeMap<String, Vec<PathBuf>>,

    /// Info visible to downstream runs.
    pub public_info: BTreeMap<String, serde_yaml::Value>,

    /// Info private to this run.
    pub private_info: BTreeMap<String, serde_yaml::Value>,

    pub exec_groups: Vec<ExecGroup>,
}

impl Run {
    pub fn new(step_name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            run_id: run_id.into(),
            outputs: Vec::new(),
            out_ports: BTreeMap::new(),
            public_info: BTreeMap::new(),
            private_info: BTreeMap::new(),
            exec_groups: Vec::new(),
        }
    }

    /// Task id of this run.
    pub fn task_id(&self) -> String {
        format!("{}/{}", self.step_name, self.run_id)
    }

    /// Declare an output file on a port, with the inputs it depends on.
    pub fn add_output(&mut self, tag: &str, path: PathBuf, inputs: Vec<PathBuf>) -> &mut Self {
        self.out_ports
            .entry(tag.to_string())
            .or_default()
            .push(path.clone());
        self.outputs.push(OutputFile {
            path,
            tag: tag.to_string(),
            inputs,
        });
        self
    }

    pub fn add_exec_group(&mut self, group: ExecGroup) -> &mut Self {
        self.exec_groups.push(group);
        self
    }

    pub fn set_public_info(&mut self, key: &str, value: serde_yaml::Value) -> &mut Self {
        self.public_info.insert(key.to_string(), value);
        self
    }

    /// A task is executable iff its run has at least one exec group.
    pub fn is_executable(&self) -> bool {
        !self.exec_groups.is_empty()
    }

    /// Directory the run's final outputs live in.
    pub fn output_dir(&self, destination: &Path) -> PathBuf {
        destination.join(&self.step_name).join(&self.run_id)
    }

    /// Scratch directory for in-flight outputs of this run.
    pub fn temp_dir(&self, destination: &Path) -> PathBuf {
        destination
            .join("temp")
            .join(format!("{}-{}", self.step_name, self.run_id))
    }

    /// Files published on an `out/` port.
    pub fn port(&self, tag: &str) -> &[PathBuf] {
        self.out_ports.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// All enumerated runs, per step, in natural run-id order.
#[derive(Debug, Default)]
pub struct RunSet {
    per_step: BTreeMap<String, Vec<Run>>,
}

impl RunSet {
    /// Enumerate runs for every step in topological order.
    ///
    /// Each step sees the published ports and public info of all upstream
    /// runs; run ids must be unique per step.
    pub fn enumerate(config: &ConfigModel, graph: &StepGraph) -> StepflowResult<Self> {
        let mut per_step: BTreeMap<String, Vec<Run>> = BTreeMap::new();

        for &idx in graph.order() {
            let node = graph.node(idx);
            let upstream: Vec<&Run> = node
                .parents
                .iter()
                .flat_map(|&p| {
                    per_step
                        .get(&graph.node(p).name)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                })
                .collect();

            let ctx = StepContext {
                step_name: &node.name,
                options: &node.options,
                constants: &config.constants,
                base_dir: &config.base_working_directory,
                destination: &config.destination_path,
                upstream: &upstream,
            };

            let mut runs = node.imp.plan_runs(&ctx)?;

            let mut seen = std::collections::BTreeSet::new();
            for run in &runs {
                debug_assert_eq!(run.step_name, node.name);
                if !seen.insert(run.run_id.clone()) {
                    return Err(StepflowError::DuplicateRun {
                        step: node.name.clone(),
                        run_id: run.run_id.clone(),
                    });
                }
            }
            runs.sort_by(|a, b| natural_cmp(&a.run_id, &b.run_id));

            per_step.insert(node.name.clone(), runs);
        }

        Ok(Self { per_step })
    }

    pub fn of_step(&self, step_name: &str) -> &[Run] {
        self.per_step
            .get(step_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, step_name: &str, run_id: &str) -> Option<&Run> {
        self.of_step(step_name).iter().find(|r| r.run_id == run_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Run> {
        self.per_step.values().flatten()
    }
}

#[cfg(test)]
impl RunSet {
    /// Insert a hand-built run, bypassing enumeration.
    pub(crate) fn insert_for_tests(&mut self, run: Run) {
        self.per_step
            .entry(run.step_name.clone())
            .or_default()
            .push(run);
    }
}
