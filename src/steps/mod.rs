// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Step types and the step registry
//!
//! A step type is a named factory with a declared contract: which tools it
//! needs, what kind of step it is, and how it enumerates runs given its
//! options and the upstream runs. Registration is explicit at process
//! init; configuration refers to step types by module name.

mod file_source;
mod shell;

pub use file_source::FileSourceStep;
pub use shell::ShellStep;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{StepflowError, StepflowResult};
use crate::runs::Run;

/// Classification of a step, used for scheduling tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Publishes pre-existing files; has no exec groups.
    Source,

    /// Sanity-checks sources; forced to run first among its tie.
    SourceController,

    /// Regular processing step.
    Processing,
}

/// Everything a step sees while enumerating its runs.
pub struct StepContext<'a> {
    pub step_name: &'a str,
    pub options: &'a BTreeMap<String, serde_yaml::Value>,
    pub constants: &'a BTreeMap<String, serde_yaml::Value>,
    pub base_dir: &'a Path,
    pub destination: &'a Path,

    /// Runs of all parent steps, in topological parent order.
    pub upstream: &'a [&'a Run],
}

impl StepContext<'_> {
    /// Final path of an output file of this step.
    pub fn output_path(&self, run_id: &str, name: &str) -> PathBuf {
        self.destination.join(self.step_name).join(run_id).join(name)
    }

    /// Scratch path the output is written to before publication.
    pub fn temp_path(&self, run_id: &str, name: &str) -> PathBuf {
        self.destination
            .join("temp")
            .join(format!("{}-{}", self.step_name, run_id))
            .join(name)
    }

    pub fn opt_str(&self, key: &str) -> Option<String> {
        self.options
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(|v| v.as_bool())
    }

    /// Upstream files published on the named `out/` port, with the run
    /// that published them.
    pub fn upstream_port(&self, tag: &str) -> Vec<(&Run, &[PathBuf])> {
        self.upstream
            .iter()
            .filter(|r| !r.port(tag).is_empty())
            .map(|r| (*r, r.port(tag)))
            .collect()
    }

    pub fn invalid_option(&self, option: &str, reason: impl Into<String>) -> StepflowError {
        StepflowError::InvalidStepOption {
            step: self.step_name.to_string(),
            option: option.to_string(),
            reason: reason.into(),
        }
    }
}

/// Contract implemented by every step type.
pub trait StepType: Send + Sync {
    /// Module name the configuration refers to.
    fn module(&self) -> &'static str;

    fn kind(&self) -> StepKind {
        StepKind::Processing
    }

    /// Tool ids the step requires, given its options.
    fn required_tools(&self, options: &BTreeMap<String, serde_yaml::Value>) -> BTreeSet<String>;

    /// Enumerate the runs of this step.
    fn plan_runs(&self, ctx: &StepContext) -> StepflowResult<Vec<Run>>;
}

/// Explicit registry of step types.
#[derive(Clone, Default)]
pub struct StepRegistry {
    by_module: BTreeMap<String, Arc<dyn StepType>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the step types shipped with stepflow.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FileSourceStep));
        registry.register(Arc::new(ShellStep));
        registry
    }

    pub fn register(&mut self, step: Arc<dyn StepType>) {
        self.by_module.insert(step.module().to_string(), step);
    }

    pub fn get(&self, module: &str) -> Option<Arc<dyn StepType>> {
        self.by_module.get(module).cloned()
    }

    pub fn modules(&self) -> Vec<&str> {
        self.by_module.keys().map(String::as_str).collect()
    }
}
