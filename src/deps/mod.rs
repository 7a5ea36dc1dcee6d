// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Dependency index
//!
//! Inverted maps over the artifact graph: which task produces each output
//! path, which tasks consume each input path, and the input/output sets
//! per task. Every output path belongs to exactly one task; a duplicate is
//! a fatal configuration error.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::errors::{StepflowError, StepflowResult};
use crate::runs::RunSet;

/// Inverted dependency maps, populated as runs publish artifacts.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    producer: BTreeMap<PathBuf, String>,
    consumers: BTreeMap<PathBuf, BTreeSet<String>>,
    inputs: BTreeMap<String, BTreeSet<PathBuf>>,
    outputs: BTreeMap<String, BTreeSet<PathBuf>>,
}

impl DependencyIndex {
    /// Build the index from all enumerated runs.
    pub fn build(runs: &RunSet) -> StepflowResult<Self> {
        let mut index = Self::default();
        for run in runs.all() {
            let task_id = run.task_id();
            for output in &run.outputs {
                index.add_output(&task_id, &output.path)?;
                for input in &output.inputs {
                    index.add_input(&task_id, input);
                }
            }
        }
        Ok(index)
    }

    fn add_output(&mut self, task_id: &str, path: &Path) -> StepflowResult<()> {
        if self
            .producer
            .insert(path.to_path_buf(), task_id.to_string())
            .is_some()
        {
            return Err(StepflowError::DuplicateOutput {
                path: path.to_path_buf(),
            });
        }
        self.outputs
            .entry(task_id.to_string())
            .or_default()
            .insert(path.to_path_buf());
        Ok(())
    }

    fn add_input(&mut self, task_id: &str, path: &Path) {
        self.consumers
            .entry(path.to_path_buf())
            .or_default()
            .insert(task_id.to_string());
        self.inputs
            .entry(task_id.to_string())
            .or_default()
            .insert(path.to_path_buf());
    }

    /// Task producing the given output path.
    pub fn producer_of(&self, path: &Path) -> Option<&str> {
        self.producer.get(path).map(String::as_str)
    }

    /// Tasks consuming the given input path.
    pub fn consumers_of(&self, path: &Path) -> impl Iterator<Item = &str> {
        self.consumers
            .get(path)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Input paths of a task.
    pub fn inputs_of(&self, task_id: &str) -> impl Iterator<Item = &PathBuf> {
        self.inputs.get(task_id).into_iter().flatten()
    }

    /// Output paths of a task.
    pub fn outputs_of(&self, task_id: &str) -> impl Iterator<Item = &PathBuf> {
        self.outputs.get(task_id).into_iter().flatten()
    }

    /// Parent tasks: producers of the task's inputs, minus the task
    /// itself.
    pub fn parents_of(&self, task_id: &str) -> BTreeSet<String> {
        self.inputs_of(task_id)
            .filter_map(|path| self.producer.get(path))
            .filter(|producer| producer.as_str() != task_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::Run;

    fn index_from(runs: Vec<Run>) -> StepflowResult<DependencyIndex> {
        // Feed runs through the public surface the enumerator would use.
        let mut set = RunSetBuilder::default();
        for run in runs {
            set.push(run);
        }
        DependencyIndex::build(&set.build())
    }

    #[derive(Default)]
    struct RunSetBuilder {
        runs: Vec<Run>,
    }

    impl RunSetBuilder {
        fn push(&mut self, run: Run) {
            self.runs.push(run);
        }

        fn build(self) -> RunSet {
            let mut set = RunSet::default();
            for run in self.runs {
                set.insert_for_tests(run);
            }
            set
        }
    }

    #[test]
    fn test_duplicate_output_is_fatal() {
        let mut a = Run::new("a", "main");
        a.add_output("files", PathBuf::from("/dest/foo.bam"), Vec::new());
        let mut b = Run::new("b", "main");
        b.add_output("files", PathBuf::from("/dest/foo.bam"), Vec::new());

        let err = index_from(vec![a, b]).unwrap_err();
        assert!(matches!(err, StepflowError::DuplicateOutput { .. }));
    }

    #[test]
    fn test_parent_resolution() {
        let mut source = Run::new("input", "s1");
        source.add_output("files", PathBuf::from("/data/s1.txt"), Vec::new());
        let mut consumer = Run::new("count", "s1");
        consumer.add_output(
            "files",
            PathBuf::from("/dest/count/s1/s1.out"),
            vec![PathBuf::from("/data/s1.txt")],
        );

        let index = index_from(vec![source, consumer]).unwrap();
        assert_eq!(index.producer_of(Path::new("/data/s1.txt")), Some("input/s1"));
        let parents = index.parents_of("count/s1");
        assert_eq!(parents.len(), 1);
        assert!(parents.contains("input/s1"));
        let consumers: Vec<&str> = index.consumers_of(Path::new("/data/s1.txt")).collect();
        assert_eq!(consumers, vec!["count/s1"]);
    }

    #[test]
    fn test_output_sets_are_disjoint() {
        let mut a = Run::new("a", "main");
        a.add_output("files", PathBuf::from("/dest/a/main/x"), Vec::new());
        let mut b = Run::new("b", "main");
        b.add_output("files", PathBuf::from("/dest/b/main/y"), Vec::new());

        let index = index_from(vec![a, b]).unwrap();
        let a_outputs: BTreeSet<&PathBuf> = index.outputs_of("a/main").collect();
        let b_outputs: BTreeSet<&PathBuf> = index.outputs_of("b/main").collect();
        assert!(a_outputs.is_disjoint(&b_outputs));
    }
}
