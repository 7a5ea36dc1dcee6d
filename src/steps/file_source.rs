// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! File source step
//!
//! Publishes pre-existing files as runs, one run per sample. Files are
//! matched by a glob pattern or listed explicitly; an optional regex with
//! one capture group derives the run id from the file name (files sharing
//! a capture are grouped into one run).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::{StepContext, StepKind, StepType};
use crate::errors::StepflowResult;
use crate::runs::Run;

/// Port the matched files are published on.
pub const SOURCE_PORT: &str = "files";

pub struct FileSourceStep;

impl StepType for FileSourceStep {
    fn module(&self) -> &'static str {
        "file_source"
    }

    fn kind(&self) -> StepKind {
        StepKind::Source
    }

    fn required_tools(&self, _options: &BTreeMap<String, serde_yaml::Value>) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn plan_runs(&self, ctx: &StepContext) -> StepflowResult<Vec<Run>> {
        let mut files: Vec<PathBuf> = Vec::new();

        if let Some(pattern) = ctx.opt_str("pattern") {
            let full_pattern = if std::path::Path::new(&pattern).is_absolute() {
                pattern
            } else {
                ctx.base_dir.join(&pattern).to_string_lossy().into_owned()
            };
            for entry in glob::glob(&full_pattern)? {
                if let Ok(path) = entry {
                    files.push(path);
                }
            }
        }

        if let Some(listed) = ctx.options.get("files").and_then(|v| v.as_sequence()) {
            for value in listed {
                if let Some(s) = value.as_str() {
                    let path = std::path::Path::new(s);
                    if path.is_absolute() {
                        files.push(path.to_path_buf());
                    } else {
                        files.push(ctx.base_dir.join(path));
                    }
                }
            }
        }

        if files.is_empty() {
            return Err(ctx.invalid_option(
                "pattern",
                "no files matched; set 'pattern' or 'files'",
            ));
        }
        files.sort();

        let group_re = match ctx.opt_str("group") {
            Some(pattern) => Some(
                regex::Regex::new(&pattern)
                    .map_err(|e| ctx.invalid_option("group", e.to_string()))?,
            ),
            None => None,
        };

        let mut grouped: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for file in files {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let run_id = match &group_re {
                Some(re) => match re.captures(&file_name).and_then(|c| c.get(1)) {
                    Some(m) => m.as_str().to_string(),
                    None => continue,
                },
                None => file
                    .file_stem()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(file_name),
            };
            grouped.entry(run_id).or_default().push(file);
        }

        let mut runs = Vec::new();
        for (run_id, group) in grouped {
            let mut run = Run::new(ctx.step_name, &run_id);
            for file in &group {
                run.add_output(SOURCE_PORT, file.clone(), Vec::new());
            }
            run.set_public_info(
                "file_count",
                serde_yaml::Value::Number(group.len().into()),
            );
            runs.push(run);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn plan(dir: &std::path::Path, options: BTreeMap<String, serde_yaml::Value>) -> Vec<Run> {
        let constants = BTreeMap::new();
        let ctx = StepContext {
            step_name: "input",
            options: &options,
            constants: &constants,
            base_dir: dir,
            destination: dir,
            upstream: &[],
        };
        FileSourceStep.plan_runs(&ctx).unwrap()
    }

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::Value::String(s.to_string())
    }

    #[test]
    fn test_one_run_per_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample1.txt"), "a").unwrap();
        std::fs::write(dir.path().join("sample2.txt"), "b").unwrap();

        let mut options = BTreeMap::new();
        options.insert("pattern".to_string(), yaml("*.txt"));
        let runs = plan(dir.path(), options);

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "sample1");
        assert_eq!(runs[0].port(SOURCE_PORT).len(), 1);
        assert!(!runs[0].is_executable());
    }

    #[test]
    fn test_grouping_regex_merges_mates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("s1_R1.fastq"), "a").unwrap();
        std::fs::write(dir.path().join("s1_R2.fastq"), "b").unwrap();

        let mut options = BTreeMap::new();
        options.insert("pattern".to_string(), yaml("*.fastq"));
        options.insert("group".to_string(), yaml(r"^(.*)_R[12]\.fastq$"));
        let runs = plan(dir.path(), options);

        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "s1");
        assert_eq!(runs[0].port(SOURCE_PORT).len(), 2);
    }

    #[test]
    fn test_no_match_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = BTreeMap::new();
        options.insert("pattern".to_string(), yaml("*.missing"));
        let constants = BTreeMap::new();
        let ctx = StepContext {
            step_name: "input",
            options: &options,
            constants: &constants,
            base_dir: dir.path(),
            destination: dir.path(),
            upstream: &[],
        };
        assert!(FileSourceStep.plan_runs(&ctx).is_err());
    }
}
