// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Task annotations and version fingerprints
//!
//! Every executed task leaves an `.annotation.yaml` in its run directory
//! recording the version fingerprint, the tool fingerprints it was built
//! with, per-process accounting and stream capture metadata. The version
//! fingerprint is a pure function of the tool fingerprints, option values,
//! input components and declared output tags; the state machine compares
//! the recorded value against the freshly computed one to detect drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{StepflowError, StepflowResult};
use crate::exec::ProcessReport;

pub const ANNOTATION_FILE: &str = ".annotation.yaml";

/// Persisted record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub task: String,
    pub config_id: String,
    pub created_at: DateTime<Utc>,
    pub succeeded: bool,

    /// Fingerprint of the task at execution time.
    pub version_fingerprint: String,

    /// Fingerprints of the tools the task used.
    pub tool_fingerprints: BTreeMap<String, String>,

    /// Accounting for every child process, including stream captures.
    pub processes: Vec<ProcessReport>,

    /// Supervisor log lines.
    #[serde(default)]
    pub pool_log: Vec<String>,

    /// Failure description, when the task did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Annotation {
    pub fn path_for(run_output_dir: &Path) -> PathBuf {
        run_output_dir.join(ANNOTATION_FILE)
    }

    /// Load the annotation of a run directory, if present.
    pub fn load(run_output_dir: &Path) -> StepflowResult<Option<Self>> {
        let path = Self::path_for(run_output_dir);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StepflowError::read_error(&path, e)),
        };
        Ok(Some(serde_yaml::from_str(&content)?))
    }

    pub fn save(&self, run_output_dir: &Path) -> StepflowResult<()> {
        std::fs::create_dir_all(run_output_dir)
            .map_err(|e| StepflowError::write_error(run_output_dir, e))?;
        let path = Self::path_for(run_output_dir);
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&path, yaml).map_err(|e| StepflowError::write_error(&path, e))
    }
}

/// One input's contribution to a version fingerprint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum InputComponent {
    /// Produced by another task; the producer's fingerprint chains content
    /// changes downstream.
    Produced { path: String, fingerprint: String },

    /// A source file without a producing task.
    Source { path: String, size: u64, mtime: i64 },
}

/// Canonical fingerprint record. Serialized to JSON with fields in
/// declared order and hashed with SHA-256; any change to this layout is a
/// compatibility break.
#[derive(Serialize)]
struct FingerprintRecord<'a> {
    tools: &'a [(String, String)],
    options: &'a BTreeMap<String, serde_yaml::Value>,
    inputs: &'a [InputComponent],
    output_tags: &'a [(String, String)],
}

/// Compute a task's version fingerprint.
pub fn version_fingerprint(
    tools: &[(String, String)],
    options: &BTreeMap<String, serde_yaml::Value>,
    inputs: &[InputComponent],
    output_tags: &[(String, String)],
) -> String {
    let record = FingerprintRecord {
        tools,
        options,
        inputs,
        output_tags,
    };
    let json = serde_json::to_vec(&record).expect("fingerprint record serializes");
    hex::encode(Sha256::digest(&json))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs() -> Vec<InputComponent> {
        vec![InputComponent::Produced {
            path: "/dest/a/main/x.txt".into(),
            fingerprint: "abc".into(),
        }]
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let tools = vec![("cat".to_string(), "unversioned".to_string())];
        let options = BTreeMap::new();
        let tags = vec![("files".to_string(), "out.txt".to_string())];
        let a = version_fingerprint(&tools, &options, &sample_inputs(), &tags);
        let b = version_fingerprint(&tools, &options, &sample_inputs(), &tags);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_changes_with_components() {
        let tools = vec![("cat".to_string(), "unversioned".to_string())];
        let mut options = BTreeMap::new();
        let tags = vec![("files".to_string(), "out.txt".to_string())];
        let base = version_fingerprint(&tools, &options, &sample_inputs(), &tags);

        options.insert(
            "flag".to_string(),
            serde_yaml::Value::String("on".to_string()),
        );
        let with_option = version_fingerprint(&tools, &options, &sample_inputs(), &tags);
        assert_ne!(base, with_option);

        let other_tools = vec![("cat".to_string(), "deadbeef".to_string())];
        let with_tool = version_fingerprint(&other_tools, &BTreeMap::new(), &sample_inputs(), &tags);
        assert_ne!(base, with_tool);
    }

    #[test]
    fn test_annotation_round_trip_preserves_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let annotation = Annotation {
            task: "count/s1".into(),
            config_id: "project.yaml".into(),
            created_at: Utc::now(),
            succeeded: true,
            version_fingerprint: "f00d".into(),
            tool_fingerprints: BTreeMap::from([("wc".to_string(), "beef".to_string())]),
            processes: Vec::new(),
            pool_log: vec!["[2025-01-01 00:00:00] Launched wc as PID 42.".into()],
            error: None,
        };
        annotation.save(dir.path()).unwrap();
        let loaded = Annotation::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.version_fingerprint, annotation.version_fingerprint);
        assert_eq!(loaded.tool_fingerprints, annotation.tool_fingerprints);
        assert!(loaded.succeeded);
    }

    #[test]
    fn test_missing_annotation_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Annotation::load(dir.path()).unwrap().is_none());
    }
}
