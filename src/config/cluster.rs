// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Cluster command table
//!
//! Batch systems are described by a pluggable table mapping cluster type to
//! the commands stepflow needs: an identity probe, a queue stat and a submit
//! template with `%s` placeholders. `auto` selection probes each entry's
//! identity test and matches the stdout prefix against its answers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;

use crate::config::StringOrList;
use crate::errors::{StepflowError, StepflowResult};

/// Commands for one cluster type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterCommands {
    /// Command whose stdout identifies the batch system.
    pub identity_test: Vec<String>,

    /// Accepted stdout prefixes for the identity test.
    pub identity_answer: StringOrList,

    /// Command listing the currently known batch jobs. An absent or empty
    /// stat command disables queue checks with a warning.
    #[serde(default)]
    pub stat: Vec<String>,

    /// Submission argv; fragments may contain `%s` placeholders which are
    /// filled positionally with (job name, core count, log path).
    pub submit: Vec<String>,

    /// Options appended to every submission.
    #[serde(default)]
    pub default_options: String,

    /// Regex with one capture group extracting the job id from the
    /// submission output. Falls back to the first integer in the output.
    #[serde(default)]
    pub parse_job_id: Option<String>,
}

impl ClusterCommands {
    /// Render the submit argv, substituting `%s` placeholders positionally.
    pub fn render_submit(&self, values: &[&str]) -> StepflowResult<Vec<String>> {
        let placeholders: usize = self.submit.iter().map(|p| p.matches("%s").count()).sum();
        if placeholders != values.len() {
            return Err(StepflowError::InvalidConfig {
                reason: format!(
                    "the submit template expects {} placeholder value(s), got {}",
                    placeholders,
                    values.len()
                ),
                help: None,
            });
        }

        let mut rendered = Vec::with_capacity(self.submit.len());
        let mut next = 0;
        for part in &self.submit {
            let count = part.matches("%s").count();
            if count == 0 {
                rendered.push(part.clone());
                continue;
            }
            let mut out = part.clone();
            for value in &values[next..next + count] {
                out = out.replacen("%s", value, 1);
            }
            next += count;
            rendered.push(out);
        }
        Ok(rendered)
    }

    /// Extract the batch job id from the submission output.
    pub fn extract_job_id(&self, output: &str) -> StepflowResult<String> {
        if let Some(pattern) = &self.parse_job_id {
            let re = regex::Regex::new(pattern).map_err(|e| StepflowError::InvalidConfig {
                reason: format!("invalid parse_job_id pattern: {}", e),
                help: None,
            })?;
            if let Some(caps) = re.captures(output) {
                if let Some(id) = caps.get(1) {
                    return Ok(id.as_str().to_string());
                }
            }
        } else {
            let re = regex::Regex::new(r"(\d+)").unwrap();
            if let Some(caps) = re.captures(output) {
                return Ok(caps[1].to_string());
            }
        }
        Err(StepflowError::JobIdParse {
            output: output.trim().to_string(),
        })
    }
}

/// The full cluster type → commands table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterTable {
    pub types: BTreeMap<String, ClusterCommands>,
}

impl ClusterTable {
    /// The table shipped with stepflow (SLURM and SGE/UGE).
    pub fn builtin() -> Self {
        serde_yaml::from_str(include_str!("cluster_commands.yaml"))
            .expect("builtin cluster table must parse")
    }

    /// Load a user-provided table from a YAML file.
    pub fn from_file(path: &Path) -> StepflowResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| StepflowError::read_error(path, e))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn get(&self, cluster_type: &str) -> StepflowResult<&ClusterCommands> {
        self.types
            .get(cluster_type)
            .ok_or_else(|| StepflowError::UnknownCluster {
                cluster: cluster_type.to_string(),
            })
    }

    /// Probe each cluster type's identity test and return the first type
    /// whose stdout prefix matches one of its answers.
    pub async fn autodetect(&self) -> Option<String> {
        for (cluster_type, commands) in &self.types {
            let Some(program) = commands.identity_test.first() else {
                continue;
            };
            let output = Command::new(program)
                .args(&commands.identity_test[1..])
                .output()
                .await;
            let Ok(output) = output else {
                continue;
            };
            let stdout = String::from_utf8_lossy(&output.stdout);
            for answer in commands.identity_answer.to_vec() {
                if stdout.starts_with(&answer) {
                    return Some(cluster_type.clone());
                }
            }
        }
        tracing::warn!("Cluster type could not be detected");
        None
    }

    /// Resolve a requested cluster type, probing when `auto` is given.
    pub async fn resolve(&self, requested: &str) -> StepflowResult<String> {
        if requested == "auto" {
            return self
                .autodetect()
                .await
                .ok_or_else(|| StepflowError::UnknownCluster {
                    cluster: "auto".into(),
                });
        }
        self.get(requested)?;
        Ok(requested.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(yaml: &str) -> ClusterTable {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_builtin_table_parses() {
        let table = ClusterTable::builtin();
        assert!(table.types.contains_key("slurm"));
        assert!(table.types.contains_key("sge"));
    }

    #[test]
    fn test_render_submit_placeholders() {
        let commands = ClusterCommands {
            identity_test: vec!["true".into()],
            identity_answer: StringOrList::Single("x".into()),
            stat: vec!["true".into()],
            submit: vec!["sbatch".into(), "-J".into(), "%s".into(), "-c%s".into()],
            default_options: String::new(),
            parse_job_id: None,
        };
        let rendered = commands.render_submit(&["job-a", "4"]).unwrap();
        assert_eq!(rendered, vec!["sbatch", "-J", "job-a", "-c4"]);
    }

    #[test]
    fn test_render_submit_value_count_mismatch() {
        let commands = ClusterCommands {
            identity_test: vec!["true".into()],
            identity_answer: StringOrList::Single("x".into()),
            stat: vec!["true".into()],
            submit: vec!["qsub".into(), "-N".into(), "%s".into()],
            default_options: String::new(),
            parse_job_id: None,
        };
        assert!(commands.render_submit(&[]).is_err());
    }

    #[test]
    fn test_extract_job_id_with_pattern() {
        let commands = ClusterCommands {
            identity_test: vec!["true".into()],
            identity_answer: StringOrList::Single("x".into()),
            stat: vec!["true".into()],
            submit: vec!["sbatch".into()],
            default_options: String::new(),
            parse_job_id: Some(r"Submitted batch job (\d+)".into()),
        };
        let id = commands
            .extract_job_id("Submitted batch job 123456\n")
            .unwrap();
        assert_eq!(id, "123456");
    }

    #[test]
    fn test_extract_job_id_fallback() {
        let commands = ClusterCommands {
            identity_test: vec!["true".into()],
            identity_answer: StringOrList::Single("x".into()),
            stat: vec!["true".into()],
            submit: vec!["qsub".into()],
            default_options: String::new(),
            parse_job_id: None,
        };
        assert_eq!(commands.extract_job_id("Your job 77 is queued").unwrap(), "77");
        assert!(commands.extract_job_id("no id here").is_err());
    }

    #[tokio::test]
    async fn test_autodetect_matches_prefix() {
        let table = table(
            r#"
mock:
  identity_test: ["printf", "SLURM"]
  identity_answer: ["SLURM"]
  stat: ["true"]
  submit: ["true"]
"#,
        );
        assert_eq!(table.autodetect().await, Some("mock".to_string()));
    }

    #[tokio::test]
    async fn test_autodetect_no_match() {
        let table = table(
            r#"
mock:
  identity_test: ["printf", "PBS"]
  identity_answer: ["SLURM", "UGE"]
  stat: ["true"]
  submit: ["true"]
"#,
        );
        assert_eq!(table.autodetect().await, None);
    }
}
