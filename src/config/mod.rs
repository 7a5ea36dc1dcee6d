// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Project configuration
//!
//! Loads the YAML project description into a normalized [`ConfigModel`].
//! Unknown top-level keys are rejected eagerly; relative paths are resolved
//! against an explicit base working directory; tool and cluster entries are
//! filled with defaults. If the loaded document is a persisted annotation,
//! the embedded `config` subtree is lifted and its destination re-rooted.

pub mod cluster;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::errors::{StepflowError, StepflowResult};

pub use cluster::{ClusterCommands, ClusterTable};

/// GNU core utilities that are registered by default. Their versions are
/// ignored so they participate only structurally in fingerprints.
pub const COREUTILS: &[&str] = &[
    "basename", "cat", "cp", "cut", "date", "dd", "dirname", "du", "head", "ln", "ls", "mkdir",
    "mkfifo", "mv", "paste", "printf", "pwd", "seq", "sleep", "sort", "rm", "tail", "tee", "tr",
    "uniq", "wc",
];

const KNOWN_KEYS: &[&str] = &[
    "destination_path",
    "constants",
    "cluster",
    "steps",
    "lmod",
    "tools",
    "base_working_directory",
    "id",
    "notify",
];

/// A string or a list of strings, as accepted for tool paths and
/// pre/post commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Single(s) => vec![s.clone()],
            Self::Multiple(v) => v.clone(),
        }
    }
}

/// Configuration of one external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// Program path, or an argv prefix (e.g. an interpreter plus script).
    #[serde(default)]
    pub path: Option<StringOrList>,

    /// Argument passed to probe the version.
    #[serde(default = "default_get_version")]
    pub get_version: String,

    /// Exit code the version probe is expected to return.
    #[serde(default)]
    pub exit_code: i32,

    /// Exclude the probe response from fingerprints.
    #[serde(default)]
    pub ignore_version: bool,

    /// Environment module to load before probing (expands to
    /// module_load/module_unload commands).
    #[serde(default)]
    pub module_name: Option<String>,

    #[serde(default)]
    pub module_load: Option<StringOrList>,

    #[serde(default)]
    pub module_unload: Option<StringOrList>,

    #[serde(default)]
    pub pre_command: Option<StringOrList>,

    #[serde(default)]
    pub post_command: Option<StringOrList>,

    /// True when the entry was auto-registered rather than written by the
    /// user. Used for the unused-tool warning.
    #[serde(default, skip_serializing)]
    pub auto_configured: bool,
}

fn default_get_version() -> String {
    "--version".to_string()
}

impl ToolConfig {
    fn auto(ignore_version: bool) -> Self {
        Self {
            path: None,
            get_version: default_get_version(),
            exit_code: 0,
            ignore_version,
            module_name: None,
            module_load: None,
            module_unload: None,
            pre_command: None,
            post_command: None,
            auto_configured: true,
        }
    }

    /// The argv prefix used to invoke this tool.
    pub fn argv(&self, tool_id: &str) -> Vec<String> {
        match &self.path {
            Some(p) => p.to_vec(),
            None => vec![tool_id.to_string()],
        }
    }

    fn needs_lmod(&self) -> bool {
        self.module_name.is_some() || self.module_load.is_some() || self.module_unload.is_some()
    }
}

/// Module loader (lmod) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LmodSettings {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub module_path: Option<String>,
}

impl LmodSettings {
    pub fn is_configured(&self) -> bool {
        self.path.is_some() && self.module_path.is_some()
    }
}

/// Cluster defaults from the project configuration (the command table
/// itself lives in [`ClusterTable`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSettings {
    #[serde(default)]
    pub default_submit_options: String,

    #[serde(default)]
    pub default_pre_job_command: String,

    #[serde(default)]
    pub default_post_job_command: String,

    /// At most this many queued-or-executing jobs at a time; 0 disables
    /// the quota.
    #[serde(default)]
    pub default_job_quota: u32,
}

/// One entry of the `steps` mapping, with the key grammar already applied.
#[derive(Debug, Clone)]
pub struct RawStep {
    /// Instance name (unique within the configuration).
    pub name: String,

    /// Module class the step is instantiated from.
    pub module: String,

    /// Ordered parent step names (`_depends`).
    pub depends: Vec<String>,

    /// Core count hint (`_cores`).
    pub cores: u32,

    /// Outputs may be volatilized once all consumers are done (`_volatile`).
    pub volatile: bool,

    /// Remaining module-specific options.
    pub options: BTreeMap<String, serde_yaml::Value>,
}

/// Parsed, normalized, validated pipeline description.
#[derive(Debug, Clone)]
pub struct ConfigModel {
    pub id: String,
    pub destination_path: PathBuf,
    pub base_working_directory: PathBuf,
    pub constants: BTreeMap<String, serde_yaml::Value>,
    pub cluster: ClusterSettings,
    pub lmod: LmodSettings,
    pub tools: BTreeMap<String, ToolConfig>,
    pub steps: Vec<RawStep>,
    pub notify: Option<String>,

    /// Absolute path of the loaded configuration file, when known. Used
    /// by cluster jobs to re-invoke the driver.
    pub source_path: Option<PathBuf>,
}

impl ConfigModel {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> StepflowResult<Self> {
        if !path.exists() {
            return Err(StepflowError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| StepflowError::read_error(path, e))?;
        let config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let config_dir = config_dir
            .canonicalize()
            .unwrap_or(config_dir);
        let config_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stepflow.yaml".to_string());

        let mut config = Self::from_yaml(&content, &config_dir, &config_name)?;
        config.source_path = Some(config_dir.join(&config_name));
        Ok(config)
    }

    /// Parse and validate a configuration document.
    pub fn from_yaml(yaml: &str, config_dir: &Path, config_name: &str) -> StepflowResult<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let mut mapping = into_string_map(doc, "configuration")?;

        // A persisted annotation embeds the original config; lift it and
        // re-root the destination two levels up (annotations live under
        // destination/<step>/<run>/).
        let mut lifted_destination = None;
        if let Some(embedded) = mapping.remove("config") {
            mapping = into_string_map(embedded, "annotation 'config' subtree")?;
            let dest = config_dir.join("..").join("..");
            lifted_destination = Some(dest.canonicalize().unwrap_or(dest));
        }

        for key in mapping.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(StepflowError::UnknownConfigKey { key: key.clone() });
            }
        }

        let base_working_directory = match mapping.get("base_working_directory") {
            Some(v) => {
                let raw = expect_str(v, "base_working_directory")?;
                resolve_path(config_dir, Path::new(&raw))
            }
            None => config_dir.to_path_buf(),
        };

        let id = match mapping.get("id") {
            Some(v) => expect_str(v, "id")?,
            None => config_name.to_string(),
        };

        let destination_path = match lifted_destination {
            Some(dest) => dest,
            None => {
                let raw = mapping
                    .get("destination_path")
                    .ok_or_else(|| StepflowError::InvalidConfig {
                        reason: "missing key: destination_path".into(),
                        help: None,
                    })
                    .and_then(|v| expect_str(v, "destination_path"))?;
                resolve_path(&base_working_directory, Path::new(&raw))
            }
        };
        if !destination_path.exists() {
            return Err(StepflowError::InvalidConfig {
                reason: format!(
                    "destination path does not exist: {}",
                    destination_path.display()
                ),
                help: Some("Create the directory before running stepflow".into()),
            });
        }

        let constants = match mapping.get("constants") {
            Some(serde_yaml::Value::Mapping(m)) => mapping_to_btree(m),
            Some(serde_yaml::Value::Null) | None => BTreeMap::new(),
            Some(_) => {
                return Err(StepflowError::InvalidConfig {
                    reason: "'constants' must be a mapping".into(),
                    help: None,
                })
            }
        };

        let mut lmod: LmodSettings = match mapping.get("lmod") {
            Some(serde_yaml::Value::Null) | None => LmodSettings::default(),
            Some(v) => serde_yaml::from_value(v.clone())?,
        };
        // Environment fallback for module-loader settings.
        if lmod.path.is_none() {
            lmod.path = std::env::var("LMOD_CMD").ok();
        }
        if lmod.module_path.is_none() {
            lmod.module_path = std::env::var("MODULEPATH").ok();
        }

        let cluster: ClusterSettings = match mapping.get("cluster") {
            Some(serde_yaml::Value::Null) | None => ClusterSettings::default(),
            Some(v) => serde_yaml::from_value(v.clone())?,
        };

        let tools = parse_tools(mapping.get("tools"), &lmod)?;

        let steps = parse_steps(mapping.get("steps"))?;

        let notify = match mapping.get("notify") {
            Some(v) => Some(expect_str(v, "notify")?),
            None => None,
        };

        Ok(Self {
            id,
            destination_path,
            base_working_directory,
            constants,
            cluster,
            lmod,
            tools,
            steps,
            notify,
            source_path: None,
        })
    }

    /// Tools configured by the user but not referenced by any step.
    pub fn unused_tools(&self, used: &BTreeSet<String>) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(id, conf)| !conf.auto_configured && !used.contains(id.as_str()))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Scratch directory for in-flight task outputs.
    pub fn temp_dir(&self) -> PathBuf {
        self.destination_path.join("temp")
    }
}

fn expect_str(v: &serde_yaml::Value, key: &str) -> StepflowResult<String> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| StepflowError::InvalidConfig {
            reason: format!("'{}' must be a string", key),
            help: None,
        })
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn mapping_to_btree(m: &serde_yaml::Mapping) -> BTreeMap<String, serde_yaml::Value> {
    m.iter()
        .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
        .collect()
}

fn into_string_map(
    value: serde_yaml::Value,
    what: &str,
) -> StepflowResult<BTreeMap<String, serde_yaml::Value>> {
    let mapping = match value {
        serde_yaml::Value::Mapping(m) => m,
        _ => {
            return Err(StepflowError::InvalidConfig {
                reason: format!("the {} must be a mapping", what),
                help: None,
            })
        }
    };
    let mut out = BTreeMap::new();
    for (key, entry) in mapping {
        let key = key.as_str().ok_or_else(|| StepflowError::InvalidConfig {
            reason: format!("{} keys must be strings", what),
            help: None,
        })?;
        out.insert(key.to_string(), entry);
    }
    Ok(out)
}

fn parse_tools(
    value: Option<&serde_yaml::Value>,
    lmod: &LmodSettings,
) -> StepflowResult<BTreeMap<String, ToolConfig>> {
    let mut tools: BTreeMap<String, ToolConfig> = BTreeMap::new();

    if let Some(serde_yaml::Value::Mapping(m)) = value {
        for (key, entry) in m {
            let tool_id = key
                .as_str()
                .ok_or_else(|| StepflowError::InvalidConfig {
                    reason: "tool ids must be strings".into(),
                    help: None,
                })?
                .to_string();
            let conf: ToolConfig = match entry {
                serde_yaml::Value::Null => ToolConfig::auto(false),
                v => serde_yaml::from_value(v.clone()).map_err(|e| {
                    StepflowError::InvalidConfig {
                        reason: format!("tool '{}': {}", tool_id, e),
                        help: None,
                    }
                })?,
            };
            tools.insert(tool_id, conf);
        }
    }

    // Auto-register common POSIX utilities; they only participate
    // structurally in fingerprints. A user entry for one of them keeps
    // its own settings.
    for tool in COREUTILS {
        tools
            .entry(tool.to_string())
            .or_insert_with(|| ToolConfig::auto(true));
    }

    for (tool_id, conf) in &mut tools {
        if conf.needs_lmod() && !lmod.is_configured() {
            return Err(StepflowError::LmodNotConfigured {
                tool: tool_id.clone(),
            });
        }
        if let (Some(module), Some(lmod_path)) = (&conf.module_name, &lmod.path) {
            if conf.module_load.is_none() {
                conf.module_load = Some(StringOrList::Single(format!(
                    "{} load {}",
                    lmod_path, module
                )));
            }
            if conf.module_unload.is_none() {
                conf.module_unload = Some(StringOrList::Single(format!(
                    "{} unload {}",
                    lmod_path, module
                )));
            }
        }
    }

    Ok(tools)
}

fn parse_steps(value: Option<&serde_yaml::Value>) -> StepflowResult<Vec<RawStep>> {
    let mapping = match value {
        Some(serde_yaml::Value::Mapping(m)) => m,
        _ => {
            return Err(StepflowError::InvalidConfig {
                reason: "missing key: steps".into(),
                help: None,
            })
        }
    };

    let simple_key = regex::Regex::new(r"^[a-zA-Z0-9_]+$").unwrap();
    let complex_key = regex::Regex::new(r"^([a-zA-Z0-9_]+)\s+\(([a-zA-Z0-9_]+)\)$").unwrap();

    let mut steps = Vec::new();
    for (key, description) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| StepflowError::InvalidConfig {
                reason: "step keys must be strings".into(),
                help: None,
            })?
            .to_string();

        let (name, module) = if simple_key.is_match(&key) {
            (key.clone(), key.clone())
        } else if let Some(caps) = complex_key.captures(&key) {
            (caps[1].to_string(), caps[2].to_string())
        } else {
            return Err(StepflowError::InvalidStepKey { key });
        };

        if name == "temp" {
            return Err(StepflowError::ReservedStepName);
        }

        let mut options = match description {
            serde_yaml::Value::Mapping(m) => mapping_to_btree(m),
            serde_yaml::Value::Null => BTreeMap::new(),
            _ => {
                return Err(StepflowError::InvalidConfig {
                    reason: format!("step '{}' options must be a mapping", name),
                    help: None,
                })
            }
        };

        let depends = match options.remove("_depends") {
            Some(serde_yaml::Value::String(s)) => vec![s],
            Some(serde_yaml::Value::Sequence(seq)) => seq
                .into_iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| StepflowError::InvalidStepOption {
                            step: name.clone(),
                            option: "_depends".into(),
                            reason: "entries must be step names".into(),
                        })
                })
                .collect::<StepflowResult<Vec<_>>>()?,
            Some(serde_yaml::Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(StepflowError::InvalidStepOption {
                    step: name.clone(),
                    option: "_depends".into(),
                    reason: "must be a step name or a list of step names".into(),
                })
            }
        };

        let cores = match options.remove("_cores") {
            Some(v) => v.as_u64().unwrap_or(1) as u32,
            None => 1,
        };

        let volatile = match options.remove("_volatile") {
            Some(v) => v.as_bool().unwrap_or(false),
            None => false,
        };

        steps.push(RawStep {
            name,
            module,
            depends,
            cores: cores.max(1),
            volatile,
            options,
        });
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(yaml: &str, dir: &Path) -> StepflowResult<ConfigModel> {
        ConfigModel::from_yaml(yaml, dir, "test.yaml")
    }

    #[test]
    fn test_unknown_top_level_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "destination_path: {}\nsteps: {{}}\nfrobnicate: 1\n",
            dir.path().display()
        );
        let err = load(&yaml, dir.path()).unwrap_err();
        assert!(matches!(err, StepflowError::UnknownConfigKey { key } if key == "frobnicate"));
    }

    #[test]
    fn test_step_key_grammar() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "destination_path: {}\nsteps:\n  fastq (file_source): {{}}\n  counts:\n    _depends: fastq\n",
            dir.path().display()
        );
        let config = load(&yaml, dir.path()).unwrap();
        let fastq = config.steps.iter().find(|s| s.name == "fastq").unwrap();
        assert_eq!(fastq.module, "file_source");
        let counts = config.steps.iter().find(|s| s.name == "counts").unwrap();
        assert_eq!(counts.module, "counts");
        assert_eq!(counts.depends, vec!["fastq"]);
    }

    #[test]
    fn test_reserved_temp_name() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "destination_path: {}\nsteps:\n  temp: {{}}\n",
            dir.path().display()
        );
        let err = load(&yaml, dir.path()).unwrap_err();
        assert!(matches!(err, StepflowError::ReservedStepName));
    }

    #[test]
    fn test_coreutils_auto_registered() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "destination_path: {}\nsteps: {{}}\n",
            dir.path().display()
        );
        let config = load(&yaml, dir.path()).unwrap();
        let cat = config.tools.get("cat").unwrap();
        assert!(cat.ignore_version);
        assert!(cat.auto_configured);
    }

    #[test]
    fn test_tool_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "destination_path: {}\nsteps: {{}}\ntools:\n  samtools:\n    path: /opt/samtools\n",
            dir.path().display()
        );
        let config = load(&yaml, dir.path()).unwrap();
        let samtools = config.tools.get("samtools").unwrap();
        assert_eq!(samtools.get_version, "--version");
        assert_eq!(samtools.exit_code, 0);
        assert!(!samtools.ignore_version);
        assert_eq!(samtools.argv("samtools"), vec!["/opt/samtools"]);
    }

    #[test]
    fn test_missing_destination_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load("steps: {}\n", dir.path()).unwrap_err();
        assert!(matches!(err, StepflowError::InvalidConfig { .. }));
    }
}
