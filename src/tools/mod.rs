// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Tool registry
//!
//! Verifies presence and version of every configured external tool before
//! anything runs, and caches a per-tool fingerprint that participates in
//! artifact version fingerprints. Checks run with bounded parallelism; a
//! single mismatch fails the whole set.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::config::{ConfigModel, StringOrList, ToolConfig};
use crate::errors::{StepflowError, StepflowResult};
use crate::utils::create_check_bar;

/// Fingerprint recorded for tools whose version is ignored, so they
/// participate only structurally.
pub const UNVERSIONED: &str = "unversioned";

/// Default number of concurrent tool checks.
pub const DEFAULT_CHECK_PARALLELISM: usize = 4;

/// Result of probing one tool.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// The executed probe command line.
    pub command: String,

    /// Exit code of the version probe.
    pub exit_code: i32,

    /// Combined stdout+stderr of the probe, lossily decoded for display.
    pub response: String,

    /// Resolved absolute path of the program, when it could be found.
    pub used_path: Option<PathBuf>,

    /// SHA-256 of the raw probe response bytes, or the `unversioned`
    /// sentinel when the tool's version is ignored.
    pub fingerprint: String,

    /// Records of pre/post commands, keyed `<kind>` / `<kind>-exit-code`.
    pub extra: BTreeMap<String, String>,
}

/// Verified tool set with cached fingerprints.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    infos: BTreeMap<String, ToolInfo>,
}

impl ToolRegistry {
    /// Probe every configured tool with bounded parallelism.
    ///
    /// Workers never install their own signal handling; cancellation is
    /// initiated by the driver alone.
    pub async fn check(
        config: &ConfigModel,
        parallelism: usize,
        show_progress: bool,
    ) -> StepflowResult<Self> {
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let bar = create_check_bar(config.tools.len() as u64);
        if !show_progress {
            bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        }

        let mut join_set = tokio::task::JoinSet::new();
        for (tool_id, tool_config) in config.tools.clone() {
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let info = check_tool(&tool_id, &tool_config).await;
                (tool_id, info)
            });
        }

        let mut infos = BTreeMap::new();
        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            bar.inc(1);
            let (tool_id, result) = joined.map_err(|e| StepflowError::Io {
                message: format!("tool check worker panicked: {}", e),
            })?;
            match result {
                Ok(info) => {
                    infos.insert(tool_id, info);
                }
                Err(e) => {
                    // Drain remaining workers before surfacing the error.
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        bar.finish_and_clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(Self { infos }),
        }
    }

    /// Registry with no verified tools, for invocations that skip checks.
    pub fn unchecked() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolInfo> {
        self.infos.get(tool_id)
    }

    /// Fingerprint for a tool; `unversioned` when the registry has not
    /// probed it (checks skipped).
    pub fn fingerprint(&self, tool_id: &str) -> &str {
        self.infos
            .get(tool_id)
            .map(|i| i.fingerprint.as_str())
            .unwrap_or(UNVERSIONED)
    }

    /// Sorted (tool id, fingerprint) pairs for a tool set.
    pub fn fingerprints_for<'a>(
        &self,
        tool_ids: impl IntoIterator<Item = &'a String>,
    ) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = tool_ids
            .into_iter()
            .map(|id| (id.clone(), self.fingerprint(id).to_string()))
            .collect();
        pairs.sort();
        pairs
    }
}

async fn check_tool(tool_id: &str, config: &ToolConfig) -> StepflowResult<ToolInfo> {
    let mut extra = BTreeMap::new();

    for (kind, command) in [
        ("module_load", &config.module_load),
        ("pre_command", &config.pre_command),
    ] {
        if let Some(command) = command {
            run_side_command(tool_id, kind, command, &mut extra).await?;
        }
    }

    let mut argv = config.argv(tool_id);
    let used_path = which::which(&argv[0]).ok();
    argv.push(config.get_version.clone());

    let command_line = argv.join(" ");
    tracing::info!("Executing command: {}", command_line);

    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| StepflowError::ToolUnavailable {
            tool: tool_id.to_string(),
            error: e.to_string(),
            help: Some(format!("Is '{}' installed and on PATH?", argv[0])),
        })?;

    let mut response_bytes = output.stdout.clone();
    response_bytes.extend_from_slice(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);

    if exit_code != config.exit_code {
        return Err(StepflowError::ToolCheckFailed {
            tool: tool_id.to_string(),
            command: command_line,
            exit_code,
            expected: config.exit_code,
            response: String::from_utf8_lossy(&response_bytes).trim().to_string(),
        });
    }

    for (kind, command) in [
        ("module_unload", &config.module_unload),
        ("post_command", &config.post_command),
    ] {
        if let Some(command) = command {
            run_side_command(tool_id, kind, command, &mut extra).await?;
        }
    }

    // Fingerprint over the raw response bytes, without re-encoding; any
    // change to this canonicalization is a compatibility break.
    let fingerprint = if config.ignore_version {
        UNVERSIONED.to_string()
    } else {
        hex::encode(Sha256::digest(&response_bytes))
    };

    Ok(ToolInfo {
        command: command_line,
        exit_code,
        response: String::from_utf8_lossy(&response_bytes).trim().to_string(),
        used_path,
        fingerprint,
        extra,
    })
}

async fn run_side_command(
    tool_id: &str,
    kind: &str,
    command: &StringOrList,
    extra: &mut BTreeMap<String, String>,
) -> StepflowResult<()> {
    for line in command.to_vec() {
        let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let Some(program) = argv.first() else {
            continue;
        };
        tracing::info!("Executing command: {}", line);
        let output = Command::new(program)
            .args(&argv[1..])
            .output()
            .await
            .map_err(|e| StepflowError::ToolUnavailable {
                tool: tool_id.to_string(),
                error: format!("{} '{}' failed: {}", kind, line, e),
                help: None,
            })?;
        let exit_code = output.status.code().unwrap_or(-1);
        extra.insert(kind.to_string(), line.trim().to_string());
        extra.insert(format!("{}-exit-code", kind), exit_code.to_string());
        let mut response = output.stdout;
        response.extend_from_slice(&output.stderr);
        if !response.is_empty() {
            extra.insert(
                format!("{}-response", kind),
                String::from_utf8_lossy(&response).trim().to_string(),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigModel;
    use std::path::Path;

    fn config_with_tools(dir: &Path, tools_yaml: &str) -> ConfigModel {
        let yaml = format!(
            "destination_path: {}\nsteps: {{}}\ntools:\n{}",
            dir.display(),
            tools_yaml
        );
        ConfigModel::from_yaml(&yaml, dir, "test.yaml").unwrap()
    }

    #[tokio::test]
    async fn test_check_passes_for_coreutils() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_tools(dir.path(), "  echo: {}\n");
        let registry = ToolRegistry::check(&config, 4, false).await.unwrap();
        assert!(registry.get("cat").is_some());
        // Auto-registered coreutils carry the sentinel fingerprint.
        assert_eq!(registry.fingerprint("cat"), UNVERSIONED);
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_set() {
        let dir = tempfile::tempdir().unwrap();
        // `false` exits 1, but 0 is expected.
        let config = config_with_tools(dir.path(), "  broken:\n    path: \"false\"\n");
        let err = ToolRegistry::check(&config, 4, false).await.unwrap_err();
        assert!(matches!(err, StepflowError::ToolCheckFailed { tool, .. } if tool == "broken"));
    }

    #[tokio::test]
    async fn test_fingerprint_is_sha256_of_response() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_tools(
            dir.path(),
            "  greeter:\n    path: printf\n    get_version: hello\n",
        );
        let registry = ToolRegistry::check(&config, 4, false).await.unwrap();
        let expected = hex::encode(Sha256::digest(b"hello"));
        assert_eq!(registry.fingerprint("greeter"), expected);
    }

    #[test]
    fn test_unchecked_registry_uses_sentinel() {
        let registry = ToolRegistry::unchecked();
        assert_eq!(registry.fingerprint("anything"), UNVERSIONED);
    }
}
