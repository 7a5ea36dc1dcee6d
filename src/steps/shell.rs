// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Shell step
//!
//! Generic processing step that runs a configured command or pipeline once
//! per upstream run. Tokens may contain `%run%`, `%input%`, `%inputs%` and
//! `%output%` placeholders; the output is published on an `out/` port for
//! downstream steps.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::{StepContext, StepType};
use crate::errors::StepflowResult;
use crate::exec::{ExecGroup, PipeCommand};
use crate::runs::Run;

/// Default port files are bound from and published on.
const DEFAULT_PORT: &str = "files";

pub struct ShellStep;

impl ShellStep {
    /// Parse `command` / `pipeline` options into argv lists.
    fn commands(
        &self,
        ctx: &StepContext,
    ) -> StepflowResult<Vec<Vec<String>>> {
        if let Some(value) = ctx.options.get("pipeline") {
            let seq = value
                .as_sequence()
                .ok_or_else(|| ctx.invalid_option("pipeline", "must be a list of commands"))?;
            let mut commands = Vec::new();
            for entry in seq {
                commands.push(parse_argv(ctx, "pipeline", entry)?);
            }
            if commands.is_empty() {
                return Err(ctx.invalid_option("pipeline", "must not be empty"));
            }
            return Ok(commands);
        }

        if let Some(value) = ctx.options.get("command") {
            return Ok(vec![parse_argv(ctx, "command", value)?]);
        }

        Err(ctx.invalid_option("command", "set either 'command' or 'pipeline'"))
    }
}

fn parse_argv(
    ctx: &StepContext,
    option: &str,
    value: &serde_yaml::Value,
) -> StepflowResult<Vec<String>> {
    let seq = value
        .as_sequence()
        .ok_or_else(|| ctx.invalid_option(option, "commands must be argv lists"))?;
    let argv: Vec<String> = seq
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if argv.len() != seq.len() || argv.is_empty() {
        return Err(ctx.invalid_option(option, "argv entries must be non-empty strings"));
    }
    Ok(argv)
}

fn expand_token(token: &str, run_id: &str, inputs: &[PathBuf], output: &str) -> Vec<String> {
    if token == "%inputs%" {
        return inputs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
    }
    let mut out = token.replace("%run%", run_id).replace("%output%", output);
    if let Some(first) = inputs.first() {
        out = out.replace("%input%", &first.to_string_lossy());
    }
    vec![out]
}

impl StepType for ShellStep {
    fn module(&self) -> &'static str {
        "shell"
    }

    fn required_tools(&self, options: &BTreeMap<String, serde_yaml::Value>) -> BTreeSet<String> {
        let mut tools = BTreeSet::new();
        let mut collect = |value: &serde_yaml::Value| {
            if let Some(argv) = value.as_sequence() {
                if let Some(first) = argv.first().and_then(|v| v.as_str()) {
                    if !first.contains('%') {
                        tools.insert(first.to_string());
                    }
                }
            }
        };
        if let Some(value) = options.get("command") {
            collect(value);
        }
        if let Some(seq) = options.get("pipeline").and_then(|v| v.as_sequence()) {
            for entry in seq {
                collect(entry);
            }
        }
        tools
    }

    fn plan_runs(&self, ctx: &StepContext) -> StepflowResult<Vec<Run>> {
        let commands = self.commands(ctx)?;
        let in_port = ctx.opt_str("in").unwrap_or_else(|| DEFAULT_PORT.into());
        let out_tag = ctx.opt_str("tag").unwrap_or_else(|| DEFAULT_PORT.into());
        let output_template = ctx.opt_str("output").unwrap_or_else(|| "%run%.out".into());

        let uses_output_placeholder = commands
            .iter()
            .flatten()
            .any(|token| token.contains("%output%"));
        let stdout_to_output = ctx.opt_bool("stdout").unwrap_or(!uses_output_placeholder);

        // One run per upstream run id; a step without parents gets a
        // single standalone run.
        let mut bindings: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        if ctx.upstream.is_empty() {
            let run_id = ctx.opt_str("run_id").unwrap_or_else(|| "main".into());
            bindings.insert(run_id, Vec::new());
        } else {
            for (upstream_run, files) in ctx.upstream_port(&in_port) {
                bindings
                    .entry(upstream_run.run_id.clone())
                    .or_default()
                    .extend(files.iter().cloned());
            }
        }

        let mut runs = Vec::new();
        for (run_id, inputs) in bindings {
            let output_name = output_template.replace("%run%", &run_id);
            let final_path = ctx.output_path(&run_id, &output_name);
            let temp_path = ctx.temp_path(&run_id, &output_name);
            let temp_str = temp_path.to_string_lossy().into_owned();

            let mut pipeline: Vec<PipeCommand> = commands
                .iter()
                .map(|argv| {
                    let expanded: Vec<String> = argv
                        .iter()
                        .flat_map(|token| expand_token(token, &run_id, &inputs, &temp_str))
                        .collect();
                    PipeCommand::new(expanded)
                })
                .collect();
            if stdout_to_output {
                if let Some(last) = pipeline.last_mut() {
                    last.stdout_sink = Some(temp_path.clone());
                }
            }

            let mut group = ExecGroup::new();
            if pipeline.len() == 1 {
                let single = pipeline.remove(0);
                group.add_command(single);
            } else {
                group.add_pipeline(pipeline);
            }

            let mut run = Run::new(ctx.step_name, &run_id);
            run.add_output(&out_tag, final_path, inputs);
            run.add_exec_group(group);
            runs.push(run);
        }
        Ok(runs)
    }
}
