// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Error types for the workflow engine
//!
//! Errors fall into a small number of kinds: configuration problems are
//! fatal before anything runs, tool-check failures are fatal before
//! execution, execution errors belong to a single task, and cluster
//! problems degrade gracefully where possible.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for stepflow operations
pub type StepflowResult<T> = Result<T, StepflowError>;

/// Main error type for stepflow
#[derive(Error, Debug, Diagnostic)]
pub enum StepflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Configuration file not found: {path}")]
    #[diagnostic(code(stepflow::config_not_found))]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid configuration: {reason}")]
    #[diagnostic(code(stepflow::invalid_config))]
    InvalidConfig {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Unknown configuration key '{key}'")]
    #[diagnostic(
        code(stepflow::unknown_config_key),
        help("Accepted top-level keys: destination_path, constants, cluster, steps, lmod, tools, base_working_directory, id, notify")
    )]
    UnknownConfigKey { key: String },

    #[error("Invalid step key '{key}'")]
    #[diagnostic(
        code(stepflow::invalid_step_key),
        help("Step keys must be 'name' or 'name (module)'")
    )]
    InvalidStepKey { key: String },

    #[error("Unknown step module '{module}' for step '{step}'")]
    #[diagnostic(code(stepflow::unknown_step_module))]
    UnknownStepModule { step: String, module: String },

    #[error("A step cannot be named 'temp'")]
    #[diagnostic(
        code(stepflow::reserved_step_name),
        help("The 'temp' directory under the destination holds scratch files")
    )]
    ReservedStepName,

    #[error("Step '{step}' specifies an undefined dependency: {dependency}")]
    #[diagnostic(code(stepflow::unknown_dependency))]
    UnknownDependency { step: String, dependency: String },

    #[error("There is a cycle in the step dependencies involving '{step}'")]
    #[diagnostic(
        code(stepflow::dependency_cycle),
        help("Review the _depends lists of the named steps to remove the cycle")
    )]
    DependencyCycle { step: String, members: Vec<String> },

    #[error("More than one task is trying to create the same output file: {path}")]
    #[diagnostic(code(stepflow::duplicate_output))]
    DuplicateOutput { path: PathBuf },

    #[error("Duplicate run id '{run_id}' in step '{step}'")]
    #[diagnostic(code(stepflow::duplicate_run))]
    DuplicateRun { step: String, run_id: String },

    #[error("Invalid option '{option}' for step '{step}': {reason}")]
    #[diagnostic(code(stepflow::invalid_step_option))]
    InvalidStepOption {
        step: String,
        option: String,
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Tool Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Tool check failed for '{tool}': {command} exited with {exit_code} (expected {expected})")]
    #[diagnostic(code(stepflow::tool_check_failed))]
    ToolCheckFailed {
        tool: String,
        command: String,
        exit_code: i32,
        expected: i32,
        response: String,
    },

    #[error("Tool '{tool}' could not be executed: {error}")]
    #[diagnostic(code(stepflow::tool_unavailable))]
    ToolUnavailable {
        tool: String,
        error: String,
        #[help]
        help: Option<String>,
    },

    #[error("The tool '{tool}' requires a module loader, but lmod is not configured")]
    #[diagnostic(
        code(stepflow::lmod_not_configured),
        help("Set lmod.path/lmod.module_path in the config or export LMOD_CMD and MODULEPATH")
    )]
    LmodNotConfigured { tool: String },

    #[error("Step '{step}' requires unconfigured tool '{tool}'")]
    #[diagnostic(code(stepflow::tool_not_configured))]
    ToolNotConfigured { step: String, tool: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Task '{task}' failed: {reason}")]
    #[diagnostic(code(stepflow::task_failed))]
    TaskFailed {
        task: String,
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Process group crashed: {reason}")]
    #[diagnostic(code(stepflow::exec_group_crashed))]
    ExecGroupCrashed { reason: String },

    #[error("Could not write to output sink '{sink}'")]
    #[diagnostic(code(stepflow::sink_short_write))]
    SinkShortWrite { sink: PathBuf },

    #[error("Could not write to downstream pipe of '{program}'")]
    #[diagnostic(code(stepflow::pipe_short_write))]
    PipeShortWrite { program: String },

    #[error("Task '{task}' is not executable (it declares no exec groups)")]
    #[diagnostic(code(stepflow::not_executable))]
    NotExecutable { task: String },

    #[error("No task matches the requested pattern(s) '{patterns}'")]
    #[diagnostic(code(stepflow::no_matching_task))]
    NoMatchingTask { patterns: String },

    #[error("Interrupted")]
    #[diagnostic(code(stepflow::interrupted))]
    Interrupted,

    // ─────────────────────────────────────────────────────────────────────────
    // Cluster Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Cluster type '{cluster}' is not configured")]
    #[diagnostic(code(stepflow::unknown_cluster))]
    UnknownCluster { cluster: String },

    #[error("Submission of task '{task}' failed: {reason}")]
    #[diagnostic(code(stepflow::submission_failed))]
    SubmissionFailed { task: String, reason: String },

    #[error("Could not parse a job id from the submission output: {output}")]
    #[diagnostic(code(stepflow::job_id_parse))]
    JobIdParse { output: String },

    // ─────────────────────────────────────────────────────────────────────────
    // State / IO Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Could not read ping file {path}: {error}")]
    #[diagnostic(code(stepflow::ping_unreadable))]
    PingUnreadable { path: PathBuf, error: String },

    #[error("Task '{task}' is in an inconsistent state: {reason}")]
    #[diagnostic(code(stepflow::state_inconsistency))]
    StateInconsistency { task: String, reason: String },

    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(stepflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(stepflow::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(stepflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(stepflow::yaml_error))]
    Yaml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(stepflow::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for StepflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for StepflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: e.to_string(),
        }
    }
}

impl From<glob::PatternError> for StepflowError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern {
            message: e.to_string(),
        }
    }
}

impl StepflowError {
    /// Exit code the driver should terminate with for this error.
    ///
    /// 1 for configuration and tool problems, 2 for execution problems,
    /// 130 when interrupted.
    pub fn exit_code(&self) -> i32 {
        use StepflowError::*;
        match self {
            Interrupted => 130,
            TaskFailed { .. }
            | ExecGroupCrashed { .. }
            | SinkShortWrite { .. }
            | PipeShortWrite { .. }
            | SubmissionFailed { .. }
            | JobIdParse { .. }
            | StateInconsistency { .. }
            | Io { .. }
            | FileReadError { .. }
            | FileWriteError { .. }
            | PingUnreadable { .. } => 2,
            _ => 1,
        }
    }

    /// Wrap a file read failure with its path.
    pub fn read_error(path: &std::path::Path, e: std::io::Error) -> Self {
        Self::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        }
    }

    /// Wrap a file write failure with its path.
    pub fn write_error(path: &std::path::Path, e: std::io::Error) -> Self {
        Self::FileWriteError {
            path: path.to_path_buf(),
            error: e.to_string(),
        }
    }
}
