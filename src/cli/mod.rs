// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for stepflow.

pub mod fix_problems;
pub mod report_runs;
pub mod run;
pub mod status;
pub mod submit;
pub mod volatilize;

use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ClusterTable, ConfigModel};
use crate::errors::StepflowResult;
use crate::steps::StepRegistry;
use crate::tools::{ToolRegistry, DEFAULT_CHECK_PARALLELISM};
use crate::workflow::Workflow;

/// Reproducible workflow engine
///
/// Expands a declarative pipeline configuration into tasks and drives them
/// to completion, locally or through a cluster batch system.
#[derive(Parser, Debug)]
#[clap(
    name = "stepflow",
    version,
    about = "Reproducible workflow engine for multi-stage data-processing pipelines",
    long_about = None,
    after_help = "Examples:\n\
        stepflow -c project.yaml status          Report task states\n\
        stepflow -c project.yaml run             Execute eligible tasks locally\n\
        stepflow -c project.yaml submit-to-cluster\n\
        stepflow -c project.yaml volatilize --srsly\n\n\
        See 'stepflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Project configuration file
    #[clap(short, long, global = true, default_value = "stepflow.yaml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,

    /// Skip the tool checks (disables fingerprint comparison)
    #[clap(long, global = true)]
    pub no_tool_checks: bool,

    /// Cluster type, or 'auto' to probe
    #[clap(long, global = true, default_value = "auto")]
    pub cluster: String,

    /// Cluster command table (defaults to the built-in table)
    #[clap(long, global = true, value_name = "FILE")]
    pub cluster_config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute eligible tasks locally
    Run {
        /// Task ids to run (prefix match; empty means all)
        task_ids: Vec<String>,

        /// Maximum concurrently running tasks
        #[clap(long, default_value = "4")]
        max_parallel: usize,

        /// Core budget shared by running tasks
        #[clap(long)]
        cores: Option<u32>,
    },

    /// Submit eligible tasks to the batch system
    SubmitToCluster {
        /// Task ids to submit (prefix match; empty means all)
        task_ids: Vec<String>,
    },

    /// Report task states
    Status {
        /// List every task instead of the per-state counts
        #[clap(long)]
        details: bool,
    },

    /// Report and optionally delete stale ping files
    FixProblems {
        /// Show per-task details
        #[clap(long)]
        details: bool,

        /// Show the first recorded error of a broken task
        #[clap(long)]
        first_error: bool,

        /// Actually delete the problematic ping files
        #[clap(long)]
        srsly: bool,
    },

    /// Report or replace reclaimable artifacts
    Volatilize {
        /// List the candidate files
        #[clap(long)]
        details: bool,

        /// Actually replace the files with placeholders
        #[clap(long)]
        srsly: bool,
    },

    /// Print source-step run ids
    ReportRuns,
}

/// Everything the subcommand handlers need.
pub struct Context {
    pub workflow: Arc<Workflow>,
    pub tools: Arc<ToolRegistry>,

    /// Whether stored fingerprints are compared during state queries.
    pub check_fingerprints: bool,
}

/// Load the configuration, verify the tools and expand the workflow.
pub async fn load_context(config_path: &Path, no_tool_checks: bool) -> StepflowResult<Context> {
    let config = ConfigModel::load(config_path)?;

    let tools = if no_tool_checks {
        ToolRegistry::unchecked()
    } else {
        let show_progress = std::io::stderr().is_terminal();
        if !show_progress {
            tracing::info!("Running tool check...");
        }
        ToolRegistry::check(&config, DEFAULT_CHECK_PARALLELISM, show_progress).await?
    };

    let workflow = Workflow::build(config, &StepRegistry::builtin())?;
    Ok(Context {
        workflow: Arc::new(workflow),
        tools: Arc::new(tools),
        check_fingerprints: !no_tool_checks,
    })
}

/// Load the cluster command table from the given file or fall back to the
/// built-in one.
pub fn load_cluster_table(path: Option<&Path>) -> StepflowResult<ClusterTable> {
    match path {
        Some(path) => ClusterTable::from_file(path),
        None => Ok(ClusterTable::builtin()),
    }
}
