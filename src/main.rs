// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! stepflow - Reproducible Workflow Engine
//!
//! Expands a declarative pipeline into tasks and drives them to
//! completion, locally or through a cluster batch system.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stepflow::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "stepflow=debug"
    } else {
        "stepflow=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        if let Err(e) = std::env::set_current_dir(dir) {
            eprintln!("Failed to change to directory '{}': {}", dir.display(), e);
            std::process::exit(1);
        }
    }

    // Dispatch to command handlers
    let result = match cli.command {
        Commands::Run {
            task_ids,
            max_parallel,
            cores,
        } => {
            stepflow::cli::run::run(&cli.config, task_ids, max_parallel, cores, cli.no_tool_checks)
                .await
        }
        Commands::SubmitToCluster { task_ids } => {
            stepflow::cli::submit::run(
                &cli.config,
                task_ids,
                &cli.cluster,
                cli.cluster_config.as_deref(),
                cli.no_tool_checks,
            )
            .await
        }
        Commands::Status { details } => {
            stepflow::cli::status::run(
                &cli.config,
                details,
                &cli.cluster,
                cli.cluster_config.as_deref(),
                cli.no_tool_checks,
            )
            .await
        }
        Commands::FixProblems {
            details,
            first_error,
            srsly,
        } => {
            stepflow::cli::fix_problems::run(
                &cli.config,
                details,
                first_error,
                srsly,
                &cli.cluster,
                cli.cluster_config.as_deref(),
                cli.no_tool_checks,
            )
            .await
        }
        Commands::Volatilize { details, srsly } => {
            stepflow::cli::volatilize::run(&cli.config, details, srsly, cli.no_tool_checks).await
        }
        Commands::ReportRuns => {
            stepflow::cli::report_runs::run(&cli.config, cli.no_tool_checks).await
        }
    };

    if let Err(error) = result {
        let code = error.exit_code();
        eprintln!("{:?}", miette::Report::new(error));
        std::process::exit(code);
    }
}
