// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Run command - execute eligible tasks locally

use std::path::Path;
use std::sync::Arc;

use crate::errors::{StepflowError, StepflowResult};
use crate::notify::notify;
use crate::orchestrator::{run_local, LocalOptions};

pub async fn run(
    config_path: &Path,
    task_ids: Vec<String>,
    max_parallel: usize,
    cores: Option<u32>,
    no_tool_checks: bool,
) -> StepflowResult<()> {
    let ctx = super::load_context(config_path, no_tool_checks).await?;

    let mut options = LocalOptions {
        max_parallel,
        check_fingerprints: ctx.check_fingerprints,
        ..LocalOptions::default()
    };
    if let Some(cores) = cores {
        options.total_cores = cores;
    }

    let result = run_local(
        Arc::clone(&ctx.workflow),
        Arc::clone(&ctx.tools),
        &task_ids,
        options,
    )
    .await;

    match &result {
        Ok(()) => {
            notify(
                &ctx.workflow.config,
                &format!("[stepflow] run of '{}' finished", ctx.workflow.config.id),
                None,
            )
            .await;
        }
        Err(StepflowError::Interrupted) => {}
        Err(e) => {
            notify(
                &ctx.workflow.config,
                &format!(
                    "[stepflow] run of '{}' failed: {}",
                    ctx.workflow.config.id, e
                ),
                None,
            )
            .await;
        }
    }

    result
}
