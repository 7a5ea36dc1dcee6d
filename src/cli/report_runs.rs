// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Report-runs command - print source-step run ids

use std::path::Path;

use crate::errors::StepflowResult;

pub async fn run(config_path: &Path, no_tool_checks: bool) -> StepflowResult<()> {
    let ctx = super::load_context(config_path, no_tool_checks).await?;
    for run_id in ctx.workflow.source_run_ids() {
        println!("{}", run_id);
    }
    Ok(())
}
