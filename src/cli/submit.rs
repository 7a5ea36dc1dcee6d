// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Submit command - hand eligible tasks to the batch system

use std::path::Path;

use crate::errors::StepflowResult;
use crate::orchestrator::submit_to_cluster;

pub async fn run(
    config_path: &Path,
    task_ids: Vec<String>,
    cluster: &str,
    cluster_config: Option<&Path>,
    no_tool_checks: bool,
) -> StepflowResult<()> {
    let table = super::load_cluster_table(cluster_config)?;
    let cluster_type = table.resolve(cluster).await?;
    tracing::info!("Using cluster type '{}'", cluster_type);

    let ctx = super::load_context(config_path, no_tool_checks).await?;
    submit_to_cluster(
        &ctx.workflow,
        &ctx.tools,
        &task_ids,
        &table,
        &cluster_type,
        ctx.check_fingerprints,
    )
    .await
}
