// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Volatilize command - report or replace reclaimable artifacts

use std::path::Path;

use crate::errors::StepflowResult;
use crate::state::{StateQuery, TaskState};
use crate::utils::bytes_to_str;
use crate::volatile::{volatilize_file, VolatilityReport};
use crate::workflow::Workflow;

pub async fn run(
    config_path: &Path,
    details: bool,
    srsly: bool,
    no_tool_checks: bool,
) -> StepflowResult<()> {
    let ctx = super::load_context(config_path, no_tool_checks).await?;
    let workflow = &ctx.workflow;
    let query = StateQuery::new(workflow, &ctx.tools, ctx.check_fingerprints);

    let report = collect_volatilizable(workflow, &query);

    if report.candidates.is_empty() {
        println!("Nothing to volatilize.");
        return Ok(());
    }

    if srsly {
        let mut reclaimed = 0u64;
        for path in &report.candidates {
            reclaimed += volatilize_file(path)?;
            tracing::info!("Volatilized {}", path.display());
        }
        println!(
            "Reclaimed {} by volatilizing {} output files.",
            bytes_to_str(reclaimed),
            report.candidates.len()
        );
    } else {
        if details {
            for path in &report.candidates {
                println!("{}", path.display());
            }
        }
        println!(
            "Hint: You could save {} of disk space by volatilizing {} output files.",
            bytes_to_str(report.total_bytes),
            report.candidates.len()
        );
        println!("Call 'stepflow volatilize --srsly' to purge the files.");
    }

    Ok(())
}

/// An output file is volatilizable when its step is marked `_volatile`,
/// its producing task is FINISHED and every downstream consumer is
/// FINISHED or VOLATILIZED.
pub fn collect_volatilizable(workflow: &Workflow, query: &StateQuery) -> VolatilityReport {
    let mut report = VolatilityReport::default();

    for task in &workflow.tasks {
        let node = workflow.graph.node(task.step_index);
        if !node.volatile {
            continue;
        }
        let task_id = task.id();
        if query.state_of(&task_id) != TaskState::Finished {
            continue;
        }

        for path in workflow.index.outputs_of(&task_id) {
            if !path.exists() {
                continue;
            }
            let consumers_done = workflow
                .index
                .consumers_of(path)
                .all(|consumer| query.state_of(consumer).is_terminal());
            if !consumers_done {
                continue;
            }
            if let Ok(meta) = std::fs::metadata(path) {
                report.total_bytes += meta.len();
            }
            report.candidates.push(path.clone());
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigModel;
    use crate::steps::StepRegistry;
    use crate::tools::ToolRegistry;

    fn workflow(dir: &Path, steps_yaml: &str) -> Workflow {
        let yaml = format!(
            "destination_path: {}\nsteps:\n{}",
            dir.display(),
            steps_yaml
        );
        let config = ConfigModel::from_yaml(&yaml, dir, "test.yaml").unwrap();
        Workflow::build(config, &StepRegistry::builtin()).unwrap()
    }

    const VOLATILE_CHAIN: &str = "
  make (shell):
    _volatile: true
    command: [\"printf\", \"x\"]
    output: \"a.txt\"
  use (shell):
    _depends: make
    command: [\"cat\", \"%input%\"]
    output: \"b.txt\"
";

    #[test]
    fn test_not_volatilizable_while_consumer_pending() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), VOLATILE_CHAIN);
        let make_dir = dir.path().join("make").join("main");
        std::fs::create_dir_all(&make_dir).unwrap();
        std::fs::write(make_dir.join("a.txt"), "x").unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, false);
        let report = collect_volatilizable(&wf, &query);
        assert!(report.candidates.is_empty());
    }

    #[test]
    fn test_volatilizable_once_consumer_finished() {
        let dir = tempfile::tempdir().unwrap();
        let wf = workflow(dir.path(), VOLATILE_CHAIN);
        let make_dir = dir.path().join("make").join("main");
        let use_dir = dir.path().join("use").join("main");
        std::fs::create_dir_all(&make_dir).unwrap();
        std::fs::create_dir_all(&use_dir).unwrap();
        std::fs::write(make_dir.join("a.txt"), "four").unwrap();
        std::fs::write(use_dir.join("b.txt"), "four").unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, false);
        let report = collect_volatilizable(&wf, &query);
        assert_eq!(report.candidates, vec![make_dir.join("a.txt")]);
        assert_eq!(report.total_bytes, 4);
    }

    #[test]
    fn test_non_volatile_step_is_never_a_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = VOLATILE_CHAIN.replace("    _volatile: true\n", "");
        let wf = workflow(dir.path(), &yaml);
        let make_dir = dir.path().join("make").join("main");
        let use_dir = dir.path().join("use").join("main");
        std::fs::create_dir_all(&make_dir).unwrap();
        std::fs::create_dir_all(&use_dir).unwrap();
        std::fs::write(make_dir.join("a.txt"), "x").unwrap();
        std::fs::write(use_dir.join("b.txt"), "x").unwrap();

        let tools = ToolRegistry::unchecked();
        let query = StateQuery::new(&wf, &tools, false);
        assert!(collect_volatilizable(&wf, &query).candidates.is_empty());
    }
}
