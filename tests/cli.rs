// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! End-to-end tests driving the stepflow binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};

/// Write a project configuration into a fresh workspace and return the
/// config path. The destination directory is created next to it.
fn write_config(dir: &Path, steps_yaml: &str) -> PathBuf {
    let dest = dir.join("dest");
    std::fs::create_dir_all(&dest).unwrap();
    let config = format!("destination_path: dest\nsteps:\n{}", steps_yaml);
    let path = dir.join("project.yaml");
    std::fs::write(&path, config).unwrap();
    path
}

fn stepflow(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stepflow").unwrap();
    cmd.arg("--config").arg(config).arg("--no-tool-checks");
    cmd
}

const CHAIN: &str = r#"  make (shell):
    command: ["printf", "payload"]
    output: "a.txt"
  use (shell):
    _depends: make
    command: ["cat", "%input%"]
    output: "b.txt"
"#;

#[test]
fn fresh_workspace_reports_ready_and_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CHAIN);

    stepflow(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 READY"))
        .stdout(predicate::str::contains("1 WAITING"))
        .stdout(predicate::str::contains("2 total"));
}

#[test]
fn run_executes_chain_and_rerun_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CHAIN);

    stepflow(&config).arg("run").assert().success();

    let a = dir.path().join("dest/make/main/a.txt");
    let b = dir.path().join("dest/use/main/b.txt");
    assert_eq!(std::fs::read_to_string(&a).unwrap(), "payload");
    assert_eq!(std::fs::read_to_string(&b).unwrap(), "payload");

    stepflow(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 FINISHED"));

    // Re-running with stable inputs changes nothing.
    let before = std::fs::metadata(&b).unwrap().modified().unwrap();
    stepflow(&config).arg("run").assert().success();
    let after = std::fs::metadata(&b).unwrap().modified().unwrap();
    assert_eq!(before, after);
}

#[test]
fn run_accepts_a_task_wish_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CHAIN);

    stepflow(&config).arg("run").arg("make/main").assert().success();
    assert!(dir.path().join("dest/make/main/a.txt").exists());
    assert!(!dir.path().join("dest/use/main/b.txt").exists());

    stepflow(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 FINISHED"))
        .stdout(predicate::str::contains("1 READY"));

    stepflow(&config).arg("run").arg("use").assert().success();
    assert!(dir.path().join("dest/use/main/b.txt").exists());
}

#[test]
fn duplicate_output_paths_are_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), "x").unwrap();
    let steps = r#"  first (file_source):
    pattern: "*.txt"
  second (file_source):
    pattern: "*.txt"
"#;
    let config = write_config(dir.path(), steps);

    stepflow(&config)
        .arg("status")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("same output file"));
}

#[test]
fn dependency_cycles_are_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let steps = r#"  a (shell):
    command: ["printf", "x"]
    _depends: b
  b (shell):
    command: ["printf", "x"]
    _depends: a
"#;
    let config = write_config(dir.path(), steps);

    stepflow(&config)
        .arg("status")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn unknown_top_level_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("dest")).unwrap();
    let path = dir.path().join("project.yaml");
    std::fs::write(
        &path,
        "destination_path: dest\nsteps: {}\nfrobnicate: 1\n",
    )
    .unwrap();

    stepflow(&path)
        .arg("status")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("frobnicate"));
}

#[test]
fn failing_pipeline_member_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let steps = r#"  broken (shell):
    pipeline:
      - ["printf", "doomed-bytes"]
      - ["cat", "/nonexistent-stepflow-input"]
    output: "a.txt"
"#;
    let config = write_config(dir.path(), steps);

    stepflow(&config).arg("run").assert().failure().code(2);

    let out_dir = dir.path().join("dest/broken/main");
    // No declared output was published and the executing ping is gone.
    assert!(!out_dir.join("a.txt").exists());
    assert!(!out_dir.join(".ping/task.executing").exists());

    // The annotation records the failure.
    let annotation = std::fs::read_to_string(out_dir.join(".annotation.yaml")).unwrap();
    assert!(annotation.contains("succeeded: false"));
}

#[test]
fn report_runs_prints_source_run_ids() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("s1.txt"), "x").unwrap();
    std::fs::write(dir.path().join("s2.txt"), "y").unwrap();
    let steps = r#"  input (file_source):
    pattern: "*.txt"
  count (shell):
    _depends: input
    command: ["wc", "-c", "%input%"]
"#;
    let config = write_config(dir.path(), steps);

    stepflow(&config)
        .arg("report-runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("input/s1"))
        .stdout(predicate::str::contains("input/s2"));
}

#[test]
fn volatilize_dry_run_reports_reclaimable_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let steps = r#"  make (shell):
    _volatile: true
    command: ["printf", "payload"]
    output: "a.txt"
  use (shell):
    _depends: make
    command: ["cat", "%input%"]
    output: "b.txt"
"#;
    let config = write_config(dir.path(), steps);

    stepflow(&config).arg("run").assert().success();

    stepflow(&config)
        .arg("volatilize")
        .assert()
        .success()
        .stdout(predicate::str::contains("volatilize --srsly"));

    stepflow(&config)
        .arg("volatilize")
        .arg("--srsly")
        .assert()
        .success();

    let artifact = dir.path().join("dest/make/main/a.txt");
    assert!(!artifact.exists());
    assert!(dir
        .path()
        .join("dest/make/main/a.txt.volatile.placeholder.yaml")
        .exists());

    // The producing task now reports VOLATILIZED.
    stepflow(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 VOLATILIZED"));
}

#[test]
fn fix_problems_reports_clean_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CHAIN);

    stepflow(&config)
        .arg("fix-problems")
        .assert()
        .success()
        .stdout(predicate::str::contains("No problematic ping files"));
}

#[test]
fn fix_problems_finds_and_deletes_stale_pings() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CHAIN);

    // Fabricate a stale executing ping.
    let ping_dir = dir.path().join("dest/make/main/.ping");
    std::fs::create_dir_all(&ping_dir).unwrap();
    let ping = ping_dir.join("task.executing");
    std::fs::write(
        &ping,
        "start_time: 2025-01-01T00:00:00Z\nhost: h\npid: 1\ncores_requested: 1\n",
    )
    .unwrap();
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(600);
    std::fs::File::options()
        .write(true)
        .open(&ping)
        .unwrap()
        .set_modified(old)
        .unwrap();

    stepflow(&config)
        .arg("fix-problems")
        .assert()
        .success()
        .stdout(predicate::str::contains("stale run ping files"));

    stepflow(&config)
        .arg("fix-problems")
        .arg("--srsly")
        .assert()
        .success();
    assert!(!ping.exists());
}
