// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Process-pipeline execution
//!
//! Runs ordered groups of piped subprocess chains with full stream capture
//! and structured accounting. Each child lives in its own session; stdout
//! and stderr are never passed through unobserved.

mod capture;
mod runner;
pub mod task;

pub use capture::{StreamReport, TAIL_LENGTH};
pub use runner::{ExitKind, GroupOutcome, PoolRunner, ProcessReport, ResourceUsage};

use std::path::PathBuf;

/// One command inside an exec group or pipeline.
///
/// `argv[0]` is a tool id; the registry's configured argv prefix is
/// substituted at launch time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PipeCommand {
    pub argv: Vec<String>,

    /// Redirect the command's stdout into this file as well.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_sink: Option<PathBuf>,

    /// Redirect the command's stderr into this file as well.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_sink: Option<PathBuf>,
}

impl PipeCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            stdout_sink: None,
            stderr_sink: None,
        }
    }

    pub fn with_stdout_sink(mut self, sink: PathBuf) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    pub fn tool_id(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

/// An entry of an exec group: a single command, or a pipeline of commands
/// chained stdout→stdin and run concurrently.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum GroupEntry {
    Single(PipeCommand),
    Pipeline(Vec<PipeCommand>),
}

impl GroupEntry {
    pub fn commands(&self) -> &[PipeCommand] {
        match self {
            Self::Single(c) => std::slice::from_ref(c),
            Self::Pipeline(cs) => cs,
        }
    }
}

/// An ordered sequence of commands and pipelines, executed strictly
/// sequentially within a task.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExecGroup {
    pub entries: Vec<GroupEntry>,
}

impl ExecGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&mut self, command: PipeCommand) -> &mut Self {
        self.entries.push(GroupEntry::Single(command));
        self
    }

    pub fn add_pipeline(&mut self, commands: Vec<PipeCommand>) -> &mut Self {
        self.entries.push(GroupEntry::Pipeline(commands));
        self
    }

    /// Tool ids referenced by this group.
    pub fn tool_ids(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|e| e.commands())
            .map(PipeCommand::tool_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_collects_tool_ids() {
        let mut group = ExecGroup::new();
        group.add_command(PipeCommand::new(vec!["mkdir".into(), "-p".into(), "x".into()]));
        group.add_pipeline(vec![
            PipeCommand::new(vec!["cat".into(), "a".into()]),
            PipeCommand::new(vec!["wc".into(), "-l".into()]),
        ]);
        let tools: Vec<&str> = group.tool_ids().collect();
        assert_eq!(tools, vec!["mkdir", "cat", "wc"]);
    }
}
