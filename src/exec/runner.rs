// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Process pool runner
//!
//! Launches the commands and pipelines of an exec group, supervises their
//! exits through a channel of reaper events, and coordinates teardown when
//! anything fails: a 5 second grace window, then SIGTERM to each remaining
//! child's session, then SIGKILL after another grace window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ToolConfig;
use crate::errors::{StepflowError, StepflowResult};
use crate::exec::capture::{run_listener, ListenerError, StreamReport};
use crate::exec::{ExecGroup, GroupEntry, PipeCommand};

/// Grace window between failure, SIGTERM and SIGKILL.
pub const SIGTERM_GRACE: Duration = Duration::from_secs(5);

/// Poll interval of the supervisor loop.
const SUPERVISE_TICK: Duration = Duration::from_millis(250);

/// How a child process ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExitKind {
    Code(i32),
    Signal { number: i32, name: Option<String> },
}

impl ExitKind {
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    fn from_status(status: i32) -> Self {
        if libc::WIFSIGNALED(status) {
            let number = libc::WTERMSIG(status);
            Self::Signal {
                number,
                name: signal_name(number).map(str::to_string),
            }
        } else {
            Self::Code(libc::WEXITSTATUS(status))
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "has exited with exit code {}", code),
            Self::Signal {
                number,
                name: Some(name),
            } => write!(f, "has received {} (signal number {})", name, number),
            Self::Signal { number, name: None } => {
                write!(f, "has received signal {}", number)
            }
        }
    }
}

/// Resource accounting from `wait4`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub user_time_secs: f64,
    pub system_time_secs: f64,
    pub max_rss_kb: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
    pub in_block: i64,
    pub out_block: i64,
    pub voluntary_ctxt_switches: i64,
    pub involuntary_ctxt_switches: i64,
    pub signals_received: i64,
}

impl From<libc::rusage> for ResourceUsage {
    fn from(ru: libc::rusage) -> Self {
        let tv = |t: libc::timeval| t.tv_sec as f64 + t.tv_usec as f64 / 1e6;
        Self {
            user_time_secs: tv(ru.ru_utime),
            system_time_secs: tv(ru.ru_stime),
            max_rss_kb: ru.ru_maxrss,
            minor_faults: ru.ru_minflt,
            major_faults: ru.ru_majflt,
            in_block: ru.ru_inblock,
            out_block: ru.ru_oublock,
            voluntary_ctxt_switches: ru.ru_nvcsw,
            involuntary_ctxt_switches: ru.ru_nivcsw,
            signals_received: ru.ru_nsignals,
        }
    }
}

/// Accounting record for one child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessReport {
    /// Resolved program name.
    pub name: String,

    pub argv: Vec<String>,
    pub pid: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit: Option<ExitKind>,
    pub usage: Option<ResourceUsage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<StreamReport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<StreamReport>,
}

/// Result of running an exec group: per-process reports plus the first
/// failure, if any. Reports are kept even on failure so the annotation can
/// record the failing command's tail.
#[derive(Debug)]
pub struct GroupOutcome {
    pub reports: Vec<ProcessReport>,
    pub failure: Option<StepflowError>,
    pub log: Vec<String>,
}

impl GroupOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Supervises the children of one task.
pub struct PoolRunner<'a> {
    tools: &'a BTreeMap<String, ToolConfig>,
    cancel: Arc<AtomicBool>,
    temp_paths: Vec<PathBuf>,
}

impl<'a> PoolRunner<'a> {
    pub fn new(tools: &'a BTreeMap<String, ToolConfig>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            tools,
            cancel,
            temp_paths: Vec::new(),
        }
    }

    /// Create a FIFO under `dir` and schedule it for removal.
    pub fn temp_fifo(&mut self, dir: &std::path::Path, prefix: &str) -> StepflowResult<PathBuf> {
        let path = dir.join(format!("{}-{}.fifo", prefix, std::process::id()));
        let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
            StepflowError::Io {
                message: format!("invalid fifo path: {}", path.display()),
            }
        })?;
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.temp_paths.push(path.clone());
        Ok(path)
    }

    /// Track a scratch file for removal when the runner is dropped.
    pub fn track_temp(&mut self, path: PathBuf) {
        self.temp_paths.push(path);
    }

    /// Run the entries of one exec group strictly sequentially, stopping
    /// at the first failing entry.
    pub fn run_group(&mut self, group: &ExecGroup) -> GroupOutcome {
        let mut reports = Vec::new();
        let mut log = Vec::new();
        let mut failure = None;

        for entry in &group.entries {
            let commands = match entry {
                GroupEntry::Single(c) => std::slice::from_ref(c),
                GroupEntry::Pipeline(cs) => cs.as_slice(),
            };
            let mut outcome = self.run_entry(commands);
            reports.append(&mut outcome.reports);
            log.append(&mut outcome.log);
            if let Some(e) = outcome.failure {
                failure = Some(e);
                break;
            }
        }

        GroupOutcome {
            reports,
            failure,
            log,
        }
    }

    /// Resolve a declared argv against the tool registry: the leading tool
    /// id is replaced by its configured argv prefix.
    fn resolve_argv(&self, command: &PipeCommand) -> Vec<String> {
        let mut argv = Vec::new();
        match command.argv.split_first() {
            Some((tool_id, rest)) => {
                match self.tools.get(tool_id) {
                    Some(conf) => argv.extend(conf.argv(tool_id)),
                    None => argv.push(tool_id.clone()),
                }
                argv.extend(rest.iter().cloned());
            }
            None => {}
        }
        argv
    }

    /// Launch one command or pipeline and supervise it to completion.
    fn run_entry(&mut self, commands: &[PipeCommand]) -> GroupOutcome {
        let mut log = Vec::new();
        let mut children: Vec<ChildSlot> = Vec::new();
        let (exit_tx, exit_rx) = mpsc::channel::<ChildExit>();

        // Launch upstream first, wiring each stage's stdout listener to the
        // next stage's stdin through an anonymous pipe.
        let mut stdin_for_next: Option<File> = None;
        for (index, command) in commands.iter().enumerate() {
            let argv = self.resolve_argv(command);
            if argv.is_empty() {
                return GroupOutcome {
                    reports: Vec::new(),
                    failure: Some(StepflowError::ExecGroupCrashed {
                        reason: "empty command".into(),
                    }),
                    log,
                };
            }

            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            match stdin_for_next.take() {
                Some(f) => {
                    cmd.stdin(Stdio::from(f));
                }
                None => {
                    cmd.stdin(Stdio::null());
                }
            }
            // Each child gets its own session so signals do not cross into
            // the driver.
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }

            let mut child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => {
                    let failure = StepflowError::ExecGroupCrashed {
                        reason: format!("could not launch '{}': {}", argv.join(" "), e),
                    };
                    self.teardown_started(&children);
                    drain_children(&mut children, &exit_rx);
                    return GroupOutcome {
                        reports: finish_reports(children),
                        failure: Some(failure),
                        log,
                    };
                }
            };
            let pid = child.id() as i32;
            log.push(pool_log(format!(
                "Launched {} as PID {}.",
                argv.join(" "),
                pid
            )));

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            // Tee the stdout of every stage except the last into the next
            // stage's stdin; the accumulator side always observes it.
            let downstream = if index + 1 < commands.len() {
                match create_pipe() {
                    Ok((read_end, write_end)) => {
                        stdin_for_next = Some(File::from(read_end));
                        Some(File::from(write_end))
                    }
                    Err(e) => {
                        let failure = StepflowError::ExecGroupCrashed {
                            reason: format!("could not create pipe: {}", e),
                        };
                        self.teardown_started(&children);
                        drain_children(&mut children, &exit_rx);
                        return GroupOutcome {
                            reports: finish_reports(children),
                            failure: Some(failure),
                            log,
                        };
                    }
                }
            } else {
                None
            };

            let stdout_sink = command.stdout_sink.clone();
            let stderr_sink = command.stderr_sink.clone();
            let stdout_handle = stdout.map(|out| {
                std::thread::spawn(move || run_listener(out, downstream, stdout_sink))
            });
            let stderr_handle = stderr
                .map(|err| std::thread::spawn(move || run_listener(err, None, stderr_sink)));

            let tx = exit_tx.clone();
            std::thread::spawn(move || {
                let (status, rusage) = wait_child(pid);
                let _ = tx.send(ChildExit {
                    index,
                    status,
                    rusage,
                });
            });

            children.push(ChildSlot {
                report: ProcessReport {
                    name: argv[0].clone(),
                    argv,
                    pid,
                    start_time: Utc::now(),
                    end_time: None,
                    exit: None,
                    usage: None,
                    stdout: None,
                    stderr: None,
                },
                child,
                stdout_handle,
                stderr_handle,
                reaped: false,
            });
        }
        drop(exit_tx);

        // Supervisor loop: consume exit events; on the first failure arm
        // the grace timer, then escalate SIGTERM → SIGKILL.
        let mut failure: Option<StepflowError> = None;
        let mut deadline: Option<Instant> = None;
        let mut escalation = Escalation::None;
        let mut reaped = 0;

        while reaped < children.len() {
            match exit_rx.recv_timeout(SUPERVISE_TICK) {
                Ok(exit) => {
                    reaped += 1;
                    let slot = &mut children[exit.index];
                    slot.reaped = true;
                    slot.report.end_time = Some(Utc::now());
                    let kind = ExitKind::from_status(exit.status);
                    log.push(pool_log(format!(
                        "{} (PID {}) {}.",
                        slot.report.name, slot.report.pid, kind
                    )));
                    if !kind.success() && failure.is_none() {
                        failure = Some(StepflowError::ExecGroupCrashed {
                            reason: format!("{} (PID {}) {}", slot.report.name, slot.report.pid, kind),
                        });
                        deadline = Some(Instant::now() + SIGTERM_GRACE);
                        log.push(pool_log(format!(
                            "Terminating remaining children in {} seconds...",
                            SIGTERM_GRACE.as_secs()
                        )));
                    }
                    slot.report.exit = Some(kind);
                    slot.report.usage = Some(ResourceUsage::from(exit.rusage));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.cancel.load(Ordering::Relaxed) && failure.is_none() {
                failure = Some(StepflowError::Interrupted);
                deadline = Some(Instant::now());
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    match escalation {
                        Escalation::None => {
                            signal_unreaped(&children, libc::SIGTERM, &mut log);
                            escalation = Escalation::Terminated;
                            deadline = Some(Instant::now() + SIGTERM_GRACE);
                        }
                        Escalation::Terminated => {
                            signal_unreaped(&children, libc::SIGKILL, &mut log);
                            escalation = Escalation::Killed;
                            deadline = None;
                        }
                        Escalation::Killed => {}
                    }
                }
            }
        }
        log.push(pool_log(
            "All child processes have exited.".to_string(),
        ));

        // Listeners reach EOF once their children are gone; a listener
        // error is a failure in its own right.
        for slot in &mut children {
            if let Some(handle) = slot.stdout_handle.take() {
                match handle.join() {
                    Ok(Ok(report)) => slot.report.stdout = Some(report),
                    Ok(Err(e)) => {
                        if failure.is_none() {
                            failure = Some(listener_failure(&slot.report.name, e));
                        }
                    }
                    Err(_) => {}
                }
            }
            if let Some(handle) = slot.stderr_handle.take() {
                match handle.join() {
                    Ok(Ok(report)) => slot.report.stderr = Some(report),
                    Ok(Err(e)) => {
                        if failure.is_none() {
                            failure = Some(listener_failure(&slot.report.name, e));
                        }
                    }
                    Err(_) => {}
                }
            }
        }

        GroupOutcome {
            reports: finish_reports(children),
            failure,
            log,
        }
    }

    fn teardown_started(&self, children: &[ChildSlot]) {
        let mut log = Vec::new();
        signal_unreaped(children, libc::SIGTERM, &mut log);
    }
}

impl Drop for PoolRunner<'_> {
    fn drop(&mut self) {
        for path in &self.temp_paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[derive(Clone, Copy)]
enum Escalation {
    None,
    Terminated,
    Killed,
}

struct ChildSlot {
    report: ProcessReport,
    #[allow(dead_code)]
    child: std::process::Child,
    stdout_handle: Option<std::thread::JoinHandle<Result<StreamReport, ListenerError>>>,
    stderr_handle: Option<std::thread::JoinHandle<Result<StreamReport, ListenerError>>>,
    reaped: bool,
}

struct ChildExit {
    index: usize,
    status: i32,
    rusage: libc::rusage,
}

fn finish_reports(children: Vec<ChildSlot>) -> Vec<ProcessReport> {
    children.into_iter().map(|slot| slot.report).collect()
}

fn drain_children(children: &mut [ChildSlot], rx: &mpsc::Receiver<ChildExit>) {
    let pending = children.iter().filter(|c| !c.reaped).count();
    for _ in 0..pending {
        if let Ok(exit) = rx.recv_timeout(SIGTERM_GRACE) {
            let slot = &mut children[exit.index];
            slot.reaped = true;
            slot.report.end_time = Some(Utc::now());
            slot.report.exit = Some(ExitKind::from_status(exit.status));
            slot.report.usage = Some(ResourceUsage::from(exit.rusage));
        }
    }
}

fn listener_failure(program: &str, error: ListenerError) -> StepflowError {
    match error {
        ListenerError::SinkWrite { sink, .. } => StepflowError::SinkShortWrite { sink },
        ListenerError::PipeWrite { .. } => StepflowError::PipeShortWrite {
            program: program.to_string(),
        },
        ListenerError::Read { error } => StepflowError::Io {
            message: format!("listener read for '{}' failed: {}", program, error),
        },
    }
}

/// Signal every unreaped child's session. Children are session leaders, so
/// the negative pid reaches their whole process group.
fn signal_unreaped(children: &[ChildSlot], signal: i32, log: &mut Vec<String>) {
    for slot in children.iter().filter(|c| !c.reaped) {
        log.push(pool_log(format!(
            "Sending {} to {} (PID {}).",
            signal_name(signal).unwrap_or("signal"),
            slot.report.name,
            slot.report.pid
        )));
        unsafe {
            libc::kill(-slot.report.pid, signal);
        }
    }
}

/// Block until the child is reaped, collecting its resource usage.
fn wait_child(pid: i32) -> (i32, libc::rusage) {
    let mut status: i32 = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
        }
        break;
    }
    (status, rusage)
}

fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn pool_log(message: String) -> String {
    format!("[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), message)
}

fn signal_name(number: i32) -> Option<&'static str> {
    match number {
        libc::SIGHUP => Some("SIGHUP"),
        libc::SIGINT => Some("SIGINT"),
        libc::SIGQUIT => Some("SIGQUIT"),
        libc::SIGILL => Some("SIGILL"),
        libc::SIGABRT => Some("SIGABRT"),
        libc::SIGFPE => Some("SIGFPE"),
        libc::SIGKILL => Some("SIGKILL"),
        libc::SIGSEGV => Some("SIGSEGV"),
        libc::SIGPIPE => Some("SIGPIPE"),
        libc::SIGALRM => Some("SIGALRM"),
        libc::SIGTERM => Some("SIGTERM"),
        libc::SIGUSR1 => Some("SIGUSR1"),
        libc::SIGUSR2 => Some("SIGUSR2"),
        libc::SIGCHLD => Some("SIGCHLD"),
        libc::SIGBUS => Some("SIGBUS"),
        _ => None,
    }
}
