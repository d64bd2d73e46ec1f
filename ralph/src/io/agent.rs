//! Agent abstraction for invoking the coding agent.
//!
//! The [`AgentRunner`] trait decouples the orchestrator from the actual agent
//! backend (the `claude` CLI by default). Tests use scripted runners that
//! return predetermined output without spawning processes.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::signal;
use crate::core::types::AgentRole;
use crate::io::config::AgentConfig;
use crate::io::interrupt::CancelToken;
use crate::io::process::{CommandOutput, LineSink, RunOptions, Termination, run_command};

/// Error-line prefixes that mean the agent cannot run at all until the user
/// logs in again. Only checked when the agent exits nonzero without printing
/// any completion marker, and only at the start of a line (after an optional
/// `error:`), so transcripts that merely quote these phrases do not match.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "invalid api key",
    "please run /login",
    "authentication_error",
    "not logged in",
    "oauth token has expired",
];

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory (project root).
    pub workdir: PathBuf,
    pub role: AgentRole,
    pub prompt: String,
    pub model: String,
    /// Wall-clock limit; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Bound on the stdout kept in memory for sentinel detection; the tail is kept.
    pub output_limit_bytes: usize,
    /// Per-iteration agent log, written live while the agent runs.
    pub log_path: Option<PathBuf>,
    /// Echo agent stdout to the terminal as it arrives.
    pub echo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AgentRunStatus {
    Succeeded,
    Failed { exit_code: Option<i32> },
    TimedOut,
    Cancelled,
}

impl fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRunStatus::Succeeded => f.write_str("succeeded"),
            AgentRunStatus::Failed {
                exit_code: Some(code),
            } => write!(f, "failed (exit code {code})"),
            AgentRunStatus::Failed { exit_code: None } => f.write_str("failed (killed by signal)"),
            AgentRunStatus::TimedOut => f.write_str("timed out"),
            AgentRunStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of one agent invocation. Output is returned whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub output: String,
    pub exit_code: Option<i32>,
    pub status: AgentRunStatus,
}

/// Environment-level failure: the agent cannot run at all.
///
/// Returned inside `anyhow::Error`; callers recover it with `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalAgentError {
    pub reason: String,
}

impl fmt::Display for FatalAgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal agent error: {}", self.reason)
    }
}

impl std::error::Error for FatalAgentError {}

/// Abstraction over agent execution backends.
pub trait AgentRunner {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun>;
}

/// Runner that spawns the `claude` CLI (or a configured compatible binary).
pub struct ClaudeAgentRunner {
    config: AgentConfig,
    cancel: CancelToken,
}

impl ClaudeAgentRunner {
    pub fn new(config: AgentConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    /// Build the agent command line for `request`.
    pub fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--model")
            .arg(&request.model);
        if self.config.allow_all_tools {
            cmd.arg("--dangerously-skip-permissions");
        }
        cmd.args(&self.config.extra_args)
            .current_dir(&request.workdir);
        cmd
    }

    fn sinks(&self, request: &AgentRequest) -> Result<(Vec<LineSink>, Option<File>)> {
        let mut sinks: Vec<LineSink> = Vec::new();
        if request.echo {
            sinks.push(Box::new(|line: &[u8]| {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(line)?;
                stdout.flush()
            }));
        }
        let mut tail = None;
        if let Some(path) = &request.log_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create agent log dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create agent log {}", path.display()))?;
            tail = Some(
                file.try_clone()
                    .with_context(|| format!("clone agent log handle {}", path.display()))?,
            );
            let mut writer = BufWriter::new(file);
            writer.write_all(b"=== stdout ===\n")?;
            sinks.push(Box::new(move |line: &[u8]| {
                writer.write_all(line)?;
                writer.flush()
            }));
        }
        Ok((sinks, tail))
    }
}

impl AgentRunner for ClaudeAgentRunner {
    #[instrument(skip_all, fields(role = %request.role, model = %request.model, timeout_secs = request.timeout.map(|t| t.as_secs())))]
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        info!(workdir = %request.workdir.display(), binary = %self.config.binary, "starting agent");
        let (sinks, log_tail) = self.sinks(request)?;

        let output = match run_command(
            self.command(request),
            RunOptions {
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
                cancel: Some(&self.cancel),
                stdout_sinks: sinks,
            },
        ) {
            Ok(output) => output,
            Err(err) => return Err(classify_spawn_error(err, &self.config.binary)),
        };

        if let Some(file) = log_tail {
            append_log_tail(file, &output);
        }

        let run = to_agent_run(&output);
        match run.status {
            AgentRunStatus::Succeeded => debug!("agent completed"),
            status => warn!(%status, "agent did not exit cleanly"),
        }
        if let AgentRunStatus::Failed { .. } = run.status
            && let Some(marker) = auth_failure(&run.output, &output.stderr)
        {
            return Err(FatalAgentError {
                reason: format!("agent authentication failed ({marker}); log in and retry"),
            }
            .into());
        }
        Ok(run)
    }
}

fn classify_spawn_error(err: anyhow::Error, binary: &str) -> anyhow::Error {
    match err.downcast_ref::<std::io::Error>() {
        Some(io) if io.kind() == std::io::ErrorKind::NotFound => FatalAgentError {
            reason: format!("agent binary '{binary}' not found on PATH"),
        }
        .into(),
        Some(io) if io.kind() == std::io::ErrorKind::PermissionDenied => FatalAgentError {
            reason: format!("agent binary '{binary}' is not executable"),
        }
        .into(),
        _ => err.context(format!("run agent '{binary}'")),
    }
}

fn to_agent_run(output: &CommandOutput) -> AgentRun {
    let status = match output.termination {
        Termination::TimedOut => AgentRunStatus::TimedOut,
        Termination::Cancelled => AgentRunStatus::Cancelled,
        Termination::Exited if output.status.success() => AgentRunStatus::Succeeded,
        Termination::Exited => AgentRunStatus::Failed {
            exit_code: output.exit_code(),
        },
    };
    AgentRun {
        output: output.stdout_lossy(),
        exit_code: output.exit_code(),
        status,
    }
}

fn auth_failure(stdout: &str, stderr: &[u8]) -> Option<&'static str> {
    if !signal::detect_any(stdout).is_empty() {
        return None;
    }
    let stderr = String::from_utf8_lossy(stderr);
    stderr
        .lines()
        .chain(stdout.lines())
        .find_map(auth_failure_line)
}

fn auth_failure_line(line: &str) -> Option<&'static str> {
    let line = line.trim().to_ascii_lowercase();
    let line = line
        .strip_prefix("error:")
        .map_or(line.as_str(), str::trim_start);
    AUTH_FAILURE_MARKERS
        .iter()
        .copied()
        .find(|marker| line.starts_with(marker))
}

/// Append stderr and the termination notice after the streamed stdout.
/// Log failures are reported but never fail the run.
fn append_log_tail(file: File, output: &CommandOutput) {
    let mut tail = String::new();
    if output.stdout_truncated > 0 {
        tail.push_str(&format!(
            "\n[first {} bytes of stdout not kept in memory; full text above]\n",
            output.stdout_truncated
        ));
    }
    tail.push_str("\n=== stderr ===\n");
    tail.push_str(&String::from_utf8_lossy(&output.stderr));
    match output.termination {
        Termination::Exited => {
            tail.push_str(&format!("\n[exit code {:?}]\n", output.exit_code()));
        }
        Termination::TimedOut => tail.push_str("\n[agent timed out]\n"),
        Termination::Cancelled => tail.push_str("\n[agent cancelled]\n"),
    }
    let mut file = file;
    if let Err(err) = file.write_all(tail.as_bytes()) {
        warn!(err = %err, "failed to finish agent log");
    }
}
