//! Backpressure: externally configured validation commands (tests, lints, builds).
//!
//! A failing command never fails the iteration. Its output is summarized into
//! the session's feedback file and handed to the next prompt.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ValidationOutcome;
use crate::io::atomic::write_atomic;
use crate::io::config::ValidationCommand;
use crate::io::interrupt::CancelToken;
use crate::io::process::{RunOptions, Termination, run_command, truncate_log};

/// Result of one validation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    /// Combined, bounded stdout/stderr.
    pub output: String,
}

/// Aggregate result of one validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub outcome: ValidationOutcome,
    pub checks: Vec<CheckResult>,
    /// The pass was interrupted; the checks say nothing about the code.
    pub cancelled: bool,
}

impl ValidationReport {
    pub fn skipped() -> Self {
        Self {
            outcome: ValidationOutcome::Skipped,
            checks: Vec::new(),
            cancelled: false,
        }
    }

    /// An interrupted pass. Checks are kept for the log only.
    pub fn interrupted(checks: Vec<CheckResult>) -> Self {
        Self {
            outcome: ValidationOutcome::Skipped,
            checks,
            cancelled: true,
        }
    }

    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let outcome = if checks.is_empty() {
            ValidationOutcome::Skipped
        } else if checks.iter().all(|c| c.passed) {
            ValidationOutcome::Pass
        } else {
            ValidationOutcome::Fail
        };
        Self {
            outcome,
            checks,
            cancelled: false,
        }
    }

    /// Feedback for the next prompt; `None` unless something failed.
    pub fn feedback(&self) -> Option<String> {
        if self.cancelled {
            return None;
        }
        let failed: Vec<&CheckResult> = self.checks.iter().filter(|c| !c.passed).collect();
        if failed.is_empty() {
            return None;
        }
        let mut out = String::from(
            "The previous iteration's validation failed. Fix these problems before continuing.\n",
        );
        for check in failed {
            let code = check
                .exit_code
                .map_or_else(|| "none".to_string(), |c| c.to_string());
            out.push_str(&format!(
                "\n### {} (exit code {code})\n\n```\n{}\n```\n",
                check.name,
                check.output.trim_end()
            ));
        }
        Some(out)
    }

    /// Full log for the iteration artifact directory.
    pub fn render_log(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            out.push_str(&format!(
                "##### {} | {} | exit code {:?}\n{}\n",
                check.name,
                if check.passed { "pass" } else { "fail" },
                check.exit_code,
                check.output
            ));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub workdir: PathBuf,
    pub commands: Vec<ValidationCommand>,
    pub output_limit_bytes: usize,
}

pub trait ValidationRunner {
    fn run(&self, request: &ValidationRequest) -> Result<ValidationReport>;
}

/// Runs each configured command as a child process in the project root.
pub struct CommandValidationRunner {
    cancel: CancelToken,
}

impl CommandValidationRunner {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

impl ValidationRunner for CommandValidationRunner {
    #[instrument(skip_all, fields(commands = request.commands.len()))]
    fn run(&self, request: &ValidationRequest) -> Result<ValidationReport> {
        let mut checks = Vec::with_capacity(request.commands.len());
        for command in &request.commands {
            if self.cancel.is_cancelled() {
                debug!("cancelled, skipping remaining validation");
                break;
            }
            checks.push(self.run_one(command, request));
        }
        if self.cancel.is_cancelled() {
            info!(ran = checks.len(), "validation interrupted");
            return Ok(ValidationReport::interrupted(checks));
        }
        let report = ValidationReport::from_checks(checks);
        info!(outcome = ?report.outcome, "validation finished");
        Ok(report)
    }
}

impl CommandValidationRunner {
    /// Failures to spawn count as a failed check; one broken command never
    /// aborts the pass.
    fn run_one(&self, command: &ValidationCommand, request: &ValidationRequest) -> CheckResult {
        let name = command.name.clone();
        debug!(name = %name, "running validation command");
        let Some((program, args)) = command.command.split_first() else {
            return CheckResult {
                name,
                passed: false,
                exit_code: None,
                output: "empty validation command".to_string(),
            };
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let result = run_command(
            cmd,
            RunOptions {
                timeout: Some(Duration::from_secs(command.timeout_secs)),
                output_limit_bytes: request.output_limit_bytes,
                cancel: Some(&self.cancel),
                stdout_sinks: Vec::new(),
            },
        )
        .with_context(|| format!("run validation '{name}'"));

        match result {
            Ok(output) => {
                let passed =
                    output.termination == Termination::Exited && output.status.success();
                if !passed {
                    warn!(name = %name, exit_code = ?output.exit_code(), "validation failed");
                }
                CheckResult {
                    output: output.render_log(&name, request.output_limit_bytes),
                    name,
                    passed,
                    exit_code: output.exit_code(),
                }
            }
            Err(err) => {
                warn!(name = %name, err = %format!("{err:#}"), "validation command could not run");
                CheckResult {
                    name,
                    passed: false,
                    exit_code: None,
                    output: truncate_log(format!("{err:#}"), request.output_limit_bytes),
                }
            }
        }
    }
}

/// Replace the session feedback file, or remove it when there is nothing to say.
pub fn write_feedback(path: &std::path::Path, feedback: Option<&str>) -> Result<()> {
    match feedback.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => write_atomic(path, &format!("{text}\n")),
        None => clear_feedback(path),
    }
}

pub fn read_feedback(path: &std::path::Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn clear_feedback(path: &std::path::Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
