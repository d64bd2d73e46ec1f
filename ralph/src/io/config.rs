//! Loop configuration stored under `.ralph/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// sensible values; CLI flags override individual fields per invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RalphConfig {
    /// Stop after this many iterations per invocation (0 = unlimited).
    pub max_iterations: u32,

    /// Stop once this much wall-clock time has passed (0 = unlimited).
    pub max_runtime_secs: u64,

    /// Wall-clock limit for a single agent invocation (0 = unlimited).
    pub iteration_timeout_secs: u64,

    /// Keep at most this many bytes of agent stdout in memory.
    pub agent_output_limit_bytes: usize,

    /// Truncate validation logs beyond this many bytes.
    pub validation_output_limit_bytes: usize,

    /// Maximum prompt size before droppable sections are removed.
    pub prompt_budget_bytes: usize,

    /// Run the agents-updater role once after the plan completes.
    pub update_agents_on_complete: bool,

    pub agent: AgentConfig,

    /// Backpressure commands run after every building iteration.
    pub validation: Vec<ValidationCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable, resolved through `PATH`.
    pub binary: String,
    pub model: String,
    /// Pass the flag that lets the agent use every tool without asking.
    pub allow_all_tools: bool,
    /// Extra arguments appended verbatim.
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: "sonnet".to_string(),
            allow_all_tools: true,
            extra_args: Vec::new(),
        }
    }
}

/// One externally declared validation command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationCommand {
    pub name: String,
    /// Program and arguments, e.g. `["cargo", "test"]`.
    pub command: Vec<String>,
    #[serde(default = "default_validation_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_validation_timeout_secs() -> u64 {
    10 * 60
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            max_runtime_secs: 0,
            iteration_timeout_secs: 30 * 60,
            agent_output_limit_bytes: 1_000_000,
            validation_output_limit_bytes: 100_000,
            prompt_budget_bytes: 60_000,
            update_agents_on_complete: false,
            agent: AgentConfig::default(),
            validation: Vec::new(),
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.binary.trim().is_empty() {
            return Err(anyhow!("agent.binary must not be empty"));
        }
        if self.agent.model.trim().is_empty() {
            return Err(anyhow!("agent.model must not be empty"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.validation_output_limit_bytes == 0 {
            return Err(anyhow!("validation_output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        for check in &self.validation {
            if check.name.trim().is_empty() {
                return Err(anyhow!("validation.name must not be empty"));
            }
            if check.command.is_empty() || check.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "validation '{}': command must be a non-empty array",
                    check.name
                ));
            }
        }
        Ok(())
    }

    pub fn max_iterations(&self) -> Option<u32> {
        (self.max_iterations > 0).then_some(self.max_iterations)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        (self.max_runtime_secs > 0).then(|| Duration::from_secs(self.max_runtime_secs))
    }

    pub fn iteration_timeout(&self) -> Option<Duration> {
        (self.iteration_timeout_secs > 0).then(|| Duration::from_secs(self.iteration_timeout_secs))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
