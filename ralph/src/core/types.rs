//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between the orchestrator and its
//! collaborators. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::signal;

/// Agent role: which prompt template and which completion sentinel apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    SpecCreation,
    Planning,
    Building,
    AgentsUpdater,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::SpecCreation,
        AgentRole::Planning,
        AgentRole::Building,
        AgentRole::AgentsUpdater,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::SpecCreation => "spec_creation",
            AgentRole::Planning => "planning",
            AgentRole::Building => "building",
            AgentRole::AgentsUpdater => "agents_updater",
        }
    }

    /// Literal marker the agent must print when its phase is done.
    pub fn sentinel(self) -> &'static str {
        signal::sentinel_for(self)
    }

    /// Whether a prompt for this role is meaningless without an assigned task.
    pub fn requires_task(self) -> bool {
        matches!(self, AgentRole::Building)
    }

    /// File name of the prompt template under `.ralph/agents/`.
    pub fn template_file_name(self) -> String {
        format!("{}.md", self.as_str())
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestration phase persisted in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SpecCreation,
    Planning,
    Building,
}

impl Phase {
    pub fn role(self) -> AgentRole {
        match self {
            Phase::SpecCreation => AgentRole::SpecCreation,
            Phase::Planning => AgentRole::Planning,
            Phase::Building => AgentRole::Building,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.role().as_str()
    }

    /// The phase that follows once this one has signalled completion.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::SpecCreation => Some(Phase::Planning),
            Phase::Planning => Some(Phase::Building),
            Phase::Building => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which phases a `run` invocation is allowed to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    Spec,
    Plan,
    Build,
    #[default]
    Auto,
}

impl LoopMode {
    /// Returns true if this mode may execute `phase`.
    pub fn allows(self, phase: Phase) -> bool {
        match self {
            LoopMode::Spec => phase == Phase::SpecCreation,
            LoopMode::Plan => phase == Phase::Planning,
            LoopMode::Build => phase == Phase::Building,
            LoopMode::Auto => true,
        }
    }
}

/// Orchestrator state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Recovering,
    Running(Phase),
    Complete,
    Cancelled,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Idle => f.write_str("idle"),
            LoopState::Recovering => f.write_str("recovering"),
            LoopState::Running(phase) => write!(f, "{phase}"),
            LoopState::Complete => f.write_str("complete"),
            LoopState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Why a run stopped before completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncompleteReason {
    /// The configured `max_iterations` was reached.
    IterationLimit { iterations: u32 },
    /// The configured `max_runtime_secs` elapsed.
    TimeLimit { elapsed_secs: u64 },
}

impl fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompleteReason::IterationLimit { iterations } => {
                write!(f, "iteration limit reached after {iterations} iterations")
            }
            IncompleteReason::TimeLimit { elapsed_secs } => {
                write!(f, "time limit reached after {elapsed_secs}s")
            }
        }
    }
}

/// Terminal status of a `run` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStatus {
    Complete,
    Incomplete(IncompleteReason),
    Cancelled,
    Fatal(String),
}

/// Result of the backpressure (validation) phase of an iteration.
///
/// `Fail` never fails the iteration: its output is fed into the next prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationOutcome {
    Pass,
    Fail,
    /// No validation commands configured, or the iteration was cancelled.
    Skipped,
}

/// Whether a session keeps its own specs or reads the project-wide ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecsMode {
    Isolated,
    #[default]
    Shared,
}

impl fmt::Display for SpecsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecsMode::Isolated => f.write_str("isolated"),
            SpecsMode::Shared => f.write_str("shared"),
        }
    }
}
