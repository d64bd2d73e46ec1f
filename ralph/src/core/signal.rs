//! Completion sentinel detection.
//!
//! Each agent role must print one fixed literal marker when its phase is done.
//! Matching is an exact substring search: no case folding, no fuzzy matching.
//! A missing sentinel means "not done yet", never an error.

use crate::core::types::AgentRole;

pub const SPECS_COMPLETE: &str = "<ralph>SPECS_COMPLETE</ralph>";
pub const PLAN_COMPLETE: &str = "<ralph>PLAN_COMPLETE</ralph>";
pub const TASK_COMPLETE: &str = "<ralph>TASK_COMPLETE</ralph>";
pub const AGENTS_UPDATED: &str = "<ralph>AGENTS_UPDATED</ralph>";

pub fn sentinel_for(role: AgentRole) -> &'static str {
    match role {
        AgentRole::SpecCreation => SPECS_COMPLETE,
        AgentRole::Planning => PLAN_COMPLETE,
        AgentRole::Building => TASK_COMPLETE,
        AgentRole::AgentsUpdater => AGENTS_UPDATED,
    }
}

/// Returns true if `text` contains the sentinel for `role`.
pub fn detect(text: &str, role: AgentRole) -> bool {
    text.contains(sentinel_for(role))
}

/// Every role whose sentinel appears in `text`, in [`AgentRole::ALL`] order.
pub fn detect_any(text: &str) -> Vec<AgentRole> {
    AgentRole::ALL
        .into_iter()
        .filter(|role| detect(text, *role))
        .collect()
}
