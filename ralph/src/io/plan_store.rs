//! Plan document storage (`IMPLEMENTATION_PLAN.md`).

use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::plan::TaskPlan;
use crate::io::atomic::write_atomic;

/// Header written by `reset_plan`; contains no tasks.
pub const EMPTY_PLAN: &str = "# Implementation Plan\n\nNo tasks yet. The planning agent fills this checklist.\n";

/// Read the plan from disk.
///
/// A missing file is an empty plan. An unreadable file (including invalid
/// UTF-8) is also reported as empty, with a warning.
pub fn load_plan(path: &Path) -> TaskPlan {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let plan = TaskPlan::parse(&contents);
            let stats = plan.stats();
            debug!(
                path = %path.display(),
                pending = stats.pending,
                completed = stats.completed,
                "plan loaded"
            );
            plan
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => TaskPlan::default(),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable plan, treating as empty");
            TaskPlan::default()
        }
    }
}

pub fn write_plan(path: &Path, plan: &TaskPlan) -> Result<()> {
    debug!(path = %path.display(), "writing plan");
    write_atomic(path, &plan.render())
}

/// Replace the plan with an empty document.
pub fn reset_plan(path: &Path) -> Result<()> {
    write_atomic(path, EMPTY_PLAN)
}
