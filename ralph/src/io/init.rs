//! Initialization helpers for `.ralph/` scaffolding.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::core::types::AgentRole;
use crate::io::config::{RalphConfig, write_config};
use crate::io::memory::{Memory, write_memory};
use crate::io::paths::RalphPaths;
use crate::io::prompt::default_base_prompt;
use crate::io::settings::{Settings, write_settings};

const RALPH_GITIGNORE: &str = "active_session\nsessions/*/iterations/\n*.tmp\n";

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing ralph-owned files (memory is always kept).
    pub force: bool,
}

/// Create `.ralph/` scaffolding in `root`.
///
/// Fails if `.ralph/` already exists unless `options.force` is set.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<RalphPaths> {
    let paths = RalphPaths::new(root);
    if paths.ralph_dir.exists() && !paths.ralph_dir.is_dir() {
        return Err(anyhow!("ralph init: .ralph exists but is not a directory"));
    }
    if paths.ralph_dir.exists() && !options.force {
        return Err(anyhow!(
            "ralph init: .ralph already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.ralph_dir)?;
    create_dir(&paths.agents_dir)?;
    create_dir(&paths.sessions_dir)?;

    write_file(&paths.ralph_dir.join(".gitignore"), RALPH_GITIGNORE)?;
    write_config(&paths.config_path, &RalphConfig::default())?;
    write_settings(&paths.settings_path, &Settings::default())?;
    if !paths.memory_path.exists() {
        write_memory(&paths.memory_path, &Memory::default())?;
    }
    for role in AgentRole::ALL {
        write_file(&paths.agent_template_path(role), default_base_prompt(role))?;
    }

    Ok(paths)
}

/// Return the project paths, failing if `ralph init` has not been run.
pub fn ensure_initialized(root: &Path) -> Result<RalphPaths> {
    let paths = RalphPaths::new(root);
    if !paths.ralph_dir.is_dir() {
        return Err(anyhow!(
            "{} is not initialized (run `ralph init` first)",
            root.display()
        ));
    }
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}
