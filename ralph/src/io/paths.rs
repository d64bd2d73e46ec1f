//! Canonical paths within `.ralph/` for a project root.

use std::path::{Path, PathBuf};

use crate::core::types::{AgentRole, SpecsMode};

/// Project-wide paths (shared by every session).
#[derive(Debug, Clone)]
pub struct RalphPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    pub config_path: PathBuf,
    pub settings_path: PathBuf,
    pub memory_path: PathBuf,
    pub active_session_path: PathBuf,
    pub agents_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub shared_specs_dir: PathBuf,
}

impl RalphPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join(".ralph");
        Self {
            config_path: ralph_dir.join("config.toml"),
            settings_path: ralph_dir.join("settings.json"),
            memory_path: ralph_dir.join("memory.md"),
            active_session_path: ralph_dir.join("active_session"),
            agents_dir: ralph_dir.join("agents"),
            sessions_dir: ralph_dir.join("sessions"),
            shared_specs_dir: root.join("specs"),
            ralph_dir,
            root,
        }
    }

    pub fn agent_template_path(&self, role: AgentRole) -> PathBuf {
        self.agents_dir.join(role.template_file_name())
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(id)
    }

    pub fn session(&self, id: &str, specs_mode: SpecsMode) -> SessionPaths {
        SessionPaths::new(self, id, specs_mode)
    }
}

/// Paths owned by one session.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub plan_path: PathBuf,
    pub progress_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub feedback_path: PathBuf,
    pub iterations_dir: PathBuf,
    /// Where this session reads and writes specs (depends on specs mode).
    pub specs_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(project: &RalphPaths, id: &str, specs_mode: SpecsMode) -> Self {
        let dir = project.session_dir(id);
        let specs_dir = match specs_mode {
            SpecsMode::Isolated => dir.join("specs"),
            SpecsMode::Shared => project.shared_specs_dir.clone(),
        };
        Self {
            meta_path: dir.join("session.json"),
            plan_path: dir.join("IMPLEMENTATION_PLAN.md"),
            progress_path: dir.join("progress.md"),
            checkpoint_path: dir.join("checkpoint.json"),
            feedback_path: dir.join("feedback.md"),
            iterations_dir: dir.join("iterations"),
            specs_dir,
            dir,
        }
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.iterations_dir.join(iteration.to_string())
    }
}

/// Returns true if `dir` contains at least one markdown spec file.
pub fn has_specs(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|entry| entry.ok()).any(|entry| {
        let path = entry.path();
        path.is_file() && path.extension().is_some_and(|ext| ext == "md")
    })
}
