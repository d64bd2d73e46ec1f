//! Per-iteration artifacts under `sessions/<id>/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{AgentRole, Phase, ValidationOutcome};
use crate::io::agent::AgentRunStatus;
use crate::io::atomic::write_json_atomic;
use crate::io::paths::SessionPaths;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub session_id: String,
    pub iteration: u32,
    pub phase: Phase,
    pub role: AgentRole,
    pub task_id: Option<usize>,
    pub task: Option<String>,
    pub agent_status: AgentRunStatus,
    pub exit_code: Option<i32>,
    pub sentinel_seen: bool,
    pub validation: ValidationOutcome,
    pub task_marked_done: bool,
    pub pending_after: usize,
    pub prompt_bytes: usize,
    pub dropped_sections: Vec<String>,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub agent_log_path: PathBuf,
    pub validation_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(session: &SessionPaths, iteration: u32) -> Self {
        let dir = session.iteration_dir(iteration);
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            agent_log_path: dir.join("agent.log"),
            validation_log_path: dir.join("validation.log"),
            dir,
        }
    }

    /// Create the directory and record the prompt before the agent starts.
    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))?;
        write_text(&self.prompt_path, prompt)
    }

    /// Record the outcome once the iteration has finished.
    pub fn write_outcome(&self, meta: &IterationMeta, validation_log: Option<&str>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))?;
        if let Some(log) = validation_log.filter(|log| !log.is_empty()) {
            write_text(&self.validation_log_path, log)?;
        }
        write_json_atomic(&self.meta_path, meta)
    }
}

/// Number for the next iteration of a session: one past the highest
/// iteration directory already on disk.
pub fn next_iteration_number(session: &SessionPaths) -> u32 {
    let Ok(entries) = fs::read_dir(&session.iterations_dir) else {
        return 1;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .max()
        .map_or(1, |last| last.saturating_add(1))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SpecsMode;
    use crate::io::paths::RalphPaths;

    fn meta() -> IterationMeta {
        IterationMeta {
            session_id: "default".to_string(),
            iteration: 3,
            phase: Phase::Building,
            role: AgentRole::Building,
            task_id: Some(2),
            task: Some("add parser".to_string()),
            agent_status: AgentRunStatus::Failed { exit_code: Some(1) },
            exit_code: Some(1),
            sentinel_seen: true,
            validation: ValidationOutcome::Fail,
            task_marked_done: false,
            pending_after: 4,
            prompt_bytes: 1200,
            dropped_sections: vec!["references".to_string()],
            started_at: "2026-01-02T03:04:05+00:00".to_string(),
            ended_at: "2026-01-02T03:05:05+00:00".to_string(),
            duration_ms: 60_000,
        }
    }

    #[test]
    fn iteration_paths_are_stable() {
        let project = RalphPaths::new("/work");
        let paths = IterationPaths::new(&project.session("s1", SpecsMode::Shared), 3);
        assert!(
            paths
                .dir
                .ends_with(Path::new(".ralph/sessions/s1/iterations/3"))
        );
        assert!(paths.prompt_path.ends_with("prompt.md"));
        assert!(paths.agent_log_path.ends_with("agent.log"));
    }

    #[test]
    fn writes_prompt_meta_and_validation_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = RalphPaths::new(temp.path());
        let paths = IterationPaths::new(&project.session("s1", SpecsMode::Shared), 3);

        paths.write_prompt("the prompt").expect("prompt");
        paths
            .write_outcome(&meta(), Some("##### tests | fail"))
            .expect("outcome");

        assert_eq!(
            fs::read_to_string(&paths.prompt_path).expect("read"),
            "the prompt"
        );
        assert!(paths.validation_log_path.is_file());
        let meta_json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("read"))
                .expect("json");
        assert_eq!(meta_json["agent_status"]["kind"], "failed");
        assert_eq!(meta_json["validation"], "fail");
        assert_eq!(meta_json["phase"], "building");
    }

    #[test]
    fn next_number_follows_existing_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = RalphPaths::new(temp.path()).session("s1", SpecsMode::Shared);
        assert_eq!(next_iteration_number(&session), 1);

        for n in [1, 2, 10] {
            fs::create_dir_all(session.iteration_dir(n)).expect("mkdir");
        }
        fs::create_dir_all(session.iterations_dir.join("scratch")).expect("mkdir");
        assert_eq!(next_iteration_number(&session), 11);
    }
}
