//! Append-only progress log (`progress.md`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::Phase;

const HEADER: &str = "# Progress\n";

/// One iteration's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    /// RFC 3339 time the iteration finished.
    pub timestamp: String,
    pub iteration: u32,
    pub phase: Phase,
    pub task: Option<String>,
    /// Short human summary, e.g. `task completed` or `sentinel missing`.
    pub outcome: String,
    pub files_touched: Vec<String>,
    /// Validation feedback or other notes for later iterations.
    pub learnings: Option<String>,
}

pub fn render_entry(entry: &ProgressEntry) -> String {
    let mut out = format!(
        "\n## {} | iteration {}\n\n### What changed\n\n",
        entry.timestamp, entry.iteration
    );
    out.push_str(&format!("- Phase: {}\n", entry.phase));
    if let Some(task) = &entry.task {
        out.push_str(&format!("- Task: {task}\n"));
    }
    out.push_str(&format!("- Outcome: {}\n", entry.outcome));
    if entry.files_touched.is_empty() {
        out.push_str("- Files touched: none\n");
    } else {
        out.push_str("- Files touched:\n");
        for file in &entry.files_touched {
            out.push_str(&format!("  - {file}\n"));
        }
    }
    let learnings = entry
        .learnings
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("None.");
    out.push_str(&format!("\n### Learnings\n\n{learnings}\n"));
    out
}

/// Append an entry, creating the log (with its header) on first use.
pub fn append_entry(path: &Path, entry: &ProgressEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let is_new = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    if is_new {
        file.write_all(HEADER.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
    }
    file.write_all(render_entry(entry).as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    debug!(path = %path.display(), iteration = entry.iteration, "progress entry appended");
    Ok(())
}

/// Truncate the log back to its header.
pub fn reset_progress(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, HEADER).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(iteration: u32) -> ProgressEntry {
        ProgressEntry {
            timestamp: "2026-01-02T03:04:05+00:00".to_string(),
            iteration,
            phase: Phase::Building,
            task: Some("add parser".to_string()),
            outcome: "task completed".to_string(),
            files_touched: vec!["src/parser.rs".to_string()],
            learnings: None,
        }
    }

    #[test]
    fn entries_are_appended_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session/progress.md");
        append_entry(&path, &entry(1)).expect("append 1");
        append_entry(&path, &entry(2)).expect("append 2");

        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.starts_with(HEADER));
        let first = contents.find("| iteration 1").expect("first entry");
        let second = contents.find("| iteration 2").expect("second entry");
        assert!(first < second);
        assert_eq!(contents.matches("### Learnings\n\nNone.").count(), 2);
    }

    #[test]
    fn entry_lists_files_and_learnings() {
        let mut e = entry(4);
        e.files_touched.push("Cargo.toml".to_string());
        e.learnings = Some("tests: 2 failures\n".to_string());
        let rendered = render_entry(&e);
        assert!(rendered.contains("## 2026-01-02T03:04:05+00:00 | iteration 4\n"));
        assert!(rendered.contains("- Task: add parser\n"));
        assert!(rendered.contains("  - src/parser.rs\n  - Cargo.toml\n"));
        assert!(rendered.ends_with("### Learnings\n\ntests: 2 failures\n"));
    }

    #[test]
    fn reset_truncates_to_header() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.md");
        append_entry(&path, &entry(1)).expect("append");
        reset_progress(&path).expect("reset");
        assert_eq!(fs::read_to_string(&path).expect("read"), HEADER);
    }
}
