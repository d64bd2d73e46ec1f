//! Read-only git adapter.
//!
//! The loop never commits; it only asks git which files an iteration touched
//! so the progress log can list them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Dirty files at one point in time, keyed by path.
///
/// Each entry pairs the porcelain code with the file's size and mtime, so a
/// file that was already modified and is modified again still shows up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    files: BTreeMap<String, FileState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileState {
    code: String,
    len: Option<u64>,
    modified: Option<SystemTime>,
}

impl StatusSnapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths that appear, disappear, or change state between `self` and `after`.
    pub fn changed_in(&self, after: &StatusSnapshot) -> Vec<String> {
        let mut changed = BTreeSet::new();
        for (path, state) in &after.files {
            if self.files.get(path) != Some(state) {
                changed.insert(path.clone());
            }
        }
        for path in self.files.keys() {
            if !after.files.contains_key(path) {
                changed.insert(path.clone());
            }
        }
        changed.into_iter().collect()
    }
}

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True if `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let output = self.run(&["status", "--porcelain=v1", "-uall"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git status failed: {}", stderr.trim()));
        }
        let out = String::from_utf8_lossy(&output.stdout);
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Record the dirty files, excluding `.ralph/` bookkeeping.
    ///
    /// Outside a git repository, or when git fails, the snapshot is empty.
    pub fn snapshot(&self) -> StatusSnapshot {
        if !self.is_repo() {
            return StatusSnapshot::default();
        }
        match self.status_porcelain() {
            Ok(entries) => StatusSnapshot {
                files: entries
                    .into_iter()
                    .filter(|entry| !entry.path.starts_with(".ralph/"))
                    .map(|entry| {
                        let state = self.file_state(&entry);
                        (entry.path, state)
                    })
                    .collect(),
            },
            Err(err) => {
                debug!(err = %err, "could not list changed files");
                StatusSnapshot::default()
            }
        }
    }

    /// Files whose state changed since `before` was taken.
    pub fn touched_since(&self, before: &StatusSnapshot) -> Vec<String> {
        before.changed_in(&self.snapshot())
    }

    fn file_state(&self, entry: &StatusEntry) -> FileState {
        let meta = fs::metadata(self.workdir.join(&entry.path)).ok();
        FileState {
            code: entry.code.clone(),
            len: meta.as_ref().map(|m| m.len()),
            modified: meta.and_then(|m| m.modified().ok()),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim();
    }
    Ok(StatusEntry {
        code,
        path: unquote(path),
    })
}

/// Porcelain quotes paths containing spaces or special characters.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? notes/new file.md").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "notes/new file.md".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_and_quoted_lines() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(e.code, " M");
        assert_eq!(e.path, "src/main.rs");
        let e = parse_status_line("A  \"with space.rs\"").expect("parse");
        assert_eq!(e.path, "with space.rs");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn outside_a_repository_nothing_changed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        let before = git.snapshot();
        fs::write(temp.path().join("new.rs"), "fn main() {}\n").expect("write");
        assert!(before.is_empty());
        assert!(git.touched_since(&before).is_empty());
    }

    #[test]
    fn only_files_changed_after_the_snapshot_are_touched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let init = Command::new("git")
            .args(["init", "-q"])
            .current_dir(temp.path())
            .status();
        if !init.is_ok_and(|status| status.success()) {
            return;
        }
        let root = temp.path();
        fs::write(root.join("stale.md"), "left over\n").expect("write");
        fs::write(root.join("edited.rs"), "one\n").expect("write");
        fs::create_dir_all(root.join(".ralph")).expect("mkdir");
        let git = Git::new(root);

        let before = git.snapshot();
        assert_eq!(before.len(), 2);
        fs::write(root.join("edited.rs"), "one\ntwo\n").expect("write");
        fs::write(root.join("fresh.rs"), "new\n").expect("write");
        fs::write(root.join(".ralph/progress.md"), "log\n").expect("write");

        assert_eq!(
            git.touched_since(&before),
            vec!["edited.rs".to_string(), "fresh.rs".to_string()]
        );
    }

    #[test]
    fn removed_entries_count_as_changed() {
        let mut before = StatusSnapshot::default();
        before.files.insert(
            "gone.rs".to_string(),
            FileState {
                code: "??".to_string(),
                len: Some(3),
                modified: None,
            },
        );
        assert_eq!(
            before.changed_in(&StatusSnapshot::default()),
            vec!["gone.rs".to_string()]
        );
    }
}
