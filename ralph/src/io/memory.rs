//! Cross-session project memory (`.ralph/memory.md`).
//!
//! Four fixed sections of dated bullets. Entries are only ever appended; the
//! file is never pruned automatically. Appends edit the document in place, so
//! prose and hand-added sections are kept as written.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::io::atomic::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySection {
    Patterns,
    Commands,
    Gotchas,
    Decisions,
}

impl MemorySection {
    pub const ALL: [MemorySection; 4] = [
        MemorySection::Patterns,
        MemorySection::Commands,
        MemorySection::Gotchas,
        MemorySection::Decisions,
    ];

    pub fn title(self) -> &'static str {
        match self {
            MemorySection::Patterns => "Patterns",
            MemorySection::Commands => "Commands",
            MemorySection::Gotchas => "Gotchas",
            MemorySection::Decisions => "Decisions",
        }
    }

    fn index(self) -> usize {
        match self {
            MemorySection::Patterns => 0,
            MemorySection::Commands => 1,
            MemorySection::Gotchas => 2,
            MemorySection::Decisions => 3,
        }
    }
}

impl fmt::Display for MemorySection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl FromStr for MemorySection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        let wanted = wanted.strip_suffix('s').unwrap_or(&wanted);
        MemorySection::ALL
            .into_iter()
            .find(|section| {
                let title = section.title().to_ascii_lowercase();
                title.strip_suffix('s').unwrap_or(&title) == wanted
            })
            .ok_or_else(|| {
                anyhow!(
                    "unknown memory section '{s}' (expected patterns, commands, gotchas or decisions)"
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    /// `YYYY-MM-DD`; empty for hand-written bullets without a date.
    pub date: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memory {
    sections: [Vec<MemoryEntry>; 4],
}

impl Memory {
    /// Parse a memory document. Unknown headings and non-bullet lines are ignored.
    pub fn parse(document: &str) -> Self {
        let mut memory = Memory::default();
        let mut current: Option<MemorySection> = None;
        for line in document.lines() {
            let trimmed = line.trim();
            if let Some(heading) = trimmed.strip_prefix("## ") {
                current = heading.parse().ok();
                continue;
            }
            let Some(section) = current else {
                continue;
            };
            let Some(bullet) = trimmed.strip_prefix("- ") else {
                continue;
            };
            let entry = parse_bullet(bullet);
            if !entry.text.is_empty() {
                memory.sections[section.index()].push(entry);
            }
        }
        memory
    }

    pub fn entries(&self, section: MemorySection) -> &[MemoryEntry] {
        &self.sections[section.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(Vec::is_empty)
    }

    /// Add an entry; returns false if the same text is already recorded.
    pub fn add(&mut self, section: MemorySection, text: &str, date: NaiveDate) -> bool {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let entries = &mut self.sections[section.index()];
        if text.is_empty() || entries.iter().any(|entry| entry.text == text) {
            return false;
        }
        entries.push(MemoryEntry {
            date: date.format("%Y-%m-%d").to_string(),
            text,
        });
        true
    }

    /// Full document, every section present.
    pub fn render(&self) -> String {
        let mut out = String::from("# Project Memory\n");
        for section in MemorySection::ALL {
            out.push_str(&format!("\n## {}\n\n", section.title()));
            for entry in self.entries(section) {
                out.push_str(&render_bullet(entry));
            }
        }
        out
    }

    /// Compact form for prompts: only non-empty sections. `None` when empty.
    pub fn prompt_text(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut out = String::new();
        for section in MemorySection::ALL {
            let entries = self.entries(section);
            if entries.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("### {}\n\n", section.title()));
            for entry in entries {
                out.push_str(&render_bullet(entry));
            }
        }
        Some(out)
    }
}

fn parse_bullet(bullet: &str) -> MemoryEntry {
    if let Some(rest) = bullet.strip_prefix('[')
        && let Some((date, text)) = rest.split_once(']')
        && NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok()
    {
        return MemoryEntry {
            date: date.to_string(),
            text: text.trim().to_string(),
        };
    }
    MemoryEntry {
        date: String::new(),
        text: bullet.trim().to_string(),
    }
}

fn render_bullet(entry: &MemoryEntry) -> String {
    if entry.date.is_empty() {
        format!("- {}\n", entry.text)
    } else {
        format!("- [{}] {}\n", entry.date, entry.text)
    }
}

/// Load memory; missing or unreadable files yield an empty memory.
pub fn load_memory(path: &Path) -> Memory {
    match fs::read_to_string(path) {
        Ok(contents) => Memory::parse(&contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Memory::default(),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable memory, treating as empty");
            Memory::default()
        }
    }
}

pub fn write_memory(path: &Path, memory: &Memory) -> Result<()> {
    write_atomic(path, &memory.render())
}

/// Append one entry to the memory file.
///
/// The bullet goes at the end of its `## <Section>` block; a missing heading
/// is added at the end of the file. Every other line is left untouched. A
/// file that exists but cannot be read is an error, never overwritten.
pub fn append_memory(
    path: &Path,
    section: MemorySection,
    text: &str,
    date: NaiveDate,
) -> Result<bool> {
    let document = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Memory::default().render(),
        Err(err) => {
            return Err(err).with_context(|| format!("read memory {}", path.display()));
        }
    };
    let mut memory = Memory::parse(&document);
    if !memory.add(section, text, date) {
        debug!(section = %section, "memory entry skipped (empty or duplicate)");
        return Ok(false);
    }
    let Some(entry) = memory.entries(section).last() else {
        return Ok(false);
    };
    let bullet = render_bullet(entry);
    write_atomic(path, &insert_bullet(&document, section, bullet.trim_end()))?;
    debug!(section = %section, "memory entry appended");
    Ok(true)
}

fn is_heading(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("# ") || line.starts_with("## ")
}

fn insert_bullet(document: &str, section: MemorySection, bullet: &str) -> String {
    let nl = if document.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = document.split_inclusive('\n').collect();
    let heading = lines.iter().position(|line| {
        line.trim()
            .strip_prefix("## ")
            .is_some_and(|title| title.parse::<MemorySection>().ok() == Some(section))
    });

    let mut out = String::with_capacity(document.len() + bullet.len() + 16);
    let Some(start) = heading else {
        out.push_str(document);
        if !out.is_empty() {
            if !out.ends_with('\n') {
                out.push_str(nl);
            }
            out.push_str(nl);
        }
        out.push_str(&format!("## {}{nl}{nl}{bullet}{nl}", section.title()));
        return out;
    };

    let end = lines[start + 1..]
        .iter()
        .position(|line| is_heading(line))
        .map_or(lines.len(), |offset| start + 1 + offset);
    let last_content = (start + 1..end).rev().find(|&i| !lines[i].trim().is_empty());
    let at = last_content.map_or(start + 1, |i| i + 1);

    for line in &lines[..at] {
        out.push_str(line);
    }
    if !out.ends_with('\n') {
        out.push_str(nl);
    }
    if last_content.is_none() {
        out.push_str(nl);
    }
    out.push_str(bullet);
    out.push_str(nl);
    for line in &lines[at..] {
        out.push_str(line);
    }
    out
}
