//! Checklist plan parsing and mutation.
//!
//! The plan document is edited by humans and agents alike, so the parser keeps
//! every line verbatim (including its line ending) and only ever rewrites the
//! single state byte of a checkbox. Rendering an unmodified plan yields the
//! exact input bytes.

/// Classification of a single plan line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind<'a> {
    /// `- [ ] text`
    Pending(&'a str),
    /// `- [x] text` or `- [X] text`
    Done(&'a str),
    /// Anything else, including malformed checkboxes.
    Other,
}

/// Classify one line of a plan document.
///
/// Recognizes `-` and `*` bullets with optional leading indentation. A
/// checkbox must be followed by whitespace and non-empty text.
pub fn classify_line(line: &str) -> LineKind<'_> {
    match checkbox(line) {
        Some(cb) if cb.done => LineKind::Done(cb.text),
        Some(cb) => LineKind::Pending(cb.text),
        None => LineKind::Other,
    }
}

struct Checkbox<'a> {
    /// Byte offset of the state character (` `, `x`, `X`) within the line.
    state_offset: usize,
    done: bool,
    text: &'a str,
}

fn checkbox(line: &str) -> Option<Checkbox<'_>> {
    let content = strip_line_ending(line);
    let body = content.trim_start_matches([' ', '\t']);
    let indent = content.len() - body.len();
    let rest = body.strip_prefix("- ").or_else(|| body.strip_prefix("* "))?;

    let bytes = rest.as_bytes();
    if bytes.len() < 3 || bytes[0] != b'[' || bytes[2] != b']' {
        return None;
    }
    let done = match bytes[1] {
        b' ' => false,
        b'x' | b'X' => true,
        _ => return None,
    };
    let after = &rest[3..];
    let text = after
        .strip_prefix(' ')
        .or_else(|| after.strip_prefix('\t'))?
        .trim();
    if text.is_empty() {
        return None;
    }
    Some(Checkbox {
        state_offset: indent + 3,
        done,
        text,
    })
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// One checklist item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// 1-based position among tasks (not lines).
    pub ordinal: usize,
    /// 0-based line index in the document.
    pub line: usize,
    pub text: String,
    pub done: bool,
    state_offset: usize,
}

/// Pending/completed counts. `total == pending + completed` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlanStats {
    pub pending: usize,
    pub completed: usize,
    pub total: usize,
}

/// Parsed plan document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskPlan {
    lines: Vec<String>,
    tasks: Vec<Task>,
}

impl TaskPlan {
    pub fn parse(document: &str) -> Self {
        let lines: Vec<String> = document
            .split_inclusive('\n')
            .map(str::to_string)
            .collect();
        let mut tasks = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if let Some(cb) = checkbox(line) {
                tasks.push(Task {
                    ordinal: tasks.len() + 1,
                    line: idx,
                    text: cb.text.to_string(),
                    done: cb.done,
                    state_offset: cb.state_offset,
                });
            }
        }
        Self { lines, tasks }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, ordinal: usize) -> Option<&Task> {
        self.tasks.iter().find(|task| task.ordinal == ordinal)
    }

    /// First pending task in document order.
    pub fn next_pending(&self) -> Option<&Task> {
        self.tasks.iter().find(|task| !task.done)
    }

    /// Find a task by its text, preferring a pending match.
    ///
    /// Used after the document was re-read from disk, where ordinals may have
    /// shifted because someone inserted or removed lines.
    pub fn find_by_text(&self, text: &str) -> Option<&Task> {
        let text = text.trim();
        self.tasks
            .iter()
            .find(|task| !task.done && task.text == text)
            .or_else(|| self.tasks.iter().find(|task| task.text == text))
    }

    /// Flip the task with `ordinal` to done.
    ///
    /// Returns true if the document changed. Marking a done task again is a
    /// no-op, so applying this twice yields the same document as once.
    pub fn mark_done(&mut self, ordinal: usize) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|task| task.ordinal == ordinal) else {
            return false;
        };
        if task.done {
            return false;
        }
        let offset = task.state_offset;
        self.lines[task.line].replace_range(offset..offset + 1, "x");
        task.done = true;
        true
    }

    /// Mark the task whose text matches `text`, preferring a pending match.
    pub fn mark_done_text(&mut self, text: &str) -> bool {
        match self.find_by_text(text).map(|task| task.ordinal) {
            Some(ordinal) => self.mark_done(ordinal),
            None => false,
        }
    }

    pub fn stats(&self) -> PlanStats {
        let completed = self.tasks.iter().filter(|task| task.done).count();
        PlanStats {
            pending: self.tasks.len() - completed,
            completed,
            total: self.tasks.len(),
        }
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn render(&self) -> String {
        self.lines.concat()
    }
}
