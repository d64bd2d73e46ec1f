//! Prompt pack builder for agent input.
//!
//! The final prompt is rendered from a minijinja template whose output is
//! split into sections by `<!-- section:KEY required|droppable -->` markers.
//! When the prompt exceeds the byte budget, droppable sections are removed in
//! a fixed order; required sections are always kept.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::AgentRole;
use crate::io::paths::RalphPaths;

const COMPOSE_TEMPLATE: &str = include_str!("prompts/compose.md");
const SPEC_CREATION_PROMPT: &str = include_str!("prompts/spec_creation.md");
const PLANNING_PROMPT: &str = include_str!("prompts/planning.md");
const BUILDING_PROMPT: &str = include_str!("prompts/building.md");
const AGENTS_UPDATER_PROMPT: &str = include_str!("prompts/agents_updater.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 3] = ["references", "memory", "feedback"];

/// Built-in base prompt for a role, used when `.ralph/agents/<role>.md` is absent.
pub fn default_base_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::SpecCreation => SPEC_CREATION_PROMPT,
        AgentRole::Planning => PLANNING_PROMPT,
        AgentRole::Building => BUILDING_PROMPT,
        AgentRole::AgentsUpdater => AGENTS_UPDATER_PROMPT,
    }
}

/// Read the role's prompt template, falling back to the built-in one.
pub fn load_base_prompt(paths: &RalphPaths, role: AgentRole) -> Result<String> {
    let path = paths.agent_template_path(role);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(role = %role, "agent template missing, using built-in prompt");
            Ok(default_base_prompt(role).to_string())
        }
        Err(err) => Err(err).with_context(|| format!("read agent template {}", path.display())),
    }
}

fn completion_condition(role: AgentRole) -> &'static str {
    match role {
        AgentRole::SpecCreation => {
            "Stop when the specs in the specs directory fully describe the goal."
        }
        AgentRole::Planning => {
            "Stop when the implementation plan lists every task needed to implement the specs."
        }
        AgentRole::Building => {
            "Stop when your assigned task is fully implemented, the tests pass, and its line in the plan is marked `- [x]`."
        }
        AgentRole::AgentsUpdater => "Stop when `AGENTS.md` reflects what you learned.",
    }
}

/// Prompt construction failures the caller must branch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    EmptyBasePrompt { role: AgentRole },
    MissingTask { role: AgentRole },
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::EmptyBasePrompt { role } => {
                write!(f, "base prompt for role '{role}' is empty")
            }
            PromptError::MissingTask { role } => {
                write!(f, "role '{role}' requires an assigned task but none was given")
            }
        }
    }
}

impl std::error::Error for PromptError {}

/// A labeled block of reference material appended after the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub label: String,
    pub content: String,
}

impl Reference {
    /// Load a reference file; the label is the path as given.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("read reference {}", path.display()))?;
        Ok(Self {
            label: path.display().to_string(),
            content,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ReferenceContext<'a> {
    label: &'a str,
    content: &'a str,
    /// Backtick fence longer than any run inside the content.
    fence: String,
}

impl<'a> ReferenceContext<'a> {
    fn new(reference: &'a Reference) -> Self {
        let content = reference.content.trim_end();
        let longest_run = content
            .split(|c| c != '`')
            .map(str::len)
            .max()
            .unwrap_or(0);
        Self {
            label: &reference.label,
            content,
            fence: "`".repeat(longest_run.max(2) + 1),
        }
    }
}

/// All inputs needed to build a prompt pack. The builder reads nothing itself.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub role: AgentRole,
    /// Role template text (`.ralph/agents/<role>.md`).
    pub base_prompt: String,
    /// Verbatim text of the assigned task (building only).
    pub task: Option<String>,
    /// What the user wants built (spec creation).
    pub goal: Option<String>,
    /// Validation failures from the previous iteration.
    pub feedback: Option<String>,
    /// Rendered project memory, when enabled.
    pub memory: Option<String>,
    pub references: Vec<Reference>,
    pub specs_dir: String,
    pub plan_path: String,
    pub progress_path: String,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("compose", COMPOSE_TEMPLATE)
            .expect("compose template should be valid");
        Self { env }
    }

    fn render(&self, input: &PromptInputs) -> Result<String> {
        let references: Vec<ReferenceContext<'_>> = input
            .references
            .iter()
            .filter(|r| !r.content.trim().is_empty())
            .map(ReferenceContext::new)
            .collect();
        let template = self.env.get_template("compose")?;
        let rendered = template.render(context! {
            base_prompt => input.base_prompt.trim(),
            specs_dir => &input.specs_dir,
            plan_path => &input.plan_path,
            progress_path => &input.progress_path,
            goal => non_blank(input.goal.as_deref()),
            task => non_blank(input.task.as_deref()),
            feedback => non_blank(input.feedback.as_deref()),
            memory => non_blank(input.memory.as_deref()),
            references => references,
            completion => completion_condition(input.role),
            sentinel => input.role.sentinel(),
        })?;
        Ok(rendered)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content without its marker.
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex should be valid")
    });

    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
                whole.start(),
                whole.end(),
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (key, required, _, start)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(_, _, next_start, _)| *next_start);
        let content = rendered[*start..end].trim().to_string();
        if !content.is_empty() {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

const SECTION_SEPARATOR: &str = "\n\n";

fn total_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SECTION_SEPARATOR.len() * sections.len().saturating_sub(1) + 1
}

/// Drop droppable sections until the rendered prompt fits `budget`.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) -> Vec<String> {
    let mut dropped = Vec::new();
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let section = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = section.content.len(),
                "dropped section for budget"
            );
            dropped.push(section.key);
        }
    }
    let len = total_len(sections);
    if len > budget {
        warn!(
            len,
            budget, "prompt exceeds budget with only required sections left"
        );
    }
    dropped
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR);
    out.push('\n');
    out
}

/// Builds a prompt pack within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Compose the final prompt.
    ///
    /// Fails with [`PromptError`] when the base prompt is blank, or when the
    /// role needs an assigned task and none (or a blank one) was given.
    pub fn build(&self, input: &PromptInputs) -> Result<PromptPack> {
        if input.base_prompt.trim().is_empty() {
            return Err(PromptError::EmptyBasePrompt { role: input.role }.into());
        }
        if input.role.requires_task() && non_blank(input.task.as_deref()).is_none() {
            return Err(PromptError::MissingTask { role: input.role }.into());
        }

        let rendered = PromptEngine::new()
            .render(input)
            .context("render prompt template")?;
        let mut sections = parse_sections(&rendered);
        let dropped = apply_budget_to_sections(&mut sections, self.budget_bytes);

        Ok(PromptPack {
            content: render_sections(&sections),
            dropped,
        })
    }
}

/// A rendered prompt ready to send to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    content: String,
    dropped: Vec<String>,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }

    /// Keys of sections removed to fit the budget.
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signal::TASK_COMPLETE;

    fn inputs(role: AgentRole) -> PromptInputs {
        PromptInputs {
            role,
            base_prompt: default_base_prompt(role).to_string(),
            task: Some("Add the `--json` flag to `ralph status`".to_string()),
            goal: None,
            feedback: Some("tests failed: status_json".to_string()),
            memory: Some("### Commands\n\n- [2026-01-01] cargo test".to_string()),
            references: vec![Reference {
                label: "docs/api.md".to_string(),
                content: "GET /status returns JSON".to_string(),
            }],
            specs_dir: "specs".to_string(),
            plan_path: ".ralph/sessions/default/IMPLEMENTATION_PLAN.md".to_string(),
            progress_path: ".ralph/sessions/default/progress.md".to_string(),
        }
    }

    fn position(content: &str, needle: &str) -> usize {
        content
            .find(needle)
            .unwrap_or_else(|| panic!("missing {needle:?} in prompt:\n{content}"))
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let pack = PromptBuilder::new(60_000)
            .build(&inputs(AgentRole::Building))
            .expect("build");
        let content = pack.as_str();

        let base = position(content, "# Role: builder");
        let task = position(content, "## YOUR ASSIGNED TASK");
        let feedback = position(content, "## Feedback from the previous iteration");
        let memory = position(content, "## Project memory");
        let reference = position(content, "### Reference: docs/api.md");
        let completion = position(content, "## Completion");

        assert!(base < task);
        assert!(task < feedback);
        assert!(feedback < memory);
        assert!(memory < reference);
        assert!(reference < completion);
        assert!(content.trim_end().ends_with(TASK_COMPLETE));
        assert!(pack.dropped().is_empty());
    }

    #[test]
    fn task_text_is_verbatim_with_anti_drift_instruction() {
        let pack = PromptBuilder::new(60_000)
            .build(&inputs(AgentRole::Building))
            .expect("build");
        let content = pack.as_str();
        assert!(content.contains(
            "## YOUR ASSIGNED TASK\n\nAdd the `--json` flag to `ralph status`\n"
        ));
        assert!(content.contains("Do not pick a different task from the plan"));
        assert!(content.contains("do not work on more than\none task"));
    }

    #[test]
    fn references_are_labeled_fenced_blocks_outside_the_task() {
        let mut input = inputs(AgentRole::Building);
        input.references.push(Reference {
            label: "notes.md".to_string(),
            content: "contains ``` a fence".to_string(),
        });
        let pack = PromptBuilder::new(60_000).build(&input).expect("build");
        let content = pack.as_str();
        assert!(content.contains("### Reference: docs/api.md\n\n```\nGET /status returns JSON\n```"));
        assert!(content.contains("### Reference: notes.md\n\n````\ncontains ``` a fence\n````"));
        let task_section = &content[position(content, "## YOUR ASSIGNED TASK")
            ..position(content, "## Feedback from the previous iteration")];
        assert!(!task_section.contains("GET /status"));
    }

    #[test]
    fn blank_base_prompt_is_rejected() {
        let mut input = inputs(AgentRole::Planning);
        input.base_prompt = "  \n\t".to_string();
        let err = PromptBuilder::new(60_000).build(&input).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PromptError>(),
            Some(&PromptError::EmptyBasePrompt {
                role: AgentRole::Planning
            })
        );
    }

    #[test]
    fn building_requires_a_task_but_planning_does_not() {
        let mut input = inputs(AgentRole::Building);
        input.task = Some("   ".to_string());
        let err = PromptBuilder::new(60_000).build(&input).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PromptError>(),
            Some(&PromptError::MissingTask {
                role: AgentRole::Building
            })
        );

        let mut planning = inputs(AgentRole::Planning);
        planning.task = None;
        let pack = PromptBuilder::new(60_000).build(&planning).expect("build");
        assert!(!pack.as_str().contains("YOUR ASSIGNED TASK"));
    }

    #[test]
    fn budget_drops_references_then_memory_then_feedback() {
        let mut input = inputs(AgentRole::Building);
        input.references[0].content = "r".repeat(4_000);
        input.memory = Some("m".repeat(2_000));
        input.feedback = Some("f".repeat(1_000));

        let full = PromptBuilder::new(60_000).build(&input).expect("full");
        let full_len = full.as_str().len();

        let pack = PromptBuilder::new(full_len - 100).build(&input).expect("tight");
        assert_eq!(pack.dropped(), ["references"]);
        assert!(pack.as_str().contains("## Project memory"));

        let pack = PromptBuilder::new(full_len - 4_500).build(&input).expect("tighter");
        assert_eq!(pack.dropped(), ["references", "memory"]);
        assert!(pack.as_str().contains("## Feedback from the previous iteration"));

        let pack = PromptBuilder::new(10).build(&input).expect("minimal");
        assert_eq!(pack.dropped(), ["references", "memory", "feedback"]);
        let content = pack.as_str();
        assert!(content.contains("## YOUR ASSIGNED TASK"));
        assert!(content.contains("# Role: builder"));
        assert!(content.contains(TASK_COMPLETE));
    }

    #[test]
    fn fits_budget_after_dropping() {
        let mut input = inputs(AgentRole::Building);
        input.references[0].content = "r".repeat(4_000);
        let full_len = PromptBuilder::new(60_000)
            .build(&input)
            .expect("full")
            .as_str()
            .len();
        let budget = full_len - 1_000;
        let pack = PromptBuilder::new(budget).build(&input).expect("tight");
        assert!(pack.as_str().len() <= budget);
    }

    #[test]
    fn load_base_prompt_prefers_project_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RalphPaths::new(temp.path());
        assert_eq!(
            load_base_prompt(&paths, AgentRole::Planning).expect("default"),
            PLANNING_PROMPT
        );
        fs::create_dir_all(&paths.agents_dir).expect("mkdir");
        fs::write(paths.agent_template_path(AgentRole::Planning), "custom planner").expect("write");
        assert_eq!(
            load_base_prompt(&paths, AgentRole::Planning).expect("custom"),
            "custom planner"
        );
    }
}
