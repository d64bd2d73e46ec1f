//! Test-only helpers: a throwaway initialized project and scripted
//! collaborators that stand in for the agent, validation and the menu.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::menu::{MenuChoice, MenuOption, resolve_input};
use crate::core::types::Phase;
use crate::io::agent::{AgentRequest, AgentRun, AgentRunStatus, AgentRunner, FatalAgentError};
use crate::io::checkpoint::{Checkpoint, CheckpointManager};
use crate::io::config::RalphConfig;
use crate::io::init::{InitOptions, init_project};
use crate::io::interrupt::CancelToken;
use crate::io::menu::Menu;
use crate::io::paths::RalphPaths;
use crate::io::plan_store::{load_plan, write_plan};
use crate::io::session::{Session, SessionStore};
use crate::io::settings::Settings;
use crate::io::validation::{CheckResult, ValidationReport, ValidationRequest, ValidationRunner};
use crate::orchestrator::OrchestratorConfig;

/// An initialized project in a temporary directory, using the default session.
pub struct TestProject {
    _temp: TempDir,
    paths: RalphPaths,
}

impl TestProject {
    /// Initialized project with no specs and an empty plan.
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        SessionStore::new(paths.clone())
            .ensure_default()
            .expect("default session");
        Self { _temp: temp, paths }
    }

    /// Project with one shared spec file and the given plan document.
    pub fn with_plan(plan: &str) -> Self {
        let project = Self::new();
        fs::create_dir_all(&project.paths.shared_specs_dir).expect("specs dir");
        fs::write(project.paths.shared_specs_dir.join("overview.md"), "# Overview\n")
            .expect("write spec");
        project.write_plan(plan);
        project
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn paths(&self) -> &RalphPaths {
        &self.paths
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(self.paths.clone())
    }

    pub fn session(&self) -> Session {
        self.store().resolve(None).expect("resolve session")
    }

    /// Defaults from a fresh config, without terminal echo.
    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            echo: false,
            ..OrchestratorConfig::new(&RalphConfig::default(), &Settings::default())
        }
    }

    pub fn write_plan(&self, plan: &str) {
        fs::write(self.session().paths.plan_path, plan).expect("write plan");
    }

    pub fn write_checkpoint(&self, phase: Phase, iteration: u32, pending: usize) {
        CheckpointManager::new(self.session().paths.checkpoint_path)
            .save(&Checkpoint::now(phase, iteration, pending))
            .expect("write checkpoint");
    }

    /// Scripted agent that edits this project's session plan.
    pub fn agent(&self, runs: Vec<ScriptedRun>) -> ScriptedAgent {
        ScriptedAgent::new(self.session().paths.plan_path, runs)
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// One scripted agent invocation and the side effects it performs.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    output: String,
    exit_code: Option<i32>,
    status: AgentRunStatus,
    fatal: Option<String>,
    crash: bool,
    interrupt: bool,
    complete_next_task: bool,
    plan: Option<String>,
    files: Vec<(PathBuf, String)>,
}

impl ScriptedRun {
    /// A clean exit printing `text`.
    pub fn output(text: impl Into<String>) -> Self {
        Self {
            output: text.into(),
            exit_code: Some(0),
            status: AgentRunStatus::Succeeded,
            fatal: None,
            crash: false,
            interrupt: false,
            complete_next_task: false,
            plan: None,
            files: Vec::new(),
        }
    }

    /// The agent cannot run at all.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            fatal: Some(reason.into()),
            ..Self::output("")
        }
    }

    /// The whole process dies mid-run (the runner panics), leaving only what
    /// was already on disk.
    pub fn crash() -> Self {
        Self {
            crash: true,
            ..Self::output("")
        }
    }

    /// The user interrupts while the agent is running.
    pub fn interrupted() -> Self {
        Self {
            exit_code: None,
            status: AgentRunStatus::Cancelled,
            interrupt: true,
            ..Self::output("partial output")
        }
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self.status = if code == 0 {
            AgentRunStatus::Succeeded
        } else {
            AgentRunStatus::Failed {
                exit_code: Some(code),
            }
        };
        self
    }

    /// The agent ticks the first pending checkbox itself.
    pub fn completes_next_task(mut self) -> Self {
        self.complete_next_task = true;
        self
    }

    /// The agent replaces the plan document.
    pub fn writes_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    /// The agent writes a file relative to the project root.
    pub fn writes_file(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }
}

/// Agent runner that replays [`ScriptedRun`]s in order and records requests.
///
/// Running out of script is reported as a fatal agent error so a loop under
/// test cannot spin forever.
pub struct ScriptedAgent {
    plan_path: PathBuf,
    runs: RefCell<VecDeque<ScriptedRun>>,
    requests: RefCell<Vec<AgentRequest>>,
    cancel: Option<CancelToken>,
}

impl ScriptedAgent {
    pub fn new(plan_path: impl Into<PathBuf>, runs: Vec<ScriptedRun>) -> Self {
        Self {
            plan_path: plan_path.into(),
            runs: RefCell::new(runs.into()),
            requests: RefCell::new(Vec::new()),
            cancel: None,
        }
    }

    /// Token that [`ScriptedRun::interrupted`] sets, as the Ctrl-C handler would.
    pub fn cancelling(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    fn apply(&self, run: &ScriptedRun, workdir: &Path) -> Result<()> {
        for (path, contents) in &run.files {
            let path = workdir.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(plan) = &run.plan {
            fs::write(&self.plan_path, plan)
                .with_context(|| format!("write {}", self.plan_path.display()))?;
        }
        if run.complete_next_task {
            let mut plan = load_plan(&self.plan_path);
            if let Some(ordinal) = plan.next_pending().map(|task| task.ordinal) {
                plan.mark_done(ordinal);
                write_plan(&self.plan_path, &plan)?;
            }
        }
        if run.interrupt
            && let Some(token) = &self.cancel
        {
            token.cancel();
        }
        Ok(())
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentRun> {
        self.requests.borrow_mut().push(request.clone());
        let Some(run) = self.runs.borrow_mut().pop_front() else {
            return Err(FatalAgentError {
                reason: "scripted agent has no more runs".to_string(),
            }
            .into());
        };
        if let Some(reason) = run.fatal {
            return Err(FatalAgentError { reason }.into());
        }
        if run.crash {
            panic!("scripted agent crashed during {}", request.role);
        }
        self.apply(&run, &request.workdir)?;
        if let Some(log_path) = &request.log_path {
            fs::write(log_path, &run.output)
                .with_context(|| format!("write {}", log_path.display()))?;
        }
        Ok(AgentRun {
            output: run.output,
            exit_code: run.exit_code,
            status: run.status,
        })
    }
}

/// Validation runner returning queued reports; every check passes once the
/// queue is empty.
#[derive(Default)]
pub struct ScriptedValidator {
    reports: RefCell<VecDeque<ValidationReport>>,
    calls: RefCell<usize>,
}

impl ScriptedValidator {
    pub fn new(reports: Vec<ValidationReport>) -> Self {
        Self {
            reports: RefCell::new(reports.into()),
            calls: RefCell::new(0),
        }
    }

    pub fn passing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        *self.calls.borrow()
    }
}

impl ValidationRunner for ScriptedValidator {
    fn run(&self, request: &ValidationRequest) -> Result<ValidationReport> {
        *self.calls.borrow_mut() += 1;
        if let Some(report) = self.reports.borrow_mut().pop_front() {
            return Ok(report);
        }
        Ok(ValidationReport::from_checks(
            request
                .commands
                .iter()
                .map(|command| CheckResult {
                    name: command.name.clone(),
                    passed: true,
                    exit_code: Some(0),
                    output: String::new(),
                })
                .collect(),
        ))
    }
}

/// Menu that answers from a fixed list of typed inputs.
///
/// Answers resolve exactly like terminal input; unresolvable ones are
/// skipped, and running out of answers (or `q`) cancels.
pub struct ScriptedMenu {
    answers: RefCell<VecDeque<String>>,
    titles: RefCell<Vec<String>>,
}

impl ScriptedMenu {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: RefCell::new(answers.iter().map(|a| a.to_string()).collect()),
            titles: RefCell::new(Vec::new()),
        }
    }

    /// Titles of every menu presented so far.
    pub fn titles(&self) -> Vec<String> {
        self.titles.borrow().clone()
    }
}

impl Menu for ScriptedMenu {
    fn choose<T: Clone>(&self, title: &str, options: &[MenuOption<T>]) -> Result<MenuChoice<T>> {
        self.titles.borrow_mut().push(title.to_string());
        while let Some(answer) = self.answers.borrow_mut().pop_front() {
            if answer.eq_ignore_ascii_case("q") {
                return Ok(MenuChoice::Cancelled);
            }
            if let Some(option) = resolve_input(options, &answer) {
                return Ok(MenuChoice::Selected(option.value.clone()));
            }
        }
        Ok(MenuChoice::Cancelled)
    }
}
