//! Loop state machine for `ralph run`.
//!
//! ```text
//! Idle ──checkpoint──▶ Recovering ──resume/discard──┐
//!  │                                                ▼
//!  └──────────────▶ SpecCreation ─▶ Planning ─▶ Building ─▶ Complete
//!                         (any state ─interrupt─▶ Cancelled)
//! ```
//!
//! The orchestrator owns phase selection, budgets, checkpoints and terminal
//! status. The work of a single iteration lives in [`crate::iteration`].
//! Collaborators are injected as traits so tests can script them.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::core::budget::RunBudget;
use crate::core::menu::{MenuChoice, MenuOption};
use crate::core::plan::Task;
use crate::core::types::{AgentRole, LoopMode, LoopState, LoopStatus, Phase, ValidationOutcome};
use crate::io::agent::{AgentRunner, FatalAgentError};
use crate::io::checkpoint::{Checkpoint, CheckpointManager};
use crate::io::config::{RalphConfig, ValidationCommand};
use crate::io::interrupt::CancelToken;
use crate::io::iteration_log::next_iteration_number;
use crate::io::menu::Menu;
use crate::io::paths::{RalphPaths, has_specs};
use crate::io::plan_store::load_plan;
use crate::io::prompt::{PromptError, Reference};
use crate::io::session::Session;
use crate::io::settings::Settings;
use crate::io::validation::{ValidationRunner, clear_feedback};
use crate::iteration::{IterationEnv, IterationOutcome, IterationPlan, build_prompt, run_iteration};

/// What to do with an existing checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Ask through the menu.
    #[default]
    Ask,
    Resume,
    Fresh,
}

/// Per-invocation settings, resolved once from config, settings and CLI flags.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub mode: LoopMode,
    pub model: String,
    pub max_iterations: Option<u32>,
    pub max_runtime: Option<Duration>,
    pub iteration_timeout: Option<Duration>,
    pub agent_output_limit_bytes: usize,
    pub validation_output_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
    pub validation: Vec<ValidationCommand>,
    /// Run the agents-updater role once after the plan completes.
    pub update_agents_on_complete: bool,
    pub memory_enabled: bool,
    pub recovery: RecoveryPolicy,
    /// Go back to planning even if the plan already has tasks.
    pub replan: bool,
    /// Show the first prompt instead of running anything.
    pub dry_run: bool,
    pub goal: Option<String>,
    pub references: Vec<Reference>,
    /// Echo agent output to the terminal.
    pub echo: bool,
}

impl OrchestratorConfig {
    pub fn new(config: &RalphConfig, settings: &Settings) -> Self {
        Self {
            mode: LoopMode::Auto,
            model: config.agent.model.clone(),
            max_iterations: config.max_iterations(),
            max_runtime: config.max_runtime(),
            iteration_timeout: config.iteration_timeout(),
            agent_output_limit_bytes: config.agent_output_limit_bytes,
            validation_output_limit_bytes: config.validation_output_limit_bytes,
            prompt_budget_bytes: config.prompt_budget_bytes,
            validation: config.validation.clone(),
            update_agents_on_complete: config.update_agents_on_complete,
            memory_enabled: settings.memory_enabled,
            recovery: RecoveryPolicy::Ask,
            replan: false,
            dry_run: false,
            goal: None,
            references: Vec::new(),
            echo: true,
        }
    }
}

/// The prompt a dry run would have sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunPreview {
    pub phase: Phase,
    pub task: Option<String>,
    pub prompt: String,
}

/// Terminal result of [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct LoopReport {
    pub status: LoopStatus,
    /// Iterations run by this invocation (the agents-updater pass excluded).
    pub iterations: u32,
    /// Most recent checkpoint written or resumed from.
    pub last_checkpoint: Option<Checkpoint>,
    pub preview: Option<DryRunPreview>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryChoice {
    Resume,
    Fresh,
    Replan,
}

enum Recovery {
    Resume(Checkpoint),
    Fresh { replan: bool },
    Cancelled,
}

pub struct Orchestrator<'a, A, V, M> {
    project: RalphPaths,
    session: Session,
    config: OrchestratorConfig,
    agent: &'a A,
    validator: &'a V,
    menu: &'a M,
    cancel: CancelToken,
    checkpoints: CheckpointManager,
    state: LoopState,
    iterations: u32,
    last_checkpoint: Option<Checkpoint>,
}

impl<'a, A: AgentRunner, V: ValidationRunner, M: Menu> Orchestrator<'a, A, V, M> {
    pub fn new(
        project: RalphPaths,
        session: Session,
        config: OrchestratorConfig,
        agent: &'a A,
        validator: &'a V,
        menu: &'a M,
        cancel: CancelToken,
    ) -> Self {
        let checkpoints = CheckpointManager::new(&session.paths.checkpoint_path);
        Self {
            project,
            session,
            config,
            agent,
            validator,
            menu,
            cancel,
            checkpoints,
            state: LoopState::Idle,
            iterations: 0,
            last_checkpoint: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Drive the loop until it completes, hits a cap, is cancelled or fails
    /// fatally. `Err` is reserved for unexpected local I/O failures.
    pub fn run(&mut self) -> Result<LoopReport> {
        let budget = RunBudget::new(self.config.max_iterations, self.config.max_runtime);

        let (resume, replan) = match self.recover()? {
            Recovery::Resume(checkpoint) => (Some(checkpoint), self.config.replan),
            Recovery::Fresh { replan } => (None, replan || self.config.replan),
            Recovery::Cancelled => {
                self.transition(LoopState::Cancelled);
                return Ok(self.report(LoopStatus::Cancelled));
            }
        };

        let mut phase = self.start_phase(resume.as_ref(), replan);
        if self.config.dry_run {
            return self.preview(phase, &budget);
        }

        let mut number = next_iteration_number(&self.session.paths);
        if let Some(checkpoint) = &resume {
            number = number.max(checkpoint.iteration.saturating_add(1));
        }
        // Task handed out again when the plan emptied without a completion signal.
        let mut confirm: Option<Task> = None;

        self.transition(LoopState::Running(phase));
        loop {
            if self.cancel.is_cancelled() {
                return self.stop_cancelled(phase, number.saturating_sub(1), None);
            }

            let task = if phase == Phase::Building {
                let plan = load_plan(&self.session.paths.plan_path);
                let retry = confirm.take();
                match plan.next_pending().cloned().or(retry) {
                    Some(task) => Some(task),
                    None => {
                        info!(total = plan.stats().total, "no pending tasks");
                        return self.complete(phase, number, &budget);
                    }
                }
            } else {
                None
            };

            if let Some(reason) = budget.exhausted(self.iterations) {
                info!(%reason, "stopping");
                let pending = load_plan(&self.session.paths.plan_path).stats().pending;
                self.save_checkpoint(phase, number.saturating_sub(1), task.as_ref(), pending, None)?;
                return Ok(self.report(LoopStatus::Incomplete(reason)));
            }

            let plan = IterationPlan {
                number,
                phase,
                role: phase.role(),
                task: task.clone(),
            };
            info!(iteration = number, %phase, task = task.as_ref().map(|t| t.text.as_str()), "starting iteration");
            let outcome = match run_iteration(&self.env(&budget), self.agent, self.validator, &plan) {
                Ok(outcome) => outcome,
                Err(err) => return self.stop_on_error(err, phase, number, task.as_ref()),
            };
            self.iterations += 1;
            self.save_checkpoint(
                phase,
                number,
                task.as_ref(),
                outcome.plan_after.pending,
                outcome.error.clone(),
            )?;
            number += 1;

            if outcome.cancelled() || self.cancel.is_cancelled() {
                return self.stop_cancelled(phase, outcome.number, task.as_ref());
            }

            match self.after_iteration(phase, &outcome) {
                Next::Stay => {}
                Next::Confirm(task) => confirm = Some(task),
                Next::Advance(next) => {
                    // Checkpoint the new phase before its first iteration runs.
                    self.save_checkpoint(next, outcome.number, None, outcome.plan_after.pending, None)?;
                    phase = next;
                    self.transition(LoopState::Running(phase));
                }
                Next::Complete => return self.complete(phase, number, &budget),
            }
        }
    }

    fn env<'b>(&'b self, budget: &'b RunBudget) -> IterationEnv<'b> {
        IterationEnv {
            project: &self.project,
            session: &self.session,
            config: &self.config,
            budget,
        }
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "state change");
            self.state = next;
        }
    }

    fn recover(&mut self) -> Result<Recovery> {
        let Some(checkpoint) = self.checkpoints.load() else {
            return Ok(Recovery::Fresh { replan: false });
        };
        self.transition(LoopState::Recovering);
        self.last_checkpoint = Some(checkpoint.clone());

        let policy = match self.config.recovery {
            RecoveryPolicy::Ask if self.config.dry_run => RecoveryPolicy::Resume,
            policy => policy,
        };
        let choice = match policy {
            RecoveryPolicy::Resume => RecoveryChoice::Resume,
            RecoveryPolicy::Fresh => RecoveryChoice::Fresh,
            RecoveryPolicy::Ask => {
                let title = format!(
                    "Found a checkpoint for session '{}': {} phase, iteration {}, {} pending task(s).",
                    self.session.meta.id,
                    checkpoint.phase,
                    checkpoint.iteration,
                    checkpoint.pending_count
                );
                match self.menu.choose(&title, &self.recovery_options())? {
                    MenuChoice::Selected(choice) => choice,
                    MenuChoice::Cancelled => return Ok(Recovery::Cancelled),
                }
            }
        };

        debug!(?choice, "recovery decided");
        match choice {
            RecoveryChoice::Resume => {
                info!(phase = %checkpoint.phase, iteration = checkpoint.iteration, "resuming from checkpoint");
                Ok(Recovery::Resume(checkpoint))
            }
            RecoveryChoice::Fresh | RecoveryChoice::Replan => {
                if !self.config.dry_run {
                    self.checkpoints.clear()?;
                    clear_feedback(&self.session.paths.feedback_path)?;
                }
                Ok(Recovery::Fresh {
                    replan: choice == RecoveryChoice::Replan,
                })
            }
        }
    }

    fn recovery_options(&self) -> Vec<MenuOption<RecoveryChoice>> {
        let replan = MenuOption::new("Discard it and re-plan", RecoveryChoice::Replan).hotkey('p');
        let replan = if has_specs(&self.session.paths.specs_dir) {
            replan
        } else {
            replan.disabled("no specs yet")
        };
        vec![
            MenuOption::new("Resume where it stopped", RecoveryChoice::Resume).hotkey('r'),
            MenuOption::new("Discard it and start fresh", RecoveryChoice::Fresh).hotkey('f'),
            replan,
        ]
    }

    fn start_phase(&self, resume: Option<&Checkpoint>, replan: bool) -> Phase {
        let derived = match self.config.mode {
            LoopMode::Spec => Phase::SpecCreation,
            LoopMode::Plan => Phase::Planning,
            LoopMode::Build => Phase::Building,
            LoopMode::Auto => {
                if !has_specs(&self.session.paths.specs_dir) {
                    Phase::SpecCreation
                } else if replan || !load_plan(&self.session.paths.plan_path).has_tasks() {
                    Phase::Planning
                } else {
                    Phase::Building
                }
            }
        };
        match resume {
            Some(checkpoint) if !replan && self.config.mode.allows(checkpoint.phase) => {
                checkpoint.phase
            }
            Some(checkpoint) => {
                debug!(checkpoint = %checkpoint.phase, start = %derived, "checkpoint phase not used");
                derived
            }
            None => derived,
        }
    }

    fn after_iteration(&self, phase: Phase, outcome: &IterationOutcome) -> Next {
        match phase {
            Phase::SpecCreation | Phase::Planning if !outcome.sentinel_seen => Next::Stay,
            Phase::SpecCreation if !has_specs(&self.session.paths.specs_dir) => {
                warn!("spec creation signalled completion but no spec files exist; repeating");
                Next::Stay
            }
            Phase::Planning if outcome.plan_after.total == 0 => {
                warn!("planning signalled completion but the plan has no tasks; repeating");
                Next::Stay
            }
            Phase::SpecCreation | Phase::Planning => match phase.next() {
                Some(next) if self.config.mode.allows(next) => Next::Advance(next),
                _ => Next::Complete,
            },
            Phase::Building => {
                let pending = outcome.plan_after.pending;
                match (pending, outcome.sentinel_seen) {
                    (0, _) if outcome.validation == ValidationOutcome::Fail => {
                        warn!("plan is empty but validation failed; asking for a fix");
                        outcome.task.clone().map_or(Next::Complete, Next::Confirm)
                    }
                    (0, true) => Next::Complete,
                    (0, false) => {
                        info!("plan has no pending tasks but completion was not signalled; asking again");
                        outcome.task.clone().map_or(Next::Complete, Next::Confirm)
                    }
                    (_, true) => {
                        debug!(pending, "completion signalled with tasks pending; continuing");
                        Next::Stay
                    }
                    (_, false) => Next::Stay,
                }
            }
        }
    }

    fn complete(&mut self, phase: Phase, number: u32, budget: &RunBudget) -> Result<LoopReport> {
        self.transition(LoopState::Complete);
        self.checkpoints.clear()?;
        clear_feedback(&self.session.paths.feedback_path)?;
        if phase == Phase::Building && self.config.update_agents_on_complete && self.iterations > 0 {
            self.update_agents(number, budget);
        }
        Ok(self.report(LoopStatus::Complete))
    }

    /// One agents-updater pass; failures are logged and never change the status.
    fn update_agents(&self, number: u32, budget: &RunBudget) {
        let plan = IterationPlan {
            number,
            phase: Phase::Building,
            role: AgentRole::AgentsUpdater,
            task: None,
        };
        match run_iteration(&self.env(budget), self.agent, self.validator, &plan) {
            Ok(outcome) if outcome.sentinel_seen => info!("agents file updated"),
            Ok(_) => warn!("agents updater finished without signalling completion"),
            Err(err) => warn!(err = %format!("{err:#}"), "agents updater failed"),
        }
    }

    fn stop_cancelled(&mut self, phase: Phase, iteration: u32, task: Option<&Task>) -> Result<LoopReport> {
        let pending = load_plan(&self.session.paths.plan_path).stats().pending;
        self.save_checkpoint(phase, iteration, task, pending, None)?;
        self.transition(LoopState::Cancelled);
        Ok(self.report(LoopStatus::Cancelled))
    }

    fn stop_on_error(
        &mut self,
        err: anyhow::Error,
        phase: Phase,
        number: u32,
        task: Option<&Task>,
    ) -> Result<LoopReport> {
        let reason = if let Some(fatal) = err.downcast_ref::<FatalAgentError>() {
            fatal.reason.clone()
        } else if let Some(prompt) = err.downcast_ref::<PromptError>() {
            prompt.to_string()
        } else {
            return Err(err);
        };
        warn!(%reason, "fatal error, stopping");
        let pending = load_plan(&self.session.paths.plan_path).stats().pending;
        self.save_checkpoint(
            phase,
            number.saturating_sub(1),
            task,
            pending,
            Some(reason.clone()),
        )?;
        Ok(self.report(LoopStatus::Fatal(reason)))
    }

    fn save_checkpoint(
        &mut self,
        phase: Phase,
        iteration: u32,
        task: Option<&Task>,
        pending: usize,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut checkpoint = Checkpoint::now(phase, iteration, pending);
        checkpoint.active_task_id = task.map(|task| task.ordinal);
        checkpoint.active_task = task.map(|task| task.text.clone());
        checkpoint.last_error = last_error;
        self.checkpoints.save(&checkpoint)?;
        self.last_checkpoint = Some(checkpoint);
        Ok(())
    }

    fn preview(&mut self, phase: Phase, budget: &RunBudget) -> Result<LoopReport> {
        let task = match phase {
            Phase::Building => {
                let plan = load_plan(&self.session.paths.plan_path);
                match plan.next_pending().cloned() {
                    Some(task) => Some(task),
                    None => return Ok(self.report(LoopStatus::Complete)),
                }
            }
            _ => None,
        };
        let prompt = match build_prompt(&self.env(budget), phase.role(), task.as_ref()) {
            Ok(prompt) => prompt,
            Err(err) => {
                return match err.downcast_ref::<PromptError>() {
                    Some(prompt_err) => Ok(self.report(LoopStatus::Fatal(prompt_err.to_string()))),
                    None => Err(err),
                };
            }
        };
        let mut report = self.report(LoopStatus::Complete);
        report.preview = Some(DryRunPreview {
            phase,
            task: task.map(|task| task.text),
            prompt: prompt.render(),
        });
        Ok(report)
    }

    fn report(&self, status: LoopStatus) -> LoopReport {
        LoopReport {
            status,
            iterations: self.iterations,
            last_checkpoint: self.last_checkpoint.clone(),
            preview: None,
        }
    }
}

enum Next {
    Stay,
    Confirm(Task),
    Advance(Phase),
    Complete,
}
