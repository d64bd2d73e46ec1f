//! A single iteration of the loop.
//!
//! One iteration builds the prompt for a role, runs the agent, checks for
//! the role's sentinel, runs validation (building only), reconciles the plan
//! and records the result in the progress log and the iteration directory.
//! Problems confined to the iteration are logged and summarized; only
//! [`FatalAgentError`] and [`PromptError`] escape to the orchestrator.

use std::time::Instant;

use anyhow::Result;
use chrono::Local;
use tracing::{debug, info, warn};

use crate::core::budget::RunBudget;
use crate::core::plan::{PlanStats, Task};
use crate::core::signal;
use crate::core::types::{AgentRole, Phase, ValidationOutcome};
use crate::io::agent::{AgentRequest, AgentRun, AgentRunStatus, AgentRunner, FatalAgentError};
use crate::io::git::Git;
use crate::io::iteration_log::{IterationMeta, IterationPaths};
use crate::io::memory::load_memory;
use crate::io::paths::RalphPaths;
use crate::io::plan_store::{load_plan, write_plan};
use crate::io::progress::{ProgressEntry, append_entry};
use crate::io::prompt::{PromptBuilder, PromptInputs, PromptPack, load_base_prompt};
use crate::io::session::Session;
use crate::io::validation::{
    ValidationReport, ValidationRequest, ValidationRunner, read_feedback, write_feedback,
};
use crate::orchestrator::OrchestratorConfig;

/// Everything an iteration reads but does not own.
#[derive(Debug, Clone, Copy)]
pub struct IterationEnv<'a> {
    pub project: &'a RalphPaths,
    pub session: &'a Session,
    pub config: &'a OrchestratorConfig,
    pub budget: &'a RunBudget,
}

/// What to run in one iteration.
#[derive(Debug, Clone)]
pub struct IterationPlan {
    /// Session-wide iteration number (names the iteration directory).
    pub number: u32,
    pub phase: Phase,
    pub role: AgentRole,
    /// Assigned task; required for the building role.
    pub task: Option<Task>,
}

/// Result of one iteration.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub number: u32,
    pub phase: Phase,
    pub role: AgentRole,
    pub task: Option<Task>,
    pub agent_status: AgentRunStatus,
    pub sentinel_seen: bool,
    pub validation: ValidationOutcome,
    pub task_marked_done: bool,
    /// Plan statistics after the plan was re-read at the end of the iteration.
    pub plan_after: PlanStats,
    /// Contained error: the agent could not be run, or the plan could not be saved.
    pub error: Option<String>,
}

impl IterationOutcome {
    pub fn cancelled(&self) -> bool {
        self.agent_status == AgentRunStatus::Cancelled
    }
}

/// Compose the prompt for `role` from the session's current files.
pub fn build_prompt(env: &IterationEnv<'_>, role: AgentRole, task: Option<&Task>) -> Result<PromptPack> {
    let paths = &env.session.paths;
    let feedback = match role {
        AgentRole::Building => read_feedback(&paths.feedback_path),
        _ => None,
    };
    let memory = if env.config.memory_enabled {
        load_memory(&env.project.memory_path).prompt_text()
    } else {
        None
    };
    let goal = match role {
        AgentRole::SpecCreation | AgentRole::Planning => env.config.goal.clone(),
        _ => None,
    };

    let inputs = PromptInputs {
        role,
        base_prompt: load_base_prompt(env.project, role)?,
        task: task.map(|task| task.text.clone()),
        goal,
        feedback,
        memory,
        references: env.config.references.clone(),
        specs_dir: display_relative(env.project, &paths.specs_dir),
        plan_path: display_relative(env.project, &paths.plan_path),
        progress_path: display_relative(env.project, &paths.progress_path),
    };
    PromptBuilder::new(env.config.prompt_budget_bytes).build(&inputs)
}

/// Run one iteration end to end.
pub fn run_iteration<A: AgentRunner, V: ValidationRunner>(
    env: &IterationEnv<'_>,
    agent: &A,
    validator: &V,
    plan: &IterationPlan,
) -> Result<IterationOutcome> {
    let started_at = Local::now();
    let started = Instant::now();
    let session_paths = &env.session.paths;

    let prompt = build_prompt(env, plan.role, plan.task.as_ref())?;
    if !prompt.dropped().is_empty() {
        info!(dropped = ?prompt.dropped(), "prompt sections dropped to fit the budget");
    }
    let log = IterationPaths::new(session_paths, plan.number);
    contain(log.write_prompt(prompt.as_str()), "write iteration prompt");

    let request = AgentRequest {
        workdir: env.project.root.clone(),
        role: plan.role,
        prompt: prompt.render(),
        model: env.config.model.clone(),
        timeout: env.budget.agent_timeout(env.config.iteration_timeout),
        output_limit_bytes: env.config.agent_output_limit_bytes,
        log_path: Some(log.agent_log_path.clone()),
        echo: env.config.echo,
    };
    let git = Git::new(&env.project.root);
    let before = git.snapshot();
    let mut error = None;
    let run = match agent.run(&request) {
        Ok(run) => run,
        Err(err) if err.downcast_ref::<FatalAgentError>().is_some() => return Err(err),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "agent run failed");
            error = Some(format!("agent could not run: {err:#}"));
            AgentRun {
                output: String::new(),
                exit_code: None,
                status: AgentRunStatus::Failed { exit_code: None },
            }
        }
    };
    let sentinel_seen = signal::detect(&run.output, plan.role);
    if !sentinel_seen {
        let foreign = signal::detect_any(&run.output);
        if !foreign.is_empty() {
            warn!(role = %plan.role, ?foreign, "agent emitted another role's completion signal; ignoring it");
        }
    }
    debug!(sentinel_seen, status = %run.status, "agent finished");

    let report = if plan.role == AgentRole::Building && run.status != AgentRunStatus::Cancelled {
        validate(env, validator)
    } else {
        ValidationReport::skipped()
    };
    // An interrupted validation pass says nothing about the code.
    let cancelled = run.status == AgentRunStatus::Cancelled || report.cancelled;

    // Re-read: the agent (or a human) may have edited the plan meanwhile.
    let mut task_plan = load_plan(&session_paths.plan_path);
    let mut task_marked_done = false;
    if let Some(task) = &plan.task
        && plan.role == AgentRole::Building
        && sentinel_seen
        && !cancelled
        && report.outcome != ValidationOutcome::Fail
        && task_plan.mark_done_text(&task.text)
    {
        match write_plan(&session_paths.plan_path, &task_plan) {
            Ok(()) => {
                task_marked_done = true;
                info!(task = %task.text, "task marked done");
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not save the plan");
                error = Some(format!("task done but the plan could not be saved: {err:#}"));
                task_plan = load_plan(&session_paths.plan_path);
            }
        }
    }
    let plan_after = task_plan.stats();

    let feedback = report.feedback();
    if plan.role == AgentRole::Building && !cancelled {
        contain(
            write_feedback(&session_paths.feedback_path, feedback.as_deref()),
            "write feedback",
        );
    }

    let outcome = IterationOutcome {
        number: plan.number,
        phase: plan.phase,
        role: plan.role,
        task: plan.task.clone(),
        agent_status: run.status,
        sentinel_seen,
        validation: report.outcome,
        task_marked_done,
        plan_after,
        error,
    };

    let ended_at = Local::now();
    contain(
        append_entry(
            &session_paths.progress_path,
            &ProgressEntry {
                timestamp: ended_at.to_rfc3339(),
                iteration: plan.number,
                phase: plan.phase,
                task: plan.task.as_ref().map(|task| task.text.clone()),
                outcome: describe(&outcome),
                files_touched: git.touched_since(&before),
                learnings: feedback,
            },
        ),
        "append progress entry",
    );

    let meta = IterationMeta {
        session_id: env.session.meta.id.clone(),
        iteration: plan.number,
        phase: plan.phase,
        role: plan.role,
        task_id: plan.task.as_ref().map(|task| task.ordinal),
        task: plan.task.as_ref().map(|task| task.text.clone()),
        agent_status: run.status,
        exit_code: run.exit_code,
        sentinel_seen,
        validation: report.outcome,
        task_marked_done,
        pending_after: plan_after.pending,
        prompt_bytes: prompt.as_str().len(),
        dropped_sections: prompt.dropped().to_vec(),
        started_at: started_at.to_rfc3339(),
        ended_at: ended_at.to_rfc3339(),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    let validation_log = (!report.checks.is_empty()).then(|| report.render_log());
    contain(
        log.write_outcome(&meta, validation_log.as_deref()),
        "write iteration meta",
    );

    Ok(outcome)
}

fn validate<V: ValidationRunner>(env: &IterationEnv<'_>, validator: &V) -> ValidationReport {
    if env.config.validation.is_empty() {
        return ValidationReport::skipped();
    }
    let request = ValidationRequest {
        workdir: env.project.root.clone(),
        commands: env.config.validation.clone(),
        output_limit_bytes: env.config.validation_output_limit_bytes,
    };
    match validator.run(&request) {
        Ok(report) => {
            if report.outcome == ValidationOutcome::Fail {
                let failed: Vec<&str> = report
                    .checks
                    .iter()
                    .filter(|check| !check.passed)
                    .map(|check| check.name.as_str())
                    .collect();
                warn!(?failed, "validation failed; feeding output into the next prompt");
            }
            report
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "validation could not run");
            ValidationReport::skipped()
        }
    }
}

/// One-line summary for the progress log.
fn describe(outcome: &IterationOutcome) -> String {
    if let Some(err) = &outcome.error {
        return err.clone();
    }
    let agent = match outcome.agent_status {
        AgentRunStatus::Cancelled => return "cancelled by user".to_string(),
        AgentRunStatus::TimedOut => "agent timed out".to_string(),
        status => format!("agent {status}"),
    };
    let signal = if outcome.sentinel_seen {
        "completion signalled"
    } else {
        "no completion signal"
    };
    let mut summary = format!("{agent}; {signal}");
    match outcome.validation {
        ValidationOutcome::Pass => summary.push_str("; validation passed"),
        ValidationOutcome::Fail => summary.push_str("; validation failed"),
        ValidationOutcome::Skipped => {}
    }
    if outcome.task_marked_done {
        summary.push_str("; task marked done");
    }
    summary.push_str(&format!("; {} pending", outcome.plan_after.pending));
    summary
}

fn display_relative(project: &RalphPaths, path: &std::path::Path) -> String {
    path.strip_prefix(&project.root)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn contain(result: Result<()>, what: &str) {
    if let Err(err) = result {
        warn!(err = %format!("{err:#}"), "{what} failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{LoopMode, SpecsMode};
    use crate::io::config::ValidationCommand;
    use crate::io::validation::CheckResult;
    use crate::test_support::{ScriptedRun, ScriptedValidator, TestProject};
    use std::fs;

    fn first_task(project: &TestProject) -> Task {
        load_plan(&project.session().paths.plan_path)
            .next_pending()
            .cloned()
            .expect("pending task")
    }

    #[test]
    fn sentinel_and_passing_validation_mark_the_task_done() {
        let project = TestProject::with_plan("- [ ] add parser\n- [ ] add printer\n");
        let session = project.session();
        let config = OrchestratorConfig {
            validation: vec![ValidationCommand {
                name: "tests".to_string(),
                command: vec!["true".to_string()],
                timeout_secs: 5,
            }],
            ..project.config()
        };
        let budget = RunBudget::unlimited();
        let env = IterationEnv {
            project: project.paths(),
            session: &session,
            config: &config,
            budget: &budget,
        };
        let agent = project.agent(vec![ScriptedRun::output(format!(
            "done {}",
            signal::TASK_COMPLETE
        ))]);
        let validator = ScriptedValidator::passing();

        let outcome = run_iteration(
            &env,
            &agent,
            &validator,
            &IterationPlan {
                number: 1,
                phase: Phase::Building,
                role: AgentRole::Building,
                task: Some(first_task(&project)),
            },
        )
        .expect("iteration");

        assert!(outcome.sentinel_seen);
        assert!(outcome.task_marked_done);
        assert_eq!(outcome.validation, ValidationOutcome::Pass);
        assert_eq!(outcome.plan_after.pending, 1);
        let plan = fs::read_to_string(&session.paths.plan_path).expect("plan");
        assert!(plan.contains("- [x] add parser"));

        let prompt = &agent.requests()[0].prompt;
        assert!(prompt.contains("## YOUR ASSIGNED TASK\n\nadd parser"));
        let log = IterationPaths::new(&session.paths, 1);
        assert!(log.meta_path.is_file());
        assert!(log.prompt_path.is_file());
        let progress = fs::read_to_string(&session.paths.progress_path).expect("progress");
        assert!(progress.contains("| iteration 1"));
        assert!(progress.contains("task marked done"));
    }

    #[test]
    fn failing_validation_keeps_task_pending_and_feeds_back() {
        let project = TestProject::with_plan("- [ ] add parser\n");
        let session = project.session();
        let config = OrchestratorConfig {
            validation: vec![ValidationCommand {
                name: "tests".to_string(),
                command: vec!["false".to_string()],
                timeout_secs: 5,
            }],
            ..project.config()
        };
        let budget = RunBudget::unlimited();
        let env = IterationEnv {
            project: project.paths(),
            session: &session,
            config: &config,
            budget: &budget,
        };
        let agent = project.agent(vec![ScriptedRun::output(signal::TASK_COMPLETE)]);
        let validator = ScriptedValidator::new(vec![ValidationReport::from_checks(vec![
            CheckResult {
                name: "tests".to_string(),
                passed: false,
                exit_code: Some(101),
                output: "test parser::empty ... FAILED".to_string(),
            },
        ])]);

        let outcome = run_iteration(
            &env,
            &agent,
            &validator,
            &IterationPlan {
                number: 1,
                phase: Phase::Building,
                role: AgentRole::Building,
                task: Some(first_task(&project)),
            },
        )
        .expect("iteration");

        assert!(!outcome.task_marked_done);
        assert_eq!(outcome.plan_after.pending, 1);
        let feedback = read_feedback(&session.paths.feedback_path).expect("feedback");
        assert!(feedback.contains("parser::empty"));

        let prompt = build_prompt(&env, AgentRole::Building, Some(&first_task(&project)))
            .expect("prompt");
        assert!(prompt.as_str().contains("## Feedback from the previous iteration"));
        assert!(prompt.as_str().contains("parser::empty"));
    }

    #[test]
    fn interrupted_validation_leaves_task_and_feedback_alone() {
        let project = TestProject::with_plan("- [ ] add parser\n");
        let session = project.session();
        fs::write(&session.paths.feedback_path, "earlier failure\n").expect("feedback");
        let config = OrchestratorConfig {
            validation: vec![ValidationCommand {
                name: "tests".to_string(),
                command: vec!["cargo".to_string(), "test".to_string()],
                timeout_secs: 5,
            }],
            ..project.config()
        };
        let budget = RunBudget::unlimited();
        let env = IterationEnv {
            project: project.paths(),
            session: &session,
            config: &config,
            budget: &budget,
        };
        let agent = project.agent(vec![ScriptedRun::output(signal::TASK_COMPLETE)]);
        let validator = ScriptedValidator::new(vec![ValidationReport::interrupted(vec![
            CheckResult {
                name: "tests".to_string(),
                passed: false,
                exit_code: None,
                output: "terminated".to_string(),
            },
        ])]);

        let outcome = run_iteration(
            &env,
            &agent,
            &validator,
            &IterationPlan {
                number: 1,
                phase: Phase::Building,
                role: AgentRole::Building,
                task: Some(first_task(&project)),
            },
        )
        .expect("iteration");

        assert!(!outcome.task_marked_done);
        assert_eq!(outcome.validation, ValidationOutcome::Skipped);
        assert_eq!(
            fs::read_to_string(&session.paths.feedback_path).expect("feedback"),
            "earlier failure\n"
        );
    }

    #[test]
    fn plan_save_failure_is_recorded_not_raised() {
        let project = TestProject::with_plan("- [ ] add parser\n");
        let session = project.session();
        let config = project.config();
        let budget = RunBudget::unlimited();
        let env = IterationEnv {
            project: project.paths(),
            session: &session,
            config: &config,
            budget: &budget,
        };
        // A directory squatting on the temp name makes the plan write fail.
        let plan_rel = session
            .paths
            .plan_path
            .strip_prefix(project.root())
            .expect("plan inside project")
            .to_path_buf();
        let mut blocker = plan_rel.into_os_string();
        blocker.push(".tmp");
        let blocker = std::path::PathBuf::from(blocker).join("keep");
        let agent = project.agent(vec![
            ScriptedRun::output(signal::TASK_COMPLETE).writes_file(blocker, ""),
        ]);

        let outcome = run_iteration(
            &env,
            &agent,
            &ScriptedValidator::passing(),
            &IterationPlan {
                number: 1,
                phase: Phase::Building,
                role: AgentRole::Building,
                task: Some(first_task(&project)),
            },
        )
        .expect("iteration");

        assert!(outcome.sentinel_seen);
        assert!(!outcome.task_marked_done);
        assert_eq!(outcome.plan_after.pending, 1);
        assert!(
            outcome
                .error
                .as_deref()
                .is_some_and(|err| err.contains("plan could not be saved"))
        );
        let progress = fs::read_to_string(&session.paths.progress_path).expect("progress");
        assert!(progress.contains("plan could not be saved"));
    }

    #[test]
    fn fatal_agent_error_escapes() {
        let project = TestProject::with_plan("- [ ] add parser\n");
        let session = project.session();
        let config = project.config();
        let budget = RunBudget::unlimited();
        let env = IterationEnv {
            project: project.paths(),
            session: &session,
            config: &config,
            budget: &budget,
        };
        let agent = project.agent(vec![ScriptedRun::fatal("agent binary 'claude' not found")]);

        let err = run_iteration(
            &env,
            &agent,
            &ScriptedValidator::passing(),
            &IterationPlan {
                number: 1,
                phase: Phase::Building,
                role: AgentRole::Building,
                task: Some(first_task(&project)),
            },
        )
        .unwrap_err();
        assert!(err.downcast_ref::<FatalAgentError>().is_some());
    }

    #[test]
    fn planning_prompt_carries_goal_and_no_task() {
        let project = TestProject::new();
        let session = project.session();
        let config = OrchestratorConfig {
            goal: Some("a tiny todo CLI".to_string()),
            mode: LoopMode::Plan,
            ..project.config()
        };
        let budget = RunBudget::unlimited();
        let env = IterationEnv {
            project: project.paths(),
            session: &session,
            config: &config,
            budget: &budget,
        };
        assert_eq!(session.meta.specs_mode, SpecsMode::Shared);

        let prompt = build_prompt(&env, AgentRole::Planning, None).expect("prompt");
        assert!(prompt.as_str().contains("a tiny todo CLI"));
        assert!(!prompt.as_str().contains("YOUR ASSIGNED TASK"));
        assert!(prompt.as_str().contains(signal::PLAN_COMPLETE));
    }
}
