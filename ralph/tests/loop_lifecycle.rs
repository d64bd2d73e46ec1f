//! Loop-level tests that drive the orchestrator across several iterations.
//!
//! Each test scripts the agent's behaviour per iteration and checks what the
//! loop leaves behind on disk: plan, checkpoint, iteration logs.

use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};

use ralph::core::signal;
use ralph::core::types::{AgentRole, IncompleteReason, LoopMode, LoopStatus, Phase};
use ralph::io::checkpoint::CheckpointManager;
use ralph::io::config::ValidationCommand;
use ralph::io::interrupt::CancelToken;
use ralph::io::plan_store::load_plan;
use ralph::io::validation::{CheckResult, ValidationReport};
use ralph::orchestrator::{Orchestrator, OrchestratorConfig, RecoveryPolicy};
use ralph::test_support::{ScriptedMenu, ScriptedRun, ScriptedValidator, TestProject};

const THREE_TASKS: &str = "# Plan\n\n- [ ] add parser\n- [ ] add evaluator\n- [ ] wire cli\n";

/// Resuming a building checkpoint goes straight back to building.
///
/// No spec or planning iteration runs, and iteration numbering continues
/// after the checkpointed iteration.
#[test]
fn resume_from_building_checkpoint_skips_spec_and_plan() {
    let project = TestProject::with_plan("- [x] add parser\n- [ ] add evaluator\n- [ ] wire cli\n");
    project.write_checkpoint(Phase::Building, 3, 2);
    let agent = project.agent(vec![
        ScriptedRun::output(signal::TASK_COMPLETE),
        ScriptedRun::output(signal::TASK_COMPLETE),
    ]);
    let validator = ScriptedValidator::passing();
    let menu = ScriptedMenu::new(&["r"]);
    let config = OrchestratorConfig {
        recovery: RecoveryPolicy::Ask,
        ..project.config()
    };

    let report = Orchestrator::new(
        project.paths().clone(),
        project.session(),
        config,
        &agent,
        &validator,
        &menu,
        CancelToken::new(),
    )
    .run()
    .expect("run");

    assert_eq!(report.status, LoopStatus::Complete);
    assert_eq!(report.iterations, 2);
    assert_eq!(menu.titles().len(), 1);
    let requests = agent.requests();
    assert!(requests.iter().all(|r| r.role == AgentRole::Building));
    assert!(requests[0].prompt.contains("add evaluator"));
    assert!(requests[1].prompt.contains("wire cli"));

    let session = project.session();
    assert!(session.paths.iteration_dir(4).join("prompt.md").exists());
    assert!(session.paths.iteration_dir(5).join("agent.log").exists());
    assert!(!session.paths.iteration_dir(1).exists());
    assert!(!CheckpointManager::new(&session.paths.checkpoint_path).exists());
}

/// The agent ticks its own checkbox every time but only signals on the
/// last task. Each iteration moves to the next task and the loop ends
/// after exactly three iterations.
#[test]
fn agent_ticking_boxes_completes_after_one_iteration_per_task() {
    let project = TestProject::with_plan(THREE_TASKS);
    let agent = project.agent(vec![
        ScriptedRun::output("did the parser").completes_next_task(),
        ScriptedRun::output("did the evaluator").completes_next_task(),
        ScriptedRun::output(format!("wired it up\n{}", signal::TASK_COMPLETE)).completes_next_task(),
    ]);
    let validator = ScriptedValidator::passing();
    let config = OrchestratorConfig {
        validation: vec![ValidationCommand {
            name: "tests".to_string(),
            command: vec!["true".to_string()],
            timeout_secs: 5,
        }],
        ..project.config()
    };

    let report = Orchestrator::new(
        project.paths().clone(),
        project.session(),
        config,
        &agent,
        &validator,
        &ScriptedMenu::new(&[]),
        CancelToken::new(),
    )
    .run()
    .expect("run");

    assert_eq!(report.status, LoopStatus::Complete);
    assert_eq!(report.iterations, 3);
    assert_eq!(validator.calls(), 3);
    let stats = load_plan(&project.session().paths.plan_path).stats();
    assert_eq!((stats.pending, stats.completed), (0, 3));
}

/// A nonzero agent exit is not fatal: the completion signal still counts.
#[test]
fn nonzero_agent_exit_with_signal_still_progresses() {
    let project = TestProject::with_plan("- [ ] first\n- [ ] second\n");
    let agent = project.agent(vec![
        ScriptedRun::output(signal::TASK_COMPLETE).exit_code(1),
        ScriptedRun::output(signal::TASK_COMPLETE).exit_code(1),
    ]);
    let validator = ScriptedValidator::passing();

    let report = Orchestrator::new(
        project.paths().clone(),
        project.session(),
        project.config(),
        &agent,
        &validator,
        &ScriptedMenu::new(&[]),
        CancelToken::new(),
    )
    .run()
    .expect("run");

    assert_eq!(report.status, LoopStatus::Complete);
    assert_eq!(report.iterations, 2);
    assert_eq!(load_plan(&project.session().paths.plan_path).stats().pending, 0);
}

#[test]
fn iteration_cap_stops_with_remaining_tasks_checkpointed() {
    let project = TestProject::with_plan("- [ ] a\n- [ ] b\n- [ ] c\n- [ ] d\n- [ ] e\n");
    let agent = project.agent(vec![
        ScriptedRun::output(signal::TASK_COMPLETE),
        ScriptedRun::output(signal::TASK_COMPLETE),
    ]);
    let validator = ScriptedValidator::passing();
    let config = OrchestratorConfig {
        mode: LoopMode::Build,
        max_iterations: Some(2),
        ..project.config()
    };

    let report = Orchestrator::new(
        project.paths().clone(),
        project.session(),
        config,
        &agent,
        &validator,
        &ScriptedMenu::new(&[]),
        CancelToken::new(),
    )
    .run()
    .expect("run");

    assert_eq!(
        report.status,
        LoopStatus::Incomplete(IncompleteReason::IterationLimit { iterations: 2 })
    );
    let checkpoint = CheckpointManager::new(&project.session().paths.checkpoint_path)
        .load()
        .expect("checkpoint kept");
    assert_eq!(checkpoint.phase, Phase::Building);
    assert_eq!(checkpoint.iteration, 2);
    assert_eq!(checkpoint.pending_count, 3);
    assert_eq!(checkpoint.active_task.as_deref(), Some("c"));
}

/// Signalling completion while tasks remain just moves on to the next task.
#[test]
fn completion_signal_with_pending_tasks_continues() {
    let project = TestProject::with_plan("- [ ] tokenize input\n- [ ] render output\n");
    let agent = project.agent(vec![
        ScriptedRun::output(signal::TASK_COMPLETE),
        ScriptedRun::output(signal::TASK_COMPLETE),
    ]);
    let validator = ScriptedValidator::passing();

    let report = Orchestrator::new(
        project.paths().clone(),
        project.session(),
        project.config(),
        &agent,
        &validator,
        &ScriptedMenu::new(&[]),
        CancelToken::new(),
    )
    .run()
    .expect("run");

    assert_eq!(report.status, LoopStatus::Complete);
    let requests = agent.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].prompt.contains("tokenize input"));
    assert!(requests[1].prompt.contains("render output"));

    let progress =
        fs::read_to_string(&project.session().paths.progress_path).expect("progress log");
    assert!(progress.contains("tokenize input"));
    assert!(progress.contains("render output"));
}

/// A crash during the first building iteration must resume in building,
/// not re-run planning over the plan the agent just wrote.
#[test]
fn crash_after_planning_resumes_in_building() {
    let project = TestProject::with_plan("");
    let agent = project.agent(vec![
        ScriptedRun::output(signal::PLAN_COMPLETE).writes_plan("# Plan\n\n- [ ] build it\n"),
        ScriptedRun::crash(),
    ]);
    let validator = ScriptedValidator::passing();
    let menu = ScriptedMenu::new(&[]);

    let crashed = catch_unwind(AssertUnwindSafe(|| {
        Orchestrator::new(
            project.paths().clone(),
            project.session(),
            project.config(),
            &agent,
            &validator,
            &menu,
            CancelToken::new(),
        )
        .run()
    }));
    assert!(crashed.is_err());

    let checkpoint = CheckpointManager::new(&project.session().paths.checkpoint_path)
        .load()
        .expect("checkpoint from the phase change");
    assert_eq!(checkpoint.phase, Phase::Building);
    assert_eq!(checkpoint.iteration, 1);

    let agent = project.agent(vec![ScriptedRun::output(signal::TASK_COMPLETE)]);
    let config = OrchestratorConfig {
        recovery: RecoveryPolicy::Resume,
        ..project.config()
    };
    let report = Orchestrator::new(
        project.paths().clone(),
        project.session(),
        config,
        &agent,
        &validator,
        &menu,
        CancelToken::new(),
    )
    .run()
    .expect("resumed run");

    assert_eq!(report.status, LoopStatus::Complete);
    let roles: Vec<AgentRole> = agent.requests().iter().map(|r| r.role).collect();
    assert_eq!(roles, vec![AgentRole::Building]);
}

/// The agent ticks the last box and signals, but the checks fail: the loop
/// feeds the failure back and asks again instead of completing.
#[test]
fn failing_validation_blocks_completion_of_an_emptied_plan() {
    let project = TestProject::with_plan("- [ ] fix the parser\n");
    let agent = project.agent(vec![
        ScriptedRun::output(signal::TASK_COMPLETE).completes_next_task(),
        ScriptedRun::output(signal::TASK_COMPLETE),
    ]);
    let validator = ScriptedValidator::new(vec![ValidationReport::from_checks(vec![
        CheckResult {
            name: "tests".to_string(),
            passed: false,
            exit_code: Some(101),
            output: "test parser::empty_input ... FAILED".to_string(),
        },
    ])]);
    let config = OrchestratorConfig {
        validation: vec![ValidationCommand {
            name: "tests".to_string(),
            command: vec!["cargo".to_string(), "test".to_string()],
            timeout_secs: 5,
        }],
        ..project.config()
    };

    let report = Orchestrator::new(
        project.paths().clone(),
        project.session(),
        config,
        &agent,
        &validator,
        &ScriptedMenu::new(&[]),
        CancelToken::new(),
    )
    .run()
    .expect("run");

    assert_eq!(report.status, LoopStatus::Complete);
    assert_eq!(report.iterations, 2);
    assert_eq!(validator.calls(), 2);
    let requests = agent.requests();
    assert!(requests[1].prompt.contains("fix the parser"));
    assert!(requests[1].prompt.contains("parser::empty_input ... FAILED"));
}
