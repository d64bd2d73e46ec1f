//! CLI command implementations. Each returns the process exit code.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, ValueEnum};

use ralph::core::types::{LoopMode, LoopStatus, SpecsMode};
use ralph::exit_codes;
use ralph::io::agent::ClaudeAgentRunner;
use ralph::io::checkpoint::CheckpointManager;
use ralph::io::config::load_config;
use ralph::io::init::{InitOptions, ensure_initialized, init_project};
use ralph::io::interrupt::{CancelToken, install_ctrlc_handler};
use ralph::io::memory::{MemorySection, append_memory, load_memory};
use ralph::io::menu::TerminalMenu;
use ralph::io::paths::has_specs;
use ralph::io::plan_store::{load_plan, reset_plan};
use ralph::io::progress::reset_progress;
use ralph::io::prompt::Reference;
use ralph::io::session::SessionStore;
use ralph::io::settings::{Settings, load_settings, write_settings};
use ralph::io::validation::{CommandValidationRunner, clear_feedback};
use ralph::orchestrator::{LoopReport, Orchestrator, OrchestratorConfig, RecoveryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Spec,
    Plan,
    Build,
    Auto,
}

impl From<ModeArg> for LoopMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Spec => LoopMode::Spec,
            ModeArg::Plan => LoopMode::Plan,
            ModeArg::Build => LoopMode::Build,
            ModeArg::Auto => LoopMode::Auto,
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Which phases may run.
    #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
    pub mode: ModeArg,
    /// Session id (defaults to the active session).
    #[arg(long)]
    pub session: Option<String>,
    /// Model passed to the agent (overrides config).
    #[arg(long)]
    pub model: Option<String>,
    /// Stop after this many iterations (overrides config; 0 = unlimited).
    #[arg(long)]
    pub max_iterations: Option<u32>,
    /// Print the phase and prompt that would be sent, then exit.
    #[arg(long)]
    pub dry_run: bool,
    /// Resume from an existing checkpoint without asking.
    #[arg(long, conflicts_with = "fresh")]
    pub resume: bool,
    /// Discard an existing checkpoint without asking.
    #[arg(long)]
    pub fresh: bool,
    /// Go back to planning even if the plan has tasks.
    #[arg(long)]
    pub replan: bool,
    /// What to build, given to the spec and planning agents.
    #[arg(long)]
    pub goal: Option<String>,
    /// File appended to every prompt as reference material.
    #[arg(long)]
    pub reference: Vec<PathBuf>,
    /// Do not echo agent output.
    #[arg(short, long)]
    pub quiet: bool,
}

pub fn init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("init: created {}", paths.ralph_dir.display());
    Ok(exit_codes::OK)
}

pub fn run(root: &Path, args: &RunArgs) -> Result<i32> {
    let paths = ensure_initialized(root)?;
    let config = load_config(&paths.config_path)?;
    let settings = load_settings(&paths.settings_path);
    let session = SessionStore::new(paths.clone()).resolve(args.session.as_deref())?;

    let mut orchestrator_config = OrchestratorConfig::new(&config, &settings);
    orchestrator_config.mode = args.mode.into();
    if let Some(model) = &args.model {
        orchestrator_config.model = model.clone();
    }
    if let Some(max) = args.max_iterations {
        orchestrator_config.max_iterations = (max > 0).then_some(max);
    }
    orchestrator_config.recovery = if args.resume {
        RecoveryPolicy::Resume
    } else if args.fresh {
        RecoveryPolicy::Fresh
    } else if std::io::stdin().is_terminal() {
        RecoveryPolicy::Ask
    } else {
        RecoveryPolicy::Resume
    };
    orchestrator_config.replan = args.replan;
    orchestrator_config.dry_run = args.dry_run;
    orchestrator_config.goal = args.goal.clone();
    orchestrator_config.echo = !args.quiet;
    orchestrator_config.references = args
        .reference
        .iter()
        .map(|path| Reference::from_file(&root.join(path)))
        .collect::<Result<Vec<_>>>()?;

    let cancel = CancelToken::new();
    if !args.dry_run {
        install_ctrlc_handler(&cancel)?;
    }
    let agent = ClaudeAgentRunner::new(config.agent.clone(), cancel.clone());
    let validator = CommandValidationRunner::new(cancel.clone());
    let menu = TerminalMenu;

    eprintln!(
        "run: session={} mode={:?} model={}",
        session.meta.id, orchestrator_config.mode, orchestrator_config.model
    );
    let report = Orchestrator::new(
        paths,
        session,
        orchestrator_config,
        &agent,
        &validator,
        &menu,
        cancel,
    )
    .run()?;
    print_report(&report);
    Ok(exit_code(&report.status))
}

fn exit_code(status: &LoopStatus) -> i32 {
    match status {
        LoopStatus::Complete => exit_codes::OK,
        LoopStatus::Incomplete(_) => exit_codes::INCOMPLETE,
        LoopStatus::Cancelled => exit_codes::CANCELLED,
        LoopStatus::Fatal(_) => exit_codes::FATAL,
    }
}

fn print_report(report: &LoopReport) {
    if let Some(preview) = &report.preview {
        println!(
            "dry run: phase={} task={}",
            preview.phase,
            preview.task.as_deref().unwrap_or("-")
        );
        println!("{}", preview.prompt);
        return;
    }
    match &report.status {
        LoopStatus::Complete => {
            println!("run: status=complete iterations={}", report.iterations);
            return;
        }
        LoopStatus::Incomplete(reason) => {
            println!(
                "run: status=incomplete iterations={} reason={reason}",
                report.iterations
            );
        }
        LoopStatus::Cancelled => {
            println!("run: status=cancelled iterations={}", report.iterations);
        }
        LoopStatus::Fatal(reason) => {
            eprintln!("run: status=fatal reason={reason}");
        }
    }
    match &report.last_checkpoint {
        Some(checkpoint) => println!(
            "run: last checkpoint phase={} iteration={} pending={}",
            checkpoint.phase, checkpoint.iteration, checkpoint.pending_count
        ),
        None => println!("run: no checkpoint"),
    }
}

pub fn status(root: &Path, session: Option<&str>) -> Result<i32> {
    let paths = ensure_initialized(root)?;
    let store = SessionStore::new(paths.clone());
    let session = store.resolve(session)?;
    let settings = load_settings(&paths.settings_path);

    println!(
        "session: {}{} specs={} ({})",
        session.meta.id,
        if session.active { " (active)" } else { "" },
        session.meta.specs_mode,
        if has_specs(&session.paths.specs_dir) {
            "present"
        } else {
            "none"
        }
    );

    let plan = load_plan(&session.paths.plan_path);
    let stats = plan.stats();
    println!(
        "plan: pending={} completed={} total={}",
        stats.pending, stats.completed, stats.total
    );
    if let Some(task) = plan.next_pending() {
        println!("next: {}", task.text);
    }

    match CheckpointManager::new(&session.paths.checkpoint_path).load() {
        Some(checkpoint) => {
            println!(
                "checkpoint: phase={} iteration={} pending={} at={}",
                checkpoint.phase,
                checkpoint.iteration,
                checkpoint.pending_count,
                checkpoint.timestamp
            );
            if let Some(err) = &checkpoint.last_error {
                println!("last error: {err}");
            }
        }
        None => println!("checkpoint: none"),
    }
    println!(
        "memory: {}",
        if settings.memory_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    Ok(exit_codes::OK)
}

pub fn session_new(root: &Path, label: &str, isolated_specs: bool) -> Result<i32> {
    let store = SessionStore::new(ensure_initialized(root)?);
    let mode = if isolated_specs {
        SpecsMode::Isolated
    } else {
        SpecsMode::Shared
    };
    let meta = store.create(label, mode)?;
    store.activate(&meta.id)?;
    println!("session: created {} (active, specs={})", meta.id, meta.specs_mode);
    Ok(exit_codes::OK)
}

pub fn session_list(root: &Path) -> Result<i32> {
    let store = SessionStore::new(ensure_initialized(root)?);
    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("no sessions");
    }
    for summary in sessions {
        println!(
            "{} {}  {}  {}  specs={}",
            if summary.active { "*" } else { " " },
            summary.meta.id,
            summary.meta.label,
            summary.meta.created_at,
            summary.meta.specs_mode
        );
    }
    Ok(exit_codes::OK)
}

pub fn session_use(root: &Path, id: &str) -> Result<i32> {
    let store = SessionStore::new(ensure_initialized(root)?);
    store
        .load(id)
        .with_context(|| format!("session '{id}' cannot be used"))?;
    store.activate(id)?;
    println!("session: {id} is now active");
    Ok(exit_codes::OK)
}

pub fn session_delete(root: &Path, id: &str) -> Result<i32> {
    let store = SessionStore::new(ensure_initialized(root)?);
    store.delete(id)?;
    println!("session: deleted {id}");
    Ok(exit_codes::OK)
}

pub fn session_current(root: &Path) -> Result<i32> {
    let store = SessionStore::new(ensure_initialized(root)?);
    let session = store.resolve(None)?;
    println!("{}", session.meta.id);
    Ok(exit_codes::OK)
}

pub fn memory_show(root: &Path) -> Result<i32> {
    let paths = ensure_initialized(root)?;
    let settings = load_settings(&paths.settings_path);
    if !settings.memory_enabled {
        println!("(memory is disabled; it is not included in prompts)\n");
    }
    print!("{}", load_memory(&paths.memory_path).render());
    Ok(exit_codes::OK)
}

pub fn memory_add(root: &Path, section: &str, text: &str) -> Result<i32> {
    let paths = ensure_initialized(root)?;
    let section: MemorySection = section.parse()?;
    let added = append_memory(
        &paths.memory_path,
        section,
        text,
        Local::now().date_naive(),
    )?;
    if added {
        println!("memory: added to {section}");
    } else {
        println!("memory: already recorded under {section}");
    }
    Ok(exit_codes::OK)
}

pub fn memory_toggle(root: &Path, enabled: bool) -> Result<i32> {
    let paths = ensure_initialized(root)?;
    write_settings(
        &paths.settings_path,
        &Settings {
            memory_enabled: enabled,
        },
    )?;
    println!(
        "memory: {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(exit_codes::OK)
}

pub fn reset(root: &Path, session: Option<&str>) -> Result<i32> {
    let store = SessionStore::new(ensure_initialized(root)?);
    let session = store.resolve(session)?;
    reset_plan(&session.paths.plan_path)?;
    reset_progress(&session.paths.progress_path)?;
    CheckpointManager::new(&session.paths.checkpoint_path).clear()?;
    clear_feedback(&session.paths.feedback_path)?;
    println!("reset: session {} starts fresh", session.meta.id);
    Ok(exit_codes::OK)
}
