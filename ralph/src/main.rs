//! `ralph` command-line entry point.
//!
//! Drives a coding agent through spec creation, planning and building, one
//! task per iteration, with all loop state kept under `.ralph/`.

mod cli;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ralph::exit_codes;

use crate::cli::RunArgs;

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Recoverable loop orchestrator for an AI coding agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.ralph/` with default config, settings and agent templates.
    Init {
        /// Overwrite existing config and templates (memory is kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Run the loop until the plan is complete or a limit is hit.
    Run(RunArgs),
    /// Show plan progress, checkpoint and active session.
    Status {
        #[arg(long)]
        session: Option<String>,
    },
    /// Create, list and switch sessions.
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    /// Inspect or edit the cross-session memory.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Start fresh: clear plan tasks, progress, checkpoint and feedback.
    Reset {
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Create a session and make it active.
    New {
        label: String,
        /// Keep specs inside the session instead of the shared `specs/`.
        #[arg(long)]
        isolated_specs: bool,
    },
    List,
    /// Make an existing session active.
    Use { id: String },
    Delete { id: String },
    /// Print the session `run` would use.
    Current,
}

#[derive(Subcommand)]
enum MemoryCommand {
    Show,
    /// Record a dated note under patterns, commands, gotchas or decisions.
    Add { section: String, text: String },
    Enable,
    Disable,
}

fn main() {
    ralph::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FATAL
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cli::init(&root, force),
        Command::Run(args) => cli::run(&root, &args),
        Command::Status { session } => cli::status(&root, session.as_deref()),
        Command::Session { command } => match command {
            SessionCommand::New {
                label,
                isolated_specs,
            } => cli::session_new(&root, &label, isolated_specs),
            SessionCommand::List => cli::session_list(&root),
            SessionCommand::Use { id } => cli::session_use(&root, &id),
            SessionCommand::Delete { id } => cli::session_delete(&root, &id),
            SessionCommand::Current => cli::session_current(&root),
        },
        Command::Memory { command } => match command {
            MemoryCommand::Show => cli::memory_show(&root),
            MemoryCommand::Add { section, text } => cli::memory_add(&root, &section, &text),
            MemoryCommand::Enable => cli::memory_toggle(&root, true),
            MemoryCommand::Disable => cli::memory_toggle(&root, false),
        },
        Command::Reset { session } => cli::reset(&root, session.as_deref()),
    }
}
