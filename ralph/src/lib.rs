//! Recoverable loop orchestrator for an AI coding agent.
//!
//! `ralph` repeatedly hands one task from an implementation plan to an
//! external coding agent, watches its output for a completion sentinel,
//! runs validation commands, and records progress until the plan is done or
//! a cap is hit. State lives in files under `.ralph/` so a loop can be
//! interrupted and resumed. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plan parsing, sentinels, menu
//!   resolution, budgets). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, processes, git).
//!   Collaborators sit behind traits to enable scripting in tests.
//!
//! [`orchestrator`] drives the phase state machine and [`iteration`] runs a
//! single agent invocation end to end.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
