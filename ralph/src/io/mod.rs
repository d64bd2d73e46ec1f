//! Side-effecting adapters: files under `.ralph/`, child processes, git and
//! the terminal.

pub mod agent;
pub mod atomic;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod init;
pub mod interrupt;
pub mod iteration_log;
pub mod memory;
pub mod menu;
pub mod paths;
pub mod plan_store;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod session;
pub mod settings;
pub mod validation;
