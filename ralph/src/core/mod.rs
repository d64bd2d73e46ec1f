//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod menu;
pub mod plan;
pub mod session_id;
pub mod signal;
pub mod types;
