//! Pure logic shared by the console.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod budget;
pub mod conversation;
pub mod decision;
pub mod fence;
pub mod types;
