//! LLM-driven command console.
//!
//! The user states a goal, a local model answers with either a clarifying
//! question or code, and the console runs that code, reports the outcome back
//! to the model, and repeats until the user is satisfied.
//!
//! - **[`core`]**: Pure logic (conversation history, decision parsing, fence
//!   extraction, the failure budget). No I/O.
//! - **[`io`]**: Side effects (model server, interpreters, terminal, config).
//!   Each seam is a trait so tests can script it.
//!
//! [`session`] ties the two together into the turn loop.

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
