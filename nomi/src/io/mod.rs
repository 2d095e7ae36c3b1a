//! Side-effecting collaborators of the console: processes, HTTP, stdin, templates.

pub mod bridge;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod input;
pub mod ollama;
pub mod process;
pub mod prompt;
