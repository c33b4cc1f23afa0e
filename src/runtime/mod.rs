//! Command-line surface.

pub mod cli;

pub use cli::{execute, Cli, Command, EXIT_CHECKPOINTED, EXIT_DRAINED, EXIT_FATAL};
