//! Execution collaborators backed by external programs.

pub mod process;

pub use process::ProcessExecutor;
