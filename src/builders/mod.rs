//! Builders that assemble a session from configuration.

pub mod session_builder;

pub use session_builder::SessionBuilder;
