//! Work-item ingestion from external planners.

pub mod jsonl;

pub use jsonl::JsonlPlanner;
