//! JSON-lines planner output.
//!
//! One `WorkItem` per line; blank lines and `#` comments are skipped. Only
//! the identifier and estimate are required, everything else has defaults.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::core::error::GovernorError;
use crate::core::work_item::WorkItem;

/// Reads planner output from a `.jsonl` file.
#[derive(Debug, Clone)]
pub struct JsonlPlanner {
    path: PathBuf,
}

impl JsonlPlanner {
    /// Planner reading from `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load every item in file order.
    ///
    /// # Errors
    ///
    /// [`GovernorError::Ingest`] if the file cannot be read, a line does not
    /// decode, or two items share an identifier.
    pub fn load(&self) -> Result<Vec<WorkItem>, GovernorError> {
        let file = File::open(&self.path)
            .map_err(|e| GovernorError::Ingest(format!("{}: {e}", self.path.display())))?;
        let items = parse_items(BufReader::new(file))
            .map_err(|e| GovernorError::Ingest(format!("{}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), items = items.len(), "work items loaded");
        Ok(items)
    }
}

/// Parse JSON-lines items from any reader.
///
/// # Errors
///
/// A message naming the offending line.
pub fn parse_items(reader: impl BufRead) -> Result<Vec<WorkItem>, String> {
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|e| format!("line {line_no}: {e}"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let item: WorkItem =
            serde_json::from_str(trimmed).map_err(|e| format!("line {line_no}: {e}"))?;
        if !seen.insert(item.id.clone()) {
            return Err(format!("line {line_no}: duplicate item id `{}`", item.id));
        }
        items.push(item);
    }
    Ok(items)
}
