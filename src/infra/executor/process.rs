//! Executor that delegates every stage to an external command.
//!
//! The command receives one JSON request on stdin:
//! `{"stage": "rehearse" | "execute" | "rollback", "item": {...}, ...}` and
//! answers on stdout with an `ExecutionOutcome` (rehearse) or an
//! `ExecutionReport` (execute). Rollback only looks at the exit status. A
//! non-zero exit is always a failure.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::executor::{ExecutionCollaborator, ExecutionOutcome, ExecutionReport};
use crate::core::policy::Policy;
use crate::core::work_item::{Sample, WorkItem};

#[derive(Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
enum Request<'a> {
    Rehearse {
        item: &'a WorkItem,
        samples: &'a [Sample],
    },
    Execute {
        item: &'a WorkItem,
        policy: &'a Policy,
    },
    Rollback {
        item: &'a WorkItem,
    },
}

/// Raw result of one invocation.
#[derive(Debug)]
struct Invocation {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

/// Runs `program args...` once per stage.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
}

impl ProcessExecutor {
    /// Command line as program followed by arguments; `None` when empty.
    #[must_use]
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    async fn invoke(&self, request: &Request<'_>) -> Result<Invocation, String> {
        let body = serde_json::to_vec(request).map_err(|e| format!("encode request: {e}"))?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawn {}: {e}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body)
                .await
                .map_err(|e| format!("write request: {e}"))?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("wait for {}: {e}", self.program))?;
        debug!(program = %self.program, status = %output.status, "executor command finished");
        Ok(Invocation {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ExecutionCollaborator for ProcessExecutor {
    async fn rehearse(&self, item: &WorkItem, samples: &[Sample]) -> ExecutionOutcome {
        match self.invoke(&Request::Rehearse { item, samples }).await {
            Ok(run) if run.success => serde_json::from_slice(&run.stdout).unwrap_or_else(|e| {
                ExecutionOutcome::failed(format!("unreadable rehearsal output: {e}"))
            }),
            Ok(run) => ExecutionOutcome::failed(json!({ "stderr": run.stderr })),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "rehearsal command failed");
                ExecutionOutcome::failed(e)
            }
        }
    }

    async fn execute(&self, item: &WorkItem, policy: &Policy) -> ExecutionReport {
        match self.invoke(&Request::Execute { item, policy }).await {
            Ok(run) if run.success => {
                serde_json::from_slice(&run.stdout).unwrap_or_else(|e| ExecutionReport {
                    success: false,
                    detail: json!(format!("unreadable execution report: {e}")),
                    ..ExecutionReport::default()
                })
            }
            Ok(run) => {
                // A failing command may still report what it spent.
                let mut report: ExecutionReport =
                    serde_json::from_slice(&run.stdout).unwrap_or_default();
                report.success = false;
                if report.detail.is_null() {
                    report.detail = json!({ "stderr": run.stderr });
                }
                report
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "execution command failed");
                ExecutionReport {
                    success: false,
                    detail: json!(e),
                    ..ExecutionReport::default()
                }
            }
        }
    }

    async fn rollback(&self, item: &WorkItem) -> Result<(), String> {
        let run = self.invoke(&Request::Rollback { item }).await?;
        if run.success {
            Ok(())
        } else {
            Err(format!("rollback command failed: {}", run.stderr))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::policy::AdaptivePolicyTable;
    use crate::core::policy::Tier;
    use crate::util::serde::{Priority, ResourceEstimate};

    fn sh(script: &str) -> ProcessExecutor {
        ProcessExecutor::from_command(&["sh".into(), "-c".into(), script.into()]).unwrap()
    }

    fn item() -> WorkItem {
        WorkItem::new("p1", Priority::Normal, ResourceEstimate::tokens(10, 10))
    }

    #[tokio::test]
    async fn parses_report_from_stdout() {
        let exec = sh(r#"cat >/dev/null; echo '{"success":true,"metrics":{"accuracy":0.97},"tokens_used":321}'"#);
        let policy = *AdaptivePolicyTable::default().policy(Tier::Full);
        let report = exec.execute(&item(), &policy).await;
        assert!(report.success);
        assert_eq!(report.tokens_used, Some(321));
        assert!((report.metrics["accuracy"] - 0.97).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let exec = sh("cat >/dev/null; echo broken >&2; exit 3");
        let policy = *AdaptivePolicyTable::default().policy(Tier::Full);
        let report = exec.execute(&item(), &policy).await;
        assert!(!report.success);
        assert!(exec.rollback(&item()).await.is_err());
    }

    #[tokio::test]
    async fn request_names_the_stage() {
        let exec = sh(r#"grep -q '"stage":"rehearse"' && echo '{"success":true}'"#);
        assert!(exec.rehearse(&item(), &[]).await.success);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(ProcessExecutor::from_command(&[]).is_none());
    }
}
