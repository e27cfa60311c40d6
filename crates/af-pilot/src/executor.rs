use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use af_core::config::ExecutorsConfig;
use af_core::types::{PhaseKind, PhaseOutcome, Task};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no executor command configured for phase {0}")]
    NotConfigured(PhaseKind),
    #[error("failed to spawn executor for {phase}: {detail}")]
    Spawn { phase: PhaseKind, detail: String },
    #[error("executor for {phase} timed out after {secs}s")]
    Timeout { phase: PhaseKind, secs: u64 },
    #[error("executor for {phase} exited with status {status}: {stderr}")]
    Failed {
        phase: PhaseKind,
        status: i32,
        stderr: String,
    },
    #[error("could not parse outcome from {phase} executor: {detail}")]
    Parse { phase: PhaseKind, detail: String },
    #[error("io error talking to {phase} executor: {detail}")]
    Io { phase: PhaseKind, detail: String },
}

// ---------------------------------------------------------------------------
// DispatchContext
// ---------------------------------------------------------------------------

/// Everything an executor gets to see about the dispatch, besides the task
/// itself.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchContext {
    pub project_dir: PathBuf,
    pub iteration: u64,
    /// How many times the task has been dispatched, this dispatch included.
    pub attempt: u32,
    /// The next required checkpoint, or `None` once the task is ready to
    /// resolve (or has no checkpoint sequence).
    pub next_checkpoint: Option<String>,
}

// ---------------------------------------------------------------------------
// PhaseExecutor
// ---------------------------------------------------------------------------

/// Contract implemented by the external collaborators that do the actual
/// work. The coordinator dispatches exactly one unit of work at a time and
/// blocks on the single consolidated result; any internal concurrency on
/// the executor side is opaque here.
///
/// Executors must report every operation actually invoked, in order,
/// read-only ones included; the checkpoint tracker is driven by this log.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(
        &self,
        phase: PhaseKind,
        task: Option<&Task>,
        ctx: &DispatchContext,
    ) -> Result<PhaseOutcome, ExecutorError>;
}

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

/// Runs each phase as an external command. The dispatch payload is written
/// to the child's stdin as JSON; the child prints a [`PhaseOutcome`] JSON
/// document on stdout and exits 0.
pub struct CommandExecutor {
    commands: BTreeMap<PhaseKind, Vec<String>>,
    timeout: Duration,
}

#[derive(Serialize)]
struct DispatchPayload<'a> {
    phase: PhaseKind,
    task: Option<&'a Task>,
    #[serde(flatten)]
    context: &'a DispatchContext,
}

impl CommandExecutor {
    pub fn new(config: &ExecutorsConfig) -> Self {
        Self {
            commands: config.commands.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn command_for(&self, phase: PhaseKind) -> Result<(&str, &[String]), ExecutorError> {
        let command = self
            .commands
            .get(&phase)
            .ok_or(ExecutorError::NotConfigured(phase))?;
        // Validated non-empty at config load.
        Ok((command[0].as_str(), &command[1..]))
    }
}

#[async_trait]
impl PhaseExecutor for CommandExecutor {
    async fn execute(
        &self,
        phase: PhaseKind,
        task: Option<&Task>,
        ctx: &DispatchContext,
    ) -> Result<PhaseOutcome, ExecutorError> {
        let (program, args) = self.command_for(phase)?;
        debug!(%phase, program, "dispatching to external executor");

        let payload = serde_json::to_vec(&DispatchPayload {
            phase,
            task,
            context: ctx,
        })
        .map_err(|e| ExecutorError::Io {
            phase,
            detail: e.to_string(),
        })?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&ctx.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::Spawn {
                phase,
                detail: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ExecutorError::Io {
                    phase,
                    detail: e.to_string(),
                })?;
            // Close stdin so the child sees EOF.
            drop(stdin);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ExecutorError::Io {
                phase,
                detail: e.to_string(),
            })?,
            Err(_elapsed) => {
                warn!(%phase, secs = self.timeout.as_secs(), "executor timed out");
                return Err(ExecutorError::Timeout {
                    phase,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ExecutorError::Failed {
                phase,
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| ExecutorError::Parse {
            phase,
            detail: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
