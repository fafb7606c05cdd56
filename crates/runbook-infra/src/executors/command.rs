//! Shell command executor.
//!
//! Runs the step's `command` string through `sh -c`, capturing stdout,
//! stderr, and the exit code. A non-zero exit is a step failure (the engine
//! decides what that means via `onFailure`). The child is killed if the run
//! is cancelled while it executes.

use runbook_core::workflow::executor::{BoxedStepFuture, StepExecutor, StepRequest};
use runbook_types::workflow::{StepResult, fault_kind};
use serde_json::{Value, json};

use super::INVALID_PARAMS;

/// Fault kind for a command exiting non-zero.
pub const COMMAND_FAILED: &str = "command_failed";

/// Fault kind for a command that could not be spawned.
pub const SPAWN_FAILED: &str = "spawn_failed";

/// Executes `command` steps through the system shell.
#[derive(Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl StepExecutor for CommandExecutor {
    fn execute<'a>(&'a self, request: StepRequest<'a>) -> BoxedStepFuture<'a> {
        Box::pin(async move {
            let started = std::time::Instant::now();

            let Some(command) = request.params.get("command").and_then(Value::as_str) else {
                return StepResult::failure(
                    INVALID_PARAMS,
                    "command step requires a 'command' string param",
                    0,
                );
            };

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command).kill_on_drop(true);

            if let Some(cwd) = request.params.get("cwd").and_then(Value::as_str) {
                cmd.current_dir(cwd);
            }
            if let Some(env) = request.params.get("env").and_then(Value::as_object) {
                for (key, value) in env {
                    if let Some(value) = value.as_str() {
                        cmd.env(key, value);
                    }
                }
            }

            tracing::debug!(step_id = request.step_id, command, "running command step");

            // kill_on_drop reaps the child if cancellation drops the future.
            let output = tokio::select! {
                result = cmd.output() => match result {
                    Ok(output) => output,
                    Err(e) => {
                        return StepResult::failure(
                            SPAWN_FAILED,
                            format!("failed to spawn command: {e}"),
                            started.elapsed().as_millis() as u64,
                        );
                    }
                },
                _ = request.cancel.cancelled() => {
                    return StepResult::failure(
                        fault_kind::CANCELLED,
                        "command cancelled",
                        started.elapsed().as_millis() as u64,
                    );
                }
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let exit_code = output.status.code().unwrap_or(-1);

            if output.status.success() {
                StepResult::success(
                    json!({
                        "stdout": stdout,
                        "stderr": stderr,
                        "exitCode": exit_code,
                    }),
                    duration_ms,
                )
            } else {
                StepResult::failure(
                    COMMAND_FAILED,
                    format!(
                        "command exited with code {exit_code}: {}",
                        stderr.trim()
                    ),
                    duration_ms,
                )
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
