//! Timed wait executor.
//!
//! Sleeps for the step's `durationMs`, honoring cancellation. Useful for
//! pacing between side-effecting steps (rate limits, eventual consistency).

use runbook_core::workflow::executor::{BoxedStepFuture, StepExecutor, StepRequest};
use runbook_types::workflow::{StepResult, fault_kind};
use serde_json::{Value, json};
use std::time::Duration;

use super::INVALID_PARAMS;

/// Executes `wait` steps.
pub struct WaitExecutor;

impl StepExecutor for WaitExecutor {
    fn execute<'a>(&'a self, request: StepRequest<'a>) -> BoxedStepFuture<'a> {
        Box::pin(async move {
            let Some(duration_ms) = request.params.get("durationMs").and_then(Value::as_u64)
            else {
                return StepResult::failure(
                    INVALID_PARAMS,
                    "wait step requires a 'durationMs' integer param",
                    0,
                );
            };

            let started = std::time::Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                    StepResult::success(
                        json!({ "waitedMs": duration_ms }),
                        started.elapsed().as_millis() as u64,
                    )
                }
                _ = request.cancel.cancelled() => {
                    StepResult::failure(
                        fault_kind::CANCELLED,
                        "wait cancelled",
                        started.elapsed().as_millis() as u64,
                    )
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
