//! Durable checkpointing of run state.
//!
//! Wraps a [`RunRepository`] to persist the whole [`RunState`] after every
//! execution unit (and every parallel child) completes, so interrupted runs
//! resume at the first non-terminal unit instead of starting over. The only
//! suspension that must survive a process restart is an approval gate, which
//! is why the engine checkpoints before returning control to the caller.

use chrono::Utc;
use runbook_types::workflow::RunState;
use uuid::Uuid;

use crate::repository::RunRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists run-state snapshots through a repository.
///
/// Generic over `R: RunRepository` so it works with any storage backend
/// (SQLite, in-memory mock, etc.).
pub struct CheckpointManager<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persist the current run state, stamping `updated_at`.
    pub async fn save(&self, run: &mut RunState) -> Result<(), CheckpointError> {
        run.updated_at = Utc::now();
        self.repo
            .save(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run.run_id,
            status = ?run.status,
            cursor = run.cursor,
            "checkpointed run state"
        );
        Ok(())
    }

    /// Load a checkpointed run, failing if it does not exist.
    pub async fn load(&self, run_id: Uuid) -> Result<RunState, CheckpointError> {
        self.repo
            .load(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// Run not found (for load/resume operations).
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
