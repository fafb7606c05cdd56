//! Run repository trait definition.
//!
//! Defines the storage interface for workflow run checkpoints. The
//! infrastructure layer (runbook-infra) implements this trait with SQLite
//! persistence; tests use an in-memory implementation.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use runbook_types::error::RepositoryError;
use runbook_types::workflow::RunState;
use uuid::Uuid;

/// Repository trait for run-state persistence.
///
/// `save` is an upsert: the engine calls it after every execution unit (and
/// every parallel child) completes, so a crashed run can resume from the last
/// checkpoint.
pub trait RunRepository: Send + Sync {
    /// Insert or replace the checkpoint for a run.
    fn save(
        &self,
        run: &RunState,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a run checkpoint by id.
    fn load(
        &self,
        run_id: &Uuid,
    ) -> impl Future<Output = Result<Option<RunState>, RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by workflow name.
    fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<RunState>, RepositoryError>> + Send;

    /// List runs suspended in `awaiting_approval`, for approval pickup.
    fn list_suspended(
        &self,
    ) -> impl Future<Output = Result<Vec<RunState>, RepositoryError>> + Send;
}
