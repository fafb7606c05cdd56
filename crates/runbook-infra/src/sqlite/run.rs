//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `runbook-core` using sqlx with split
//! read/write pools. Bindings, step results, and the pending approval are
//! stored as JSON blobs so the whole `RunState` round-trips; status, cursor,
//! and timestamps get their own columns for querying.

use chrono::{DateTime, Utc};
use runbook_types::error::RepositoryError;
use runbook_types::workflow::{PendingApproval, RunState, RunStatus, StepRecord};
use runbook_core::repository::RunRepository;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_name: String,
    status: String,
    cursor: i64,
    bindings: String,
    step_results: String,
    approval: Option<String>,
    error: Option<String>,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            cursor: row.try_get("cursor")?,
            bindings: row.try_get("bindings")?,
            step_results: row.try_get("step_results")?,
            approval: row.try_get("approval")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_state(self) -> Result<RunState, RepositoryError> {
        let run_id = parse_uuid(&self.id)?;
        let status: RunStatus =
            serde_json::from_value(serde_json::Value::String(self.status.clone())).map_err(
                |_| RepositoryError::Query(format!("invalid run status: {}", self.status)),
            )?;

        let bindings: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&self.bindings)
                .map_err(|e| RepositoryError::Query(format!("invalid bindings JSON: {e}")))?;

        let step_results: Vec<StepRecord> = serde_json::from_str(&self.step_results)
            .map_err(|e| RepositoryError::Query(format!("invalid step_results JSON: {e}")))?;

        let approval: Option<PendingApproval> = self
            .approval
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid approval JSON: {e}")))
            })
            .transpose()?;

        Ok(RunState {
            run_id,
            workflow_name: self.workflow_name,
            status,
            cursor: self.cursor as usize,
            bindings,
            step_results,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            error: self.error,
            approval,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Success => "success",
        RunStatus::Failed => "failed",
        RunStatus::Aborted => "aborted",
        RunStatus::AwaitingApproval => "awaiting_approval",
    }
}

fn to_json_column<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn save(&self, run: &RunState) -> Result<(), RepositoryError> {
        let bindings = to_json_column(&run.bindings, "bindings")?;
        let step_results = to_json_column(&run.step_results, "step_results")?;
        let approval = run
            .approval
            .as_ref()
            .map(|a| to_json_column(a, "approval"))
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
                 (id, workflow_name, status, cursor, bindings, step_results,
                  approval, error, started_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 cursor = excluded.cursor,
                 bindings = excluded.bindings,
                 step_results = excluded.step_results,
                 approval = excluded.approval,
                 error = excluded.error,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.workflow_name)
        .bind(status_str(run.status))
        .bind(run.cursor as i64)
        .bind(bindings)
        .bind(step_results)
        .bind(approval)
        .bind(run.error.as_deref())
        .bind(format_datetime(&run.started_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> Result<Option<RunState>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|r| {
            RunRow::from_row(&r)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_state()
        })
        .transpose()
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunState>, RepositoryError> {
        let rows = match workflow_name {
            Some(name) => {
                sqlx::query(
                    "SELECT * FROM workflow_runs WHERE workflow_name = ?
                     ORDER BY started_at DESC LIMIT ?",
                )
                .bind(name)
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_runs ORDER BY started_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|r| {
                RunRow::from_row(r)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_state()
            })
            .collect()
    }

    async fn list_suspended(&self) -> Result<Vec<RunState>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE status = 'awaiting_approval'
             ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|r| {
                RunRow::from_row(r)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_state()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runbook_types::workflow::{StepFault, StepStatus};
    use serde_json::json;

    async fn test_repo() -> (SqliteRunRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteRunRepository::new(pool), dir)
    }

    fn sample_run(name: &str) -> RunState {
        let mut run = RunState::new(name);
        run.bindings.insert("artifact".to_string(), json!("a.tar"));
        run.step_results.push(StepRecord {
            step_id: "build".to_string(),
            status: StepStatus::Success,
            attempt: 1,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            output: Some(json!("a.tar")),
            error: None,
            skip_reason: None,
        });
        run.cursor = 1;
        run
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let (repo, _dir) = test_repo().await;
        let run = sample_run("deploy");
        repo.save(&run).await.unwrap();

        let loaded = repo.load(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_name, "deploy");
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.cursor, 1);
        assert_eq!(loaded.bindings.get("artifact"), Some(&json!("a.tar")));
        assert_eq!(loaded.step_results.len(), 1);
        assert_eq!(loaded.step_results[0].step_id, "build");
        assert!(loaded.approval.is_none());
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let (repo, _dir) = test_repo().await;
        assert!(repo.load(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let (repo, _dir) = test_repo().await;
        let mut run = sample_run("deploy");
        repo.save(&run).await.unwrap();

        run.status = RunStatus::Failed;
        run.error = Some("step 'x' failed".to_string());
        run.completed_at = Some(Utc::now());
        run.step_results.push(StepRecord {
            step_id: "x".to_string(),
            status: StepStatus::Failed,
            attempt: 2,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            output: None,
            error: Some(StepFault::new("boom", "broke")),
            skip_reason: None,
        });
        repo.save(&run).await.unwrap();

        let loaded = repo.load(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("step 'x' failed"));
        assert_eq!(loaded.step_results.len(), 2);
        assert_eq!(
            loaded.step_results[1].error.as_ref().unwrap().kind,
            "boom"
        );
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_approval_roundtrip() {
        let (repo, _dir) = test_repo().await;
        let mut run = sample_run("gated");
        run.status = RunStatus::AwaitingApproval;
        run.approval = Some(PendingApproval {
            step_id: "gate".to_string(),
            prompt: Some("ship it?".to_string()),
            attempt: 1,
            requested_at: Utc::now(),
            deadline: None,
        });
        repo.save(&run).await.unwrap();

        let loaded = repo.load(&run.run_id).await.unwrap().unwrap();
        let approval = loaded.approval.unwrap();
        assert_eq!(approval.step_id, "gate");
        assert_eq!(approval.prompt.as_deref(), Some("ship it?"));
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_limits() {
        let (repo, _dir) = test_repo().await;
        for name in ["alpha", "alpha", "beta"] {
            repo.save(&sample_run(name)).await.unwrap();
        }

        let all = repo.list_runs(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let alphas = repo.list_runs(Some("alpha"), 10).await.unwrap();
        assert_eq!(alphas.len(), 2);

        let limited = repo.list_runs(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_list_suspended() {
        let (repo, _dir) = test_repo().await;
        let mut suspended = sample_run("gated");
        suspended.status = RunStatus::AwaitingApproval;
        repo.save(&suspended).await.unwrap();
        repo.save(&sample_run("plain")).await.unwrap();

        let found = repo.list_suspended().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].workflow_name, "gated");
    }
}
