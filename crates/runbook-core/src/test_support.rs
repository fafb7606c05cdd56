//! Shared test doubles: an in-memory run repository and scripted executors.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use runbook_types::error::RepositoryError;
use runbook_types::workflow::{RunState, RunStatus, StepKind, StepResult};
use uuid::Uuid;

use crate::repository::RunRepository;
use crate::workflow::executor::{BoxedStepFuture, ExecutorRegistry, StepExecutor, StepRequest};

// ---------------------------------------------------------------------------
// In-memory repository
// ---------------------------------------------------------------------------

/// `RunRepository` backed by a mutex-guarded map.
#[derive(Default, Clone)]
pub struct InMemoryRunRepository {
    runs: Arc<Mutex<HashMap<Uuid, RunState>>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &RunState) -> Result<(), RepositoryError> {
        self.runs.lock().unwrap().insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> Result<Option<RunState>, RepositoryError> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunState>, RepositoryError> {
        let mut runs: Vec<RunState> = self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|r| workflow_name.is_none_or(|name| r.workflow_name == name))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_suspended(&self) -> Result<Vec<RunState>, RepositoryError> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == RunStatus::AwaitingApproval)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

/// Executor stub that replays scripted results per step id.
///
/// Steps without a script echo their resolved params as a success. Every
/// invocation is logged so tests can assert dispatch order and retry counts.
#[derive(Default)]
pub struct ScriptedExecutor {
    responses: Mutex<HashMap<String, VecDeque<StepResult>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next result for a step id.
    pub fn respond(&self, step_id: &str, result: StepResult) {
        self.responses
            .lock()
            .unwrap()
            .entry(step_id.to_string())
            .or_default()
            .push_back(result);
    }

    /// Step ids in invocation order (repeats on retries).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, step_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == step_id)
            .count()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute<'a>(&'a self, request: StepRequest<'a>) -> BoxedStepFuture<'a> {
        self.calls.lock().unwrap().push(request.step_id.to_string());
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .get_mut(request.step_id)
            .and_then(VecDeque::pop_front);
        let result = scripted.unwrap_or_else(|| StepResult::success(request.params.clone(), 1));
        Box::pin(async move { result })
    }
}

// ---------------------------------------------------------------------------
// Slow executor (concurrency and cancellation probes)
// ---------------------------------------------------------------------------

/// Executor that sleeps before succeeding, tracking in-flight concurrency.
pub struct SlowExecutor {
    delay: std::time::Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowExecutor {
    pub fn new(delay: std::time::Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Highest number of concurrently executing invocations observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl StepExecutor for SlowExecutor {
    fn execute<'a>(&'a self, request: StepRequest<'a>) -> BoxedStepFuture<'a> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = tokio::select! {
                _ = tokio::time::sleep(self.delay) => {
                    StepResult::success(serde_json::json!({ "step": request.step_id }), 1)
                }
                _ = request.cancel.cancelled() => {
                    StepResult::failure("cancelled", "cancelled while sleeping", 1)
                }
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Registry helpers
// ---------------------------------------------------------------------------

/// Registry with the same executor serving every kind.
pub fn registry_for_all(executor: Arc<dyn StepExecutor>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for kind in [
        StepKind::Command,
        StepKind::Http,
        StepKind::Message,
        StepKind::Agent,
        StepKind::Approval,
        StepKind::Wait,
        StepKind::Delegate,
    ] {
        registry.register(kind, executor.clone());
    }
    registry
}
