//! The execution state machine.
//!
//! Walks a compiled program unit by unit, dispatching steps through the
//! executor registry, threading results into the binding store, and applying
//! each step's `onFailure` policy. Parallel groups run their children
//! concurrently (bounded by `maxConcurrency`) against a read-only snapshot of
//! the store; child writes are buffered and merged in document order once the
//! whole group is done.
//!
//! The engine is single-threaded with respect to run state: conditions are
//! evaluated, params resolved, records appended, and checkpoints written only
//! from the engine loop. Spawned tasks do nothing but invoke executors.
//!
//! # Suspension and recovery
//!
//! An `approval` step checkpoints the run as `awaiting_approval` and returns
//! control to the caller; `resume` re-enters the loop at the same cursor with
//! the decision applied through the step's failure policy. `recover` re-enters
//! an interrupted run at its checkpointed cursor, skipping children that
//! already reached a terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use runbook_types::workflow::{
    ApprovalDecision, OnFailure, PendingApproval, RunState, RunStatus, StepFault, StepKind,
    StepRecord, StepResult, StepSpec, StepStatus, fault_kind,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::RunRepository;

use super::bindings::BindingStore;
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::compiler::{CompiledGroup, CompiledStep, ExecutionUnit, Program};
use super::condition::ConditionEvaluator;
use super::executor::{ExecutorRegistry, StepRequest};
use super::retry::RetryBackoff;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base delay for `retry:<n>` backoff; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Concurrency cap applied to groups that do not declare their own
    /// `maxConcurrency` (None = unbounded).
    pub default_max_concurrency: Option<usize>,
    /// When true, an unresolved `${...}` reference in step params fails the
    /// step (`binding_resolution`) instead of rendering as an empty string.
    pub strict_templates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_millis(250),
            default_max_concurrency: None,
            strict_templates: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that terminate the engine itself, as opposed to step failures,
/// which are data routed through `onFailure` policies.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Internal invariant violation (e.g. duplicate binding write). Always
    /// fatal, regardless of any `onFailure` policy.
    #[error("engine fault: {0}")]
    Fault(String),

    /// Run not found (for cancel/resume/recover).
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// Resume/recover was called on a run whose status does not allow it.
    #[error("run {0} cannot be resumed in its current state")]
    NotSuspended(Uuid),

    /// A required input was not supplied and has no default.
    #[error("missing required input '{0}'")]
    MissingInput(String),
}

// ---------------------------------------------------------------------------
// Unit outcomes (internal)
// ---------------------------------------------------------------------------

/// What the loop does after one execution unit.
enum UnitOutcome {
    /// Move to the next unit. `failed` carries the unit's effective failure
    /// state for `previous_step_failed`; `None` leaves the flag unchanged
    /// (the unit was skipped entirely).
    Advance { failed: Option<bool> },
    /// Suspend the run awaiting an approval decision.
    Suspend,
    /// Stop with run status `failed`.
    FailRun(String),
    /// Stop with run status `aborted` (cancellation).
    AbortRun,
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

/// Unit-by-unit workflow executor with durable checkpointing.
///
/// Generic over `R: RunRepository` for storage flexibility.
pub struct ExecutionEngine<R: RunRepository> {
    checkpoint: CheckpointManager<R>,
    registry: Arc<ExecutorRegistry>,
    evaluator: ConditionEvaluator,
    config: EngineConfig,
    /// Cancellation tokens for live runs, keyed by run id.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<R: RunRepository + 'static> ExecutionEngine<R> {
    pub fn new(repo: R, registry: ExecutorRegistry) -> Self {
        Self::with_config(repo, registry, EngineConfig::default())
    }

    pub fn with_config(repo: R, registry: ExecutorRegistry, config: EngineConfig) -> Self {
        Self {
            checkpoint: CheckpointManager::new(repo),
            registry: Arc::new(registry),
            evaluator: ConditionEvaluator::new(),
            config,
            cancellations: DashMap::new(),
        }
    }

    /// Access the checkpoint manager (and through it, the repository).
    pub fn checkpoint(&self) -> &CheckpointManager<R> {
        &self.checkpoint
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Execute a compiled program from the beginning.
    ///
    /// Step failures surface in the returned `RunState`; only engine faults
    /// and persistence errors are `Err`.
    pub async fn execute(
        &self,
        program: &Program,
        inputs: &serde_json::Map<String, Value>,
    ) -> Result<RunState, EngineError> {
        let mut run = RunState::new(&program.name);
        let mut store = BindingStore::new();
        self.bind_inputs(program, inputs, &mut store)?;

        self.save(&mut run, &store).await?;
        tracing::info!(
            run_id = %run.run_id,
            workflow = program.name.as_str(),
            "starting workflow execution"
        );

        self.drive(program, run, store).await
    }

    /// Resume a run suspended at an approval gate with the given decision.
    ///
    /// A rejection (or a decision arriving past the step's deadline) is a
    /// step failure routed through the approval step's `onFailure` policy.
    pub async fn resume(
        &self,
        run_id: Uuid,
        program: &Program,
        decision: ApprovalDecision,
    ) -> Result<RunState, EngineError> {
        let mut run = self.checkpoint.load(run_id).await?;
        if run.status != RunStatus::AwaitingApproval {
            return Err(EngineError::NotSuspended(run_id));
        }
        let pending = run.approval.take().ok_or(EngineError::NotSuspended(run_id))?;
        let step = program.find_step(&pending.step_id).ok_or_else(|| {
            EngineError::Fault(format!(
                "suspended step '{}' is not defined in workflow '{}'",
                pending.step_id, program.name
            ))
        })?;

        let result = if pending.deadline.is_some_and(|deadline| Utc::now() > deadline) {
            StepResult::failure(
                fault_kind::APPROVAL_TIMEOUT,
                "approval decision arrived after the step's deadline",
                0,
            )
        } else {
            match decision {
                ApprovalDecision::Approve => {
                    StepResult::success(serde_json::json!({ "approved": true }), 0)
                }
                ApprovalDecision::Reject => StepResult::failure(
                    fault_kind::APPROVAL_REJECTED,
                    "approval was rejected",
                    0,
                ),
            }
        };

        run.status = RunStatus::Running;
        let mut store = BindingStore::from_map(run.bindings.clone());

        // A rejected gate under retry policy re-requests approval instead of
        // consuming the failure.
        if !result.is_success() {
            if let OnFailure::Retry(n) = step.spec.on_failure {
                if pending.attempt <= n {
                    let next = PendingApproval {
                        attempt: pending.attempt + 1,
                        requested_at: Utc::now(),
                        deadline: step
                            .spec
                            .timeout_ms
                            .map(|ms| Utc::now() + chrono::Duration::milliseconds(ms as i64)),
                        ..pending
                    };
                    if let Some(record) = run.record_mut(&next.step_id) {
                        record.attempt = next.attempt;
                    }
                    run.approval = Some(next);
                    run.status = RunStatus::AwaitingApproval;
                    self.save(&mut run, &store).await?;
                    tracing::info!(run_id = %run_id, "approval re-requested after rejection");
                    return Ok(run);
                }
            }
        }

        // Finalize the gate's record in place.
        let attempt = pending.attempt;
        let success = result.is_success();
        if let Some(record) = run.record_mut(&pending.step_id) {
            record.status = if success { StepStatus::Success } else { StepStatus::Failed };
            record.attempt = attempt;
            record.finished_at = Some(Utc::now());
            record.output = result.output.clone();
            record.error = result.error.clone();
        }

        let outcome = if success {
            if let Some(binding) = &step.spec.output {
                store
                    .set(binding, result.output.clone().unwrap_or(Value::Null))
                    .map_err(|e| EngineError::Fault(e.to_string()))?;
            }
            UnitOutcome::Advance { failed: Some(false) }
        } else {
            let fault = result.error.clone().unwrap_or_else(|| {
                StepFault::new(fault_kind::APPROVAL_REJECTED, "approval was rejected")
            });
            self.failure_outcome(program, step, fault, &mut run, &mut store)
                .await?
        };

        match outcome {
            UnitOutcome::Advance { .. } => {
                run.cursor += 1;
                self.save(&mut run, &store).await?;
                self.drive(program, run, store).await
            }
            UnitOutcome::FailRun(message) => {
                self.finish(&mut run, &store, RunStatus::Failed, Some(message))
                    .await?;
                Ok(run)
            }
            UnitOutcome::Suspend | UnitOutcome::AbortRun => {
                Err(EngineError::Fault("unexpected outcome for approval resume".into()))
            }
        }
    }

    /// Re-enter an interrupted run (checkpointed as `running` with no live
    /// loop) at its cursor. Already-terminal units and group children are not
    /// re-executed.
    pub async fn recover(
        &self,
        run_id: Uuid,
        program: &Program,
    ) -> Result<RunState, EngineError> {
        let run = self.checkpoint.load(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(EngineError::NotSuspended(run_id));
        }
        let store = BindingStore::from_map(run.bindings.clone());
        tracing::info!(
            run_id = %run_id,
            cursor = run.cursor,
            "recovering interrupted workflow run"
        );
        self.drive(program, run, store).await
    }

    /// Request cancellation of a run.
    ///
    /// A live run's loop observes the token and finishes as `aborted`; a run
    /// suspended on approval is aborted directly.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        if let Some((_, token)) = self.cancellations.remove(&run_id) {
            token.cancel();
            tracing::info!(run_id = %run_id, "cancellation requested");
            return Ok(());
        }

        let mut run = self
            .checkpoint
            .load(run_id)
            .await
            .map_err(|_| EngineError::RunNotFound(run_id))?;
        if run.status == RunStatus::AwaitingApproval {
            run.approval = None;
            run.status = RunStatus::Aborted;
            run.error = Some("run cancelled".to_string());
            run.completed_at = Some(Utc::now());
            self.checkpoint.save(&mut run).await?;
            tracing::info!(run_id = %run_id, "suspended run aborted");
            Ok(())
        } else {
            Err(EngineError::RunNotFound(run_id))
        }
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Register a cancellation token, run the loop, and finalize.
    async fn drive(
        &self,
        program: &Program,
        mut run: RunState,
        mut store: BindingStore,
    ) -> Result<RunState, EngineError> {
        let cancel = CancellationToken::new();
        self.cancellations.insert(run.run_id, cancel.clone());

        let result = self.run_loop(program, &mut run, &mut store, &cancel).await;
        self.cancellations.remove(&run.run_id);

        match result {
            Ok(()) => Ok(run),
            Err(e) => {
                // Engine faults terminate the run regardless of policy.
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
                run.completed_at = Some(Utc::now());
                let _ = self.checkpoint.save(&mut run).await;
                Err(e)
            }
        }
    }

    async fn run_loop(
        &self,
        program: &Program,
        run: &mut RunState,
        store: &mut BindingStore,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut prev_failed = last_step_failed(run);

        while run.cursor < program.units.len() {
            if cancel.is_cancelled() {
                return self
                    .finish(run, store, RunStatus::Aborted, Some("run cancelled".to_string()))
                    .await;
            }

            let unit = &program.units[run.cursor];
            let outcome = match unit {
                ExecutionUnit::Step(step) => {
                    self.run_single(program, step, run, store, prev_failed, cancel)
                        .await?
                }
                ExecutionUnit::Group(group) => {
                    self.run_group(program, group, run, store, prev_failed, cancel)
                        .await?
                }
            };

            match outcome {
                UnitOutcome::Advance { failed } => {
                    if let Some(failed) = failed {
                        prev_failed = failed;
                    }
                    run.cursor += 1;
                    self.save(run, store).await?;
                }
                UnitOutcome::Suspend => {
                    run.status = RunStatus::AwaitingApproval;
                    self.save(run, store).await?;
                    tracing::info!(run_id = %run.run_id, "run suspended awaiting approval");
                    return Ok(());
                }
                UnitOutcome::FailRun(message) => {
                    return self.finish(run, store, RunStatus::Failed, Some(message)).await;
                }
                UnitOutcome::AbortRun => {
                    return self
                        .finish(run, store, RunStatus::Aborted, Some("run cancelled".to_string()))
                        .await;
                }
            }
        }

        self.finish(run, store, RunStatus::Success, None).await
    }

    // -----------------------------------------------------------------------
    // Single steps
    // -----------------------------------------------------------------------

    async fn run_single(
        &self,
        program: &Program,
        step: &CompiledStep,
        run: &mut RunState,
        store: &mut BindingStore,
        prev_failed: bool,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, EngineError> {
        // Recovery: the unit may already be terminal from before a restart.
        if let Some(record) = run.record(step.id()) {
            if record.status.is_terminal() {
                let failed = record.status == StepStatus::Failed;
                return Ok(UnitOutcome::Advance { failed: Some(failed) });
            }
        }

        // Conditional gate: false or malformed both skip, never fail.
        if let Some(reason) = self.gate_skip_reason(step, store, prev_failed) {
            self.record_skip(run, step.id(), reason);
            return Ok(UnitOutcome::Advance { failed: None });
        }

        if step.spec.kind == StepKind::Approval {
            return self.suspend_for_approval(step, run, store, cancel).await;
        }

        let started_at = Utc::now();
        let params = match self.resolve_params(step, store)? {
            Ok(params) => params,
            Err(fault) => {
                // Strict-mode resolution failure: a deterministic step
                // failure, so the retry ladder is skipped.
                let result = StepResult {
                    status: runbook_types::workflow::StepOutcome::Failure,
                    output: None,
                    error: Some(fault),
                    duration_ms: 0,
                };
                return self
                    .complete_step(program, step, run, store, result, 1, started_at)
                    .await;
            }
        };

        let backoff = RetryBackoff::new(self.config.retry_base_delay);
        let (result, attempts) = invoke_step(
            &self.registry,
            backoff,
            run.run_id,
            &step.spec,
            &params,
            cancel,
        )
        .await;

        self.complete_step(program, step, run, store, result, attempts, started_at)
            .await
    }

    /// Write the record for a finished invocation and apply failure policy.
    async fn complete_step(
        &self,
        program: &Program,
        step: &CompiledStep,
        run: &mut RunState,
        store: &mut BindingStore,
        result: StepResult,
        attempts: u32,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<UnitOutcome, EngineError> {
        let success = result.is_success();
        run.step_results.push(StepRecord {
            step_id: step.id().to_string(),
            status: if success { StepStatus::Success } else { StepStatus::Failed },
            attempt: attempts,
            started_at,
            finished_at: Some(Utc::now()),
            output: result.output.clone(),
            error: result.error.clone(),
            skip_reason: None,
        });

        if success {
            if let Some(binding) = &step.spec.output {
                store
                    .set(binding, result.output.unwrap_or(Value::Null))
                    .map_err(|e| EngineError::Fault(e.to_string()))?;
            }
            return Ok(UnitOutcome::Advance { failed: Some(false) });
        }

        let fault = result
            .error
            .unwrap_or_else(|| StepFault::new("unknown", "executor reported failure"));

        if fault.kind == fault_kind::CANCELLED {
            return Ok(UnitOutcome::AbortRun);
        }

        tracing::warn!(
            run_id = %run.run_id,
            step_id = step.id(),
            error = %fault,
            attempts,
            "step failed"
        );
        self.failure_outcome(program, step, fault, run, store).await
    }

    /// Apply a step's `onFailure` policy after its record has been written.
    /// Retries are already exhausted by this point, so `Retry` aborts.
    async fn failure_outcome(
        &self,
        program: &Program,
        step: &CompiledStep,
        fault: StepFault,
        run: &mut RunState,
        store: &mut BindingStore,
    ) -> Result<UnitOutcome, EngineError> {
        match &step.spec.on_failure {
            OnFailure::Continue => Ok(UnitOutcome::Advance { failed: Some(true) }),
            OnFailure::Abort | OnFailure::Retry(_) => Ok(UnitOutcome::FailRun(format!(
                "step '{}' failed: {fault}",
                step.id()
            ))),
            OnFailure::Rollback(target) => {
                self.run_compensation(program, target, run, store).await?;
                Ok(UnitOutcome::FailRun(format!(
                    "step '{}' failed (rolled back via '{target}'): {fault}",
                    step.id()
                )))
            }
        }
    }

    /// Invoke a compensating step once, recording its outcome. Compensation
    /// runs with lenient templates, no retries, and no binding write; the run
    /// aborts afterwards either way.
    async fn run_compensation(
        &self,
        program: &Program,
        target: &str,
        run: &mut RunState,
        store: &mut BindingStore,
    ) -> Result<(), EngineError> {
        let step = program.find_step(target).ok_or_else(|| {
            EngineError::Fault(format!("rollback target '{target}' is not defined"))
        })?;

        tracing::info!(run_id = %run.run_id, target, "running compensating step");

        let started_at = Utc::now();
        let mut params = normalized_params(&step.spec.params);
        for param in &step.templates {
            let (value, unresolved) = store.resolve_lenient(&param.template);
            for reference in unresolved {
                tracing::warn!(
                    step_id = target,
                    reference = reference.as_str(),
                    "unresolved reference in compensation params"
                );
            }
            if let Some(slot) = params.pointer_mut(&param.pointer) {
                *slot = value;
            }
        }

        let result = match self.registry.get(step.spec.kind) {
            Some(executor) => {
                let request = StepRequest {
                    run_id: run.run_id,
                    step_id: step.id(),
                    kind: step.spec.kind,
                    params: &params,
                    timeout: step.spec.timeout_ms.map(Duration::from_millis),
                    cancel: CancellationToken::new(),
                };
                match step.spec.timeout_ms.map(Duration::from_millis) {
                    Some(bound) => match tokio::time::timeout(bound, executor.execute(request)).await
                    {
                        Ok(result) => result,
                        Err(_) => StepResult::failure(
                            fault_kind::TIMEOUT,
                            format!("compensation timed out after {}ms", bound.as_millis()),
                            bound.as_millis() as u64,
                        ),
                    },
                    None => executor.execute(request).await,
                }
            }
            None => StepResult::failure(
                fault_kind::EXECUTOR_MISSING,
                format!("no executor registered for kind '{}'", step.spec.kind),
                0,
            ),
        };

        let success = result.is_success();
        run.step_results.push(StepRecord {
            step_id: target.to_string(),
            status: if success { StepStatus::Success } else { StepStatus::Failed },
            attempt: 1,
            started_at,
            finished_at: Some(Utc::now()),
            output: result.output,
            error: result.error,
            skip_reason: None,
        });
        self.save(run, store).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Approval gates
    // -----------------------------------------------------------------------

    /// Suspend the run at an approval step. If an approval executor is
    /// registered it is invoked to deliver the request notification; delivery
    /// failures are logged, not fatal -- the gate still holds.
    async fn suspend_for_approval(
        &self,
        step: &CompiledStep,
        run: &mut RunState,
        store: &BindingStore,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, EngineError> {
        let mut params = normalized_params(&step.spec.params);
        for param in &step.templates {
            let (value, _unresolved) = store.resolve_lenient(&param.template);
            if let Some(slot) = params.pointer_mut(&param.pointer) {
                *slot = value;
            }
        }
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(executor) = self.registry.get(StepKind::Approval) {
            let request = StepRequest {
                run_id: run.run_id,
                step_id: step.id(),
                kind: StepKind::Approval,
                params: &params,
                timeout: step.spec.timeout_ms.map(Duration::from_millis),
                cancel: cancel.clone(),
            };
            let result = executor.execute(request).await;
            if !result.is_success() {
                tracing::warn!(
                    run_id = %run.run_id,
                    step_id = step.id(),
                    "approval notification delivery failed"
                );
            }
        }

        let now = Utc::now();
        run.approval = Some(PendingApproval {
            step_id: step.id().to_string(),
            prompt,
            attempt: 1,
            requested_at: now,
            deadline: step
                .spec
                .timeout_ms
                .map(|ms| now + chrono::Duration::milliseconds(ms as i64)),
        });
        run.step_results.push(StepRecord {
            step_id: step.id().to_string(),
            status: StepStatus::AwaitingApproval,
            attempt: 1,
            started_at: now,
            finished_at: None,
            output: None,
            error: None,
            skip_reason: None,
        });

        Ok(UnitOutcome::Suspend)
    }

    // -----------------------------------------------------------------------
    // Parallel groups
    // -----------------------------------------------------------------------

    async fn run_group(
        &self,
        program: &Program,
        group: &CompiledGroup,
        run: &mut RunState,
        store: &mut BindingStore,
        prev_failed: bool,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, EngineError> {
        let snapshot = store.snapshot();
        tracing::debug!(
            run_id = %run.run_id,
            children = group.children.len(),
            "processing parallel group"
        );

        // Buffered binding writes, keyed by child document order.
        let mut buffered: Vec<(usize, String, Value)> = Vec::new();
        // (child index, fault) for children that ended in failure.
        let mut failures: Vec<(usize, StepFault)> = Vec::new();
        let mut executed_any = false;
        let mut cancelled = false;

        // Recovery: children that are already terminal contribute their
        // checkpointed outputs and are not re-executed.
        let mut pending: Vec<usize> = Vec::new();
        for (idx, child) in group.children.iter().enumerate() {
            match run.record(child.id()) {
                Some(record) if record.status.is_terminal() => {
                    match record.status {
                        StepStatus::Success => {
                            executed_any = true;
                            if let Some(binding) = &child.spec.output {
                                buffered.push((
                                    idx,
                                    binding.clone(),
                                    record.output.clone().unwrap_or(Value::Null),
                                ));
                            }
                        }
                        StepStatus::Failed => {
                            executed_any = true;
                            let fault = record.error.clone().unwrap_or_else(|| {
                                StepFault::new("unknown", "step failed before recovery")
                            });
                            failures.push((idx, fault));
                        }
                        _ => {}
                    }
                }
                _ => pending.push(idx),
            }
        }

        // Gate and resolve serially against the group-start snapshot, then
        // spawn only the executor invocations.
        let semaphore = group
            .max_concurrency
            .or(self.config.default_max_concurrency)
            .map(|cap| Arc::new(Semaphore::new(cap)));
        let mut join_set: JoinSet<(usize, chrono::DateTime<Utc>, StepResult, u32)> =
            JoinSet::new();

        for idx in pending {
            let child = &group.children[idx];

            if let Some(reason) = self.gate_skip_reason(child, &snapshot, prev_failed) {
                self.record_skip(run, child.id(), reason);
                self.save(run, store).await?;
                continue;
            }

            let started_at = Utc::now();
            let params = match self.resolve_params(child, &snapshot)? {
                Ok(params) => params,
                Err(fault) => {
                    executed_any = true;
                    run.step_results.push(StepRecord {
                        step_id: child.id().to_string(),
                        status: StepStatus::Failed,
                        attempt: 1,
                        started_at,
                        finished_at: Some(Utc::now()),
                        output: None,
                        error: Some(fault.clone()),
                        skip_reason: None,
                    });
                    self.save(run, store).await?;
                    failures.push((idx, fault));
                    continue;
                }
            };

            let registry = Arc::clone(&self.registry);
            let spec = child.spec.clone();
            let run_id = run.run_id;
            let child_cancel = cancel.clone();
            let backoff = RetryBackoff::new(self.config.retry_base_delay);
            let permit_source = semaphore.clone();

            join_set.spawn(async move {
                let _permit = match permit_source {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let started_at = Utc::now();
                let (result, attempts) =
                    invoke_step(&registry, backoff, run_id, &spec, &params, &child_cancel).await;
                (idx, started_at, result, attempts)
            });
        }

        // All writes stay serialized through this collection loop; each child
        // is checkpointed as it completes to bound re-work on recovery.
        while let Some(joined) = join_set.join_next().await {
            let (idx, started_at, result, attempts) =
                joined.map_err(|e| EngineError::Fault(format!("task join error: {e}")))?;
            let child = &group.children[idx];
            executed_any = true;

            let success = result.is_success();
            run.step_results.push(StepRecord {
                step_id: child.id().to_string(),
                status: if success { StepStatus::Success } else { StepStatus::Failed },
                attempt: attempts,
                started_at,
                finished_at: Some(Utc::now()),
                output: result.output.clone(),
                error: result.error.clone(),
                skip_reason: None,
            });
            self.save(run, store).await?;

            if success {
                if let Some(binding) = &child.spec.output {
                    buffered.push((idx, binding.clone(), result.output.unwrap_or(Value::Null)));
                }
            } else {
                let fault = result
                    .error
                    .unwrap_or_else(|| StepFault::new("unknown", "executor reported failure"));
                if fault.kind == fault_kind::CANCELLED {
                    cancelled = true;
                } else {
                    tracing::warn!(
                        run_id = %run.run_id,
                        step_id = child.id(),
                        error = %fault,
                        "parallel child failed"
                    );
                    failures.push((idx, fault));
                }
            }
        }

        if cancelled || cancel.is_cancelled() {
            return Ok(UnitOutcome::AbortRun);
        }

        // Compensations for rollback-policy failures, in document order.
        failures.sort_by_key(|(idx, _)| *idx);
        for (idx, _fault) in &failures {
            if let OnFailure::Rollback(target) = &group.children[*idx].spec.on_failure {
                self.run_compensation(program, target, run, store).await?;
            }
        }

        // Merge buffered writes in document order; a collision is an engine
        // fault (the compiler rejects duplicate binding names up front).
        buffered.sort_by_key(|(idx, _, _)| *idx);
        store
            .merge(buffered.into_iter().map(|(_, name, value)| (name, value)))
            .map_err(|e| EngineError::Fault(e.to_string()))?;

        // Aggregate outcome: a child failing under an effective-abort policy
        // fails the group; `continue` failures do not.
        let aborting = failures.iter().find(|(idx, _)| {
            !matches!(group.children[*idx].spec.on_failure, OnFailure::Continue)
        });
        if let Some((idx, fault)) = aborting {
            return Ok(UnitOutcome::FailRun(format!(
                "parallel step '{}' failed: {fault}",
                group.children[*idx].id()
            )));
        }

        let failed = if executed_any { Some(!failures.is_empty()) } else { None };
        Ok(UnitOutcome::Advance { failed })
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    fn bind_inputs(
        &self,
        program: &Program,
        provided: &serde_json::Map<String, Value>,
        store: &mut BindingStore,
    ) -> Result<(), EngineError> {
        for input in &program.inputs {
            let value = match provided.get(&input.name) {
                Some(value) => value.clone(),
                None => match &input.default {
                    Some(default) => default.clone(),
                    None if input.required => {
                        return Err(EngineError::MissingInput(input.name.clone()));
                    }
                    None => continue,
                },
            };
            store
                .set(&input.name, value)
                .map_err(|e| EngineError::Fault(e.to_string()))?;
        }

        for name in provided.keys() {
            if !program.inputs.iter().any(|i| &i.name == name) {
                tracing::warn!(input = name.as_str(), "ignoring undeclared input");
            }
        }
        Ok(())
    }

    /// Evaluate a step's `onlyIf` gate. Returns the skip reason when the step
    /// should not run; malformed expressions skip rather than fail.
    fn gate_skip_reason(
        &self,
        step: &CompiledStep,
        store: &BindingStore,
        prev_failed: bool,
    ) -> Option<String> {
        let condition = step.spec.only_if.as_deref()?;
        match self.evaluator.evaluate(condition, store, prev_failed) {
            Ok(true) => None,
            Ok(false) => Some(format!("condition '{condition}' evaluated to false")),
            Err(e) => {
                tracing::warn!(step_id = step.id(), error = %e, "condition error, skipping step");
                Some(format!("condition '{condition}' could not be evaluated: {e}"))
            }
        }
    }

    fn record_skip(&self, run: &mut RunState, step_id: &str, reason: String) {
        tracing::debug!(run_id = %run.run_id, step_id, reason = reason.as_str(), "step skipped");
        let now = Utc::now();
        run.step_results.push(StepRecord {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            attempt: 0,
            started_at: now,
            finished_at: Some(now),
            output: None,
            error: None,
            skip_reason: Some(reason),
        });
    }

    /// Resolve a step's params against the store. The outer `Result` is an
    /// engine fault; the inner one is a step-level `binding_resolution`
    /// failure (strict mode only).
    fn resolve_params(
        &self,
        step: &CompiledStep,
        store: &BindingStore,
    ) -> Result<Result<Value, StepFault>, EngineError> {
        let mut params = normalized_params(&step.spec.params);
        for param in &step.templates {
            let value = if self.config.strict_templates {
                match store.resolve(&param.template) {
                    Ok(value) => value,
                    Err(e) => {
                        return Ok(Err(StepFault::new(
                            fault_kind::BINDING_RESOLUTION,
                            format!("params{}: {e}", param.pointer),
                        )));
                    }
                }
            } else {
                let (value, unresolved) = store.resolve_lenient(&param.template);
                for reference in unresolved {
                    tracing::warn!(
                        step_id = step.id(),
                        reference = reference.as_str(),
                        "unresolved template reference left empty"
                    );
                }
                value
            };
            let slot = params.pointer_mut(&param.pointer).ok_or_else(|| {
                EngineError::Fault(format!(
                    "template pointer '{}' missing from params of step '{}'",
                    param.pointer,
                    step.id()
                ))
            })?;
            *slot = value;
        }
        Ok(Ok(params))
    }

    /// Mirror the store into the run state and checkpoint.
    async fn save(&self, run: &mut RunState, store: &BindingStore) -> Result<(), EngineError> {
        run.bindings = store.as_map().clone();
        Ok(self.checkpoint.save(run).await?)
    }

    async fn finish(
        &self,
        run: &mut RunState,
        store: &BindingStore,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        run.status = status;
        run.error = error;
        run.completed_at = Some(Utc::now());
        self.save(run, store).await?;
        tracing::info!(run_id = %run.run_id, status = ?status, "run finished");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Effective `previous_step_failed` derived from the records: the status of
/// the most recent executed (non-skipped) step. Skips leave it untouched.
fn last_step_failed(run: &RunState) -> bool {
    run.step_results
        .iter()
        .rev()
        .find(|r| matches!(r.status, StepStatus::Success | StepStatus::Failed))
        .is_some_and(|r| r.status == StepStatus::Failed)
}

/// Null params (absent in the document) behave as an empty object.
fn normalized_params(params: &Value) -> Value {
    if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params.clone()
    }
}

/// Invoke a step's executor, enforcing the timeout and cancellation bounds
/// and walking the `retry:<n>` ladder with exponential backoff. Returns the
/// final result and the number of invocations made.
async fn invoke_step(
    registry: &ExecutorRegistry,
    backoff: RetryBackoff,
    run_id: Uuid,
    spec: &StepSpec,
    params: &Value,
    cancel: &CancellationToken,
) -> (StepResult, u32) {
    let max_attempts = match spec.on_failure {
        OnFailure::Retry(n) => n + 1,
        _ => 1,
    };
    let timeout = spec.timeout_ms.map(Duration::from_millis);

    let Some(executor) = registry.get(spec.kind) else {
        return (
            StepResult::failure(
                fault_kind::EXECUTOR_MISSING,
                format!("no executor registered for kind '{}'", spec.kind),
                0,
            ),
            1,
        );
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let request = StepRequest {
            run_id,
            step_id: &spec.id,
            kind: spec.kind,
            params,
            timeout,
            cancel: cancel.clone(),
        };

        let invocation = executor.execute(request);
        let bounded = async {
            match timeout {
                Some(bound) => match tokio::time::timeout(bound, invocation).await {
                    Ok(result) => result,
                    Err(_) => StepResult::failure(
                        fault_kind::TIMEOUT,
                        format!("step timed out after {}ms", bound.as_millis()),
                        bound.as_millis() as u64,
                    ),
                },
                None => invocation.await,
            }
        };
        let result = tokio::select! {
            result = bounded => result,
            _ = cancel.cancelled() => {
                StepResult::failure(fault_kind::CANCELLED, "run cancelled", 0)
            }
        };

        let was_cancelled = cancel.is_cancelled()
            || result
                .error
                .as_ref()
                .is_some_and(|f| f.kind == fault_kind::CANCELLED);
        if result.is_success() || attempt >= max_attempts || was_cancelled {
            return (result, attempt);
        }

        let delay = backoff.delay_after(attempt);
        tracing::warn!(
            step_id = spec.id.as_str(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "step failed, backing off before retry"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return (
                    StepResult::failure(fault_kind::CANCELLED, "run cancelled", 0),
                    attempt,
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
