//! Workflow service: the caller-facing operations over the engine.
//!
//! One facade wiring compiler -> engine -> reporter, exposing the operations
//! an external surface needs: `run`, `resume`, `status`, `validate`,
//! `dry_run`, and `cancel`. Documents arrive as parsed YAML/JSON trees; use
//! [`crate::workflow::compiler::parse_yaml`] for YAML text.

use runbook_types::workflow::{
    ApprovalDecision, OnFailure, ResultDocument, RunState, StepKind,
};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::RunRepository;
use crate::workflow::compiler::{self, CompileIssue, ExecutionUnit, Program};
use crate::workflow::engine::{EngineConfig, EngineError, ExecutionEngine};
use crate::workflow::executor::ExecutorRegistry;
use crate::workflow::report::RunReporter;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by the workflow service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The document failed to compile; the issues carry paths and messages.
    #[error("workflow document is invalid ({} error(s))", .0.len())]
    Compile(Vec<CompileIssue>),

    /// Engine-level failure (checkpointing, faults, unknown runs).
    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// WorkflowService
// ---------------------------------------------------------------------------

/// One simulated entry of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    /// Index of the execution unit this step belongs to.
    pub unit: usize,
    pub step_id: String,
    pub kind: StepKind,
    /// Whether the step runs inside a parallel group.
    pub parallel: bool,
    /// Binding name the step would produce, if any.
    pub binding: Option<String>,
    pub on_failure: OnFailure,
}

/// Caller-facing facade over the execution engine.
pub struct WorkflowService<R: RunRepository> {
    engine: ExecutionEngine<R>,
}

impl<R: RunRepository + 'static> WorkflowService<R> {
    pub fn new(repo: R, registry: ExecutorRegistry) -> Self {
        Self {
            engine: ExecutionEngine::new(repo, registry),
        }
    }

    pub fn with_config(repo: R, registry: ExecutorRegistry, config: EngineConfig) -> Self {
        Self {
            engine: ExecutionEngine::with_config(repo, registry, config),
        }
    }

    /// Access the engine directly (for embedders needing `recover`).
    pub fn engine(&self) -> &ExecutionEngine<R> {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Compile and execute a workflow document, returning the run's result
    /// document. Compile warnings are logged; errors refuse execution.
    pub async fn run(
        &self,
        document: &Value,
        inputs: serde_json::Map<String, Value>,
    ) -> Result<ResultDocument, ServiceError> {
        let program = self.compile_for_execution(document)?;
        let run = self.engine.execute(&program, &inputs).await?;
        Ok(RunReporter::report(&run, &program.outputs))
    }

    /// Resume a run suspended at an approval gate.
    pub async fn resume(
        &self,
        run_id: Uuid,
        document: &Value,
        decision: ApprovalDecision,
    ) -> Result<ResultDocument, ServiceError> {
        let program = self.compile_for_execution(document)?;
        let run = self.engine.resume(run_id, &program, decision).await?;
        Ok(RunReporter::report(&run, &program.outputs))
    }

    /// Current persisted state of a run.
    pub async fn status(&self, run_id: Uuid) -> Result<RunState, ServiceError> {
        Ok(self.engine.checkpoint().load(run_id).await.map_err(EngineError::from)?)
    }

    /// Validate a document without executing it. Returns every issue found,
    /// warnings included.
    pub fn validate(&self, document: &Value) -> Vec<CompileIssue> {
        compiler::compile(document).issues
    }

    /// Simulate a run: the ordered step list that would be dispatched, with
    /// no executor invoked. Inputs are checked the way a real run would.
    pub fn dry_run(
        &self,
        document: &Value,
        inputs: &serde_json::Map<String, Value>,
    ) -> Result<Vec<PlannedStep>, ServiceError> {
        let program = self.compile_for_execution(document)?;

        for input in &program.inputs {
            if input.required && input.default.is_none() && !inputs.contains_key(&input.name) {
                return Err(ServiceError::Engine(EngineError::MissingInput(
                    input.name.clone(),
                )));
            }
        }

        let mut planned = Vec::new();
        for (unit_idx, unit) in program.units.iter().enumerate() {
            match unit {
                ExecutionUnit::Step(step) => planned.push(PlannedStep {
                    unit: unit_idx,
                    step_id: step.id().to_string(),
                    kind: step.spec.kind,
                    parallel: false,
                    binding: step.spec.output.clone(),
                    on_failure: step.spec.on_failure.clone(),
                }),
                ExecutionUnit::Group(group) => {
                    for child in &group.children {
                        planned.push(PlannedStep {
                            unit: unit_idx,
                            step_id: child.id().to_string(),
                            kind: child.spec.kind,
                            parallel: true,
                            binding: child.spec.output.clone(),
                            on_failure: child.spec.on_failure.clone(),
                        });
                    }
                }
            }
        }
        Ok(planned)
    }

    /// Request cancellation of a live or suspended run.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), ServiceError> {
        Ok(self.engine.cancel(run_id).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn compile_for_execution(&self, document: &Value) -> Result<Program, ServiceError> {
        let compilation = compiler::compile(document);
        for warning in compilation.warnings() {
            tracing::warn!(path = warning.path.as_str(), message = warning.message.as_str(), "compile warning");
        }
        if compilation.has_errors() {
            return Err(ServiceError::Compile(
                compilation
                    .issues
                    .into_iter()
                    .filter(|i| i.severity == compiler::Severity::Error)
                    .collect(),
            ));
        }
        compilation
            .program
            .ok_or_else(|| ServiceError::Engine(EngineError::Fault("compiler produced no program".into())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
