//! Workflow domain types for Runbook.
//!
//! Defines the parsed workflow document (`WorkflowDefinition`, `StepSpec`,
//! `ParallelGroup`), the per-run execution state (`RunState`, `StepRecord`),
//! the executor return shape (`StepResult`), and the final result document
//! assembled by the reporter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition (parsed document)
// ---------------------------------------------------------------------------

/// A parsed, immutable workflow document.
///
/// Produced by the compiler from a YAML/JSON tree; the document keys follow
/// the source format (`onFailure`, `onlyIf`, `timeoutMs`, `maxConcurrency`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name (required, non-empty).
    pub name: String,
    /// Optional version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared input parameters, bound into the store before the first step.
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Ordered steps; entries are either a single step or a parallel group.
    pub steps: Vec<StepNode>,
    /// Binding names surfaced in the final result document.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A declared workflow input parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Binding name under which the input value is stored.
    pub name: String,
    /// Whether a run must supply this input (no default).
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller does not supply one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// One entry in a workflow's `steps` list.
///
/// Untagged: an object carrying a `parallel` key is a group, anything else
/// must parse as a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepNode {
    /// A parallel group wrapping child steps scheduled concurrently.
    Group(ParallelGroup),
    /// A single unit of work.
    Step(StepSpec),
}

/// A set of child steps that are scheduled concurrently as one wave.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    /// Child steps; all are dispatched before any result is merged.
    pub parallel: Vec<StepSpec>,
    /// Optional display name for the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Upper bound on concurrently running children (None = unbounded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// One unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Step ID, unique across the whole workflow (including group children).
    pub id: String,
    /// The kind of step; selects the executor.
    pub kind: StepKind,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Kind-specific configuration. String leaves may contain `${...}`
    /// references that are resolved against the binding store at dispatch.
    #[serde(default)]
    pub params: Value,
    /// Failure policy applied when the executor reports a failure.
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Optional condition evaluated against bindings before execution.
    /// When false the step is recorded as skipped, never as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_if: Option<String>,
    /// Per-step timeout; absence means no timeout beyond the executor default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Binding name under which a successful output is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// The closed set of step kinds the engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Command,
    Http,
    Message,
    Agent,
    Approval,
    Wait,
    Delegate,
}

impl StepKind {
    /// Wire name of the kind, matching the document format.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Command => "command",
            StepKind::Http => "http",
            StepKind::Message => "message",
            StepKind::Agent => "agent",
            StepKind::Approval => "approval",
            StepKind::Wait => "wait",
            StepKind::Delegate => "delegate",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure policy
// ---------------------------------------------------------------------------

/// Per-step failure policy, written as a string in the document:
/// `abort`, `continue`, `retry:<n>`, or `rollback:<stepId>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OnFailure {
    /// Stop the run at the first failure (the default).
    Abort,
    /// Re-invoke the step up to `n` additional times with backoff,
    /// then behave as `Abort`.
    Retry(u32),
    /// Record the failure and proceed to the next unit.
    Continue,
    /// Invoke the named compensating step, then behave as `Abort`.
    Rollback(String),
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Abort
    }
}

impl std::str::FromStr for OnFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "abort" => return Ok(OnFailure::Abort),
            "continue" => return Ok(OnFailure::Continue),
            _ => {}
        }
        if let Some(n) = s.strip_prefix("retry:") {
            return n
                .trim()
                .parse::<u32>()
                .map(OnFailure::Retry)
                .map_err(|_| format!("invalid retry count in '{s}'"));
        }
        if let Some(target) = s.strip_prefix("rollback:") {
            let target = target.trim();
            if target.is_empty() {
                return Err(format!("missing rollback target in '{s}'"));
            }
            return Ok(OnFailure::Rollback(target.to_string()));
        }
        Err(format!(
            "unknown onFailure policy '{s}' (expected abort, continue, retry:<n>, or rollback:<stepId>)"
        ))
    }
}

impl TryFrom<String> for OnFailure {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<OnFailure> for String {
    fn from(policy: OnFailure) -> Self {
        match policy {
            OnFailure::Abort => "abort".to_string(),
            OnFailure::Continue => "continue".to_string(),
            OnFailure::Retry(n) => format!("retry:{n}"),
            OnFailure::Rollback(target) => format!("rollback:{target}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Aborted,
    AwaitingApproval,
}

impl RunStatus {
    /// Terminal statuses end the run; `AwaitingApproval` is suspended, not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Aborted)
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failed | StepStatus::Skipped)
    }
}

// ---------------------------------------------------------------------------
// Executor result
// ---------------------------------------------------------------------------

/// Whether an executor invocation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
}

/// Error payload reported by an executor or synthesized by the engine.
///
/// `kind` is a short machine-readable tag; engine-generated kinds are the
/// constants in [`fault_kind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFault {
    pub kind: String,
    pub message: String,
}

impl StepFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Error kinds the engine itself attaches to step failures.
pub mod fault_kind {
    /// Step exceeded its `timeoutMs` bound.
    pub const TIMEOUT: &str = "timeout";
    /// Approval decision arrived after the step's deadline.
    pub const APPROVAL_TIMEOUT: &str = "approval_timeout";
    /// Approval decision was a rejection.
    pub const APPROVAL_REJECTED: &str = "approval_rejected";
    /// Strict-mode template resolution failed for the step's params.
    pub const BINDING_RESOLUTION: &str = "binding_resolution";
    /// No executor is registered for the step's kind.
    pub const EXECUTOR_MISSING: &str = "executor_missing";
    /// The run was cancelled while the step was in flight.
    pub const CANCELLED: &str = "cancelled";
}

/// The value returned by a step executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: StepOutcome,
    /// JSON output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error payload on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFault>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(output: Value, duration_ms: u64) -> Self {
        Self {
            status: StepOutcome::Success,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(
        kind: impl Into<String>,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            status: StepOutcome::Failure,
            output: None,
            error: Some(StepFault::new(kind, message)),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepOutcome::Success
    }
}

// ---------------------------------------------------------------------------
// Run state (persisted per execution)
// ---------------------------------------------------------------------------

/// Outcome record for one step of a run. Appended once the step reaches a
/// per-step terminal state (or suspends on approval) and never mutated after
/// the run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    /// Total invocations made (1 + retries). Zero for skipped steps.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFault>,
    /// Why the step was skipped (condition false or malformed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// A pending approval gate recorded while a run is suspended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub step_id: String,
    /// Resolved prompt shown to the approver, if the step declared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// 1-based request number; increments when a rejection is retried.
    pub attempt: u32,
    pub requested_at: DateTime<Utc>,
    /// Deadline derived from the step's `timeoutMs`; a decision arriving
    /// later resolves to an `approval_timeout` failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// Decision supplied when resuming a run suspended at an approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Mutable, persisted state of one workflow execution.
///
/// Checkpointed after every execution unit (and every parallel child)
/// completes; `cursor` indexes the next unit so a resumed run re-enters the
/// loop without re-executing terminal work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Index of the next execution unit in the compiled program.
    pub cursor: usize,
    /// Current binding-store snapshot (name -> JSON value).
    pub bindings: serde_json::Map<String, Value>,
    pub step_results: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Run-level error message when `status` is `failed` or `aborted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present while `status` is `awaiting_approval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<PendingApproval>,
}

impl RunState {
    /// Create the state for a freshly started run.
    pub fn new(workflow_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Running,
            cursor: 0,
            bindings: serde_json::Map::new(),
            step_results: Vec::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            approval: None,
        }
    }

    /// Latest record for a step, if any.
    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.step_results.iter().rev().find(|r| r.step_id == step_id)
    }

    /// Mutable access to the latest record for a step.
    pub fn record_mut(&mut self, step_id: &str) -> Option<&mut StepRecord> {
        self.step_results
            .iter_mut()
            .rev()
            .find(|r| r.step_id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Result document (reporter output)
// ---------------------------------------------------------------------------

/// Final (or partial) result of a run, assembled by the reporter.
///
/// Declared outputs missing from bindings are reported as `null` and listed
/// in `missing_outputs`, never silently omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDocument {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    pub outputs: serde_json::Map<String, Value>,
    pub missing_outputs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
