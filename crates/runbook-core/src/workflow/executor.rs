//! The step executor interface and kind registry.
//!
//! The engine owns sequencing, binding resolution, and failure policy; the
//! domain logic of actually running a shell command, making an HTTP call, or
//! delivering a notification lives behind [`StepExecutor`]. One implementation
//! is registered per [`StepKind`] in an [`ExecutorRegistry`] built at startup;
//! adding a kind means adding one registration, not editing a dispatch switch.
//!
//! Executors report failure through [`StepResult`], never by panicking; the
//! engine routes failures through the step's `onFailure` policy.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use runbook_types::workflow::{StepKind, StepResult};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an executor receives for one invocation.
///
/// `params` arrives fully resolved: all `${...}` templates have been
/// substituted against the binding store before dispatch.
#[derive(Debug, Clone)]
pub struct StepRequest<'a> {
    pub run_id: Uuid,
    pub step_id: &'a str,
    pub kind: StepKind,
    pub params: &'a Value,
    /// The step's `timeoutMs`, if declared. The engine also enforces this
    /// bound; it is passed through so executors can propagate it to their
    /// own clients.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation: fired when the run is cancelled.
    pub cancel: CancellationToken,
}

/// Boxed future returned by executors (object-safe async).
pub type BoxedStepFuture<'a> = Pin<Box<dyn Future<Output = StepResult> + Send + 'a>>;

/// Uniform contract implemented once per step kind.
pub trait StepExecutor: Send + Sync {
    fn execute<'a>(&'a self, request: StepRequest<'a>) -> BoxedStepFuture<'a>;
}

/// Lookup table from step kind to executor, built at startup.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for a kind, replacing any previous registration.
    pub fn register(&mut self, kind: StepKind, executor: Arc<dyn StepExecutor>) -> &mut Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.executors.contains_key(&kind)
    }

    pub fn registered_kinds(&self) -> impl Iterator<Item = StepKind> + '_ {
        self.executors.keys().copied()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoExecutor;

    impl StepExecutor for EchoExecutor {
        fn execute<'a>(&'a self, request: StepRequest<'a>) -> BoxedStepFuture<'a> {
            Box::pin(async move { StepResult::success(request.params.clone(), 1) })
        }
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let mut registry = ExecutorRegistry::new();
        registry.register(StepKind::Message, Arc::new(EchoExecutor));

        assert!(registry.contains(StepKind::Message));
        assert!(!registry.contains(StepKind::Http));

        let executor = registry.get(StepKind::Message).unwrap();
        let params = json!({ "text": "hi" });
        let result = executor
            .execute(StepRequest {
                run_id: Uuid::now_v7(),
                step_id: "echo",
                kind: StepKind::Message,
                params: &params,
                timeout: None,
                cancel: CancellationToken::new(),
            })
            .await;
        assert!(result.is_success());
        assert_eq!(result.output, Some(params));
    }

    #[test]
    fn test_register_replaces_previous() {
        let mut registry = ExecutorRegistry::new();
        registry.register(StepKind::Wait, Arc::new(EchoExecutor));
        registry.register(StepKind::Wait, Arc::new(EchoExecutor));
        assert_eq!(registry.registered_kinds().count(), 1);
    }
}
