//! Built-in step executors.
//!
//! Concrete [`StepExecutor`](runbook_core::workflow::executor::StepExecutor)
//! implementations for the step kinds the engine ships batteries for:
//! `command` (shell), `http` (reqwest), `wait` (timer), and `message`
//! (log-sink notification). `agent` and `delegate` carry application-specific
//! domain logic and are registered by the embedder.

pub mod command;
pub mod http;
pub mod message;
pub mod wait;

use std::sync::Arc;

use runbook_core::workflow::executor::ExecutorRegistry;
use runbook_types::workflow::StepKind;

pub use command::CommandExecutor;
pub use http::HttpExecutor;
pub use message::MessageExecutor;
pub use wait::WaitExecutor;

/// Fault kind for malformed or missing step params.
pub const INVALID_PARAMS: &str = "invalid_params";

/// Registry pre-wired with the built-in executors.
pub fn builtin_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(StepKind::Command, Arc::new(CommandExecutor::new()));
    registry.register(StepKind::Http, Arc::new(HttpExecutor::new()));
    registry.register(StepKind::Wait, Arc::new(WaitExecutor));
    registry.register(StepKind::Message, Arc::new(MessageExecutor));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_batteries_included_kinds() {
        let registry = builtin_registry();
        for kind in [
            StepKind::Command,
            StepKind::Http,
            StepKind::Wait,
            StepKind::Message,
        ] {
            assert!(registry.contains(kind), "missing executor for {kind}");
        }
        // Application-owned kinds stay unwired.
        assert!(!registry.contains(StepKind::Agent));
        assert!(!registry.contains(StepKind::Delegate));
        assert!(!registry.contains(StepKind::Approval));
    }
}
