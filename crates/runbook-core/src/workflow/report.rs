//! Final/partial result document assembly.
//!
//! The reporter reads a run's state and the workflow's declared outputs and
//! produces the [`ResultDocument`] handed back to callers. Declared outputs
//! absent from the bindings (a skipped producer, or a failure tolerated by
//! `onFailure: continue`) are reported as `null` and listed in
//! `missing_outputs` -- partial success stays visible in the document rather
//! than being silently flattened.

use runbook_types::workflow::{ResultDocument, RunState};
use serde_json::Value;

/// Assembles result documents from run state.
pub struct RunReporter;

impl RunReporter {
    /// Build the result document for a run against its declared outputs.
    pub fn report(run: &RunState, declared_outputs: &[String]) -> ResultDocument {
        let mut outputs = serde_json::Map::new();
        let mut missing_outputs = Vec::new();

        for name in declared_outputs {
            match run.bindings.get(name) {
                Some(value) => {
                    outputs.insert(name.clone(), value.clone());
                }
                None => {
                    outputs.insert(name.clone(), Value::Null);
                    missing_outputs.push(name.clone());
                }
            }
        }

        ResultDocument {
            run_id: run.run_id,
            status: run.status,
            started_at: run.started_at,
            completed_at: run.completed_at,
            steps: run.step_results.clone(),
            outputs,
            missing_outputs,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
