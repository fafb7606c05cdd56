//! JEXL evaluator for step `onlyIf` gates.
//!
//! Conditions are evaluated against the binding store plus the
//! `previous_step_failed` pseudo-variable. Bound values appear at the top
//! level of the expression context, so `greet == 'hello'` reads the `greet`
//! binding directly. Results are coerced to boolean with JS-like truthiness.
//!
//! Conditions are advisory gating, not safety-critical logic: the engine
//! treats an evaluation error as `false` and records it as the skip reason.
//!
//! **Security note:** bound values are always passed as context objects,
//! never interpolated into expression strings.

use serde_json::{Value, json};

use super::bindings::BindingStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from condition evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with string-helper transforms pre-registered.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    /// Create a new evaluator with `contains` and friends registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an `onlyIf` expression to a boolean.
    ///
    /// The context is the binding map plus `previous_step_failed`.
    pub fn evaluate(
        &self,
        expression: &str,
        bindings: &BindingStore,
        previous_step_failed: bool,
    ) -> Result<bool, ConditionError> {
        let mut context = bindings.as_map().clone();
        context.insert(
            "previous_step_failed".to_string(),
            Value::Bool(previous_step_failed),
        );

        let result = self
            .evaluator
            .eval_in_context(expression, &Value::Object(context))
            .map_err(|e| ConditionError::EvalFailed(e.to_string()))?;

        Ok(truthy(&result))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// JS-like truthiness coercion.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
