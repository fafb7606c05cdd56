//! Append-only binding store shared across a workflow run.
//!
//! Values produced by completed steps are bound by name and never overwritten;
//! a duplicate write is an engine fault, not a recoverable step failure.
//! During a parallel group each child resolves against a read-only snapshot
//! taken at group start, and child writes are buffered and merged (in document
//! order) only after the whole group completes -- siblings never observe each
//! other's bindings.

use serde_json::Value;
use thiserror::Error;

use super::template::{Template, TemplateError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from binding-store operations.
#[derive(Debug, Error)]
pub enum BindingError {
    /// A name was bound twice. Always escalated to an engine fault.
    #[error("binding '{0}' is already set")]
    Duplicate(String),

    /// Strict-mode template resolution failed.
    #[error(transparent)]
    Template(#[from] TemplateError),
}

// ---------------------------------------------------------------------------
// BindingStore
// ---------------------------------------------------------------------------

/// The shared map of named values produced by inputs and completed steps.
#[derive(Debug, Clone, Default)]
pub struct BindingStore {
    values: serde_json::Map<String, Value>,
}

impl BindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a checkpointed snapshot.
    pub fn from_map(values: serde_json::Map<String, Value>) -> Self {
        Self { values }
    }

    /// Bind a value under a new name. Rejects overwrites.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), BindingError> {
        if self.values.contains_key(name) {
            return Err(BindingError::Duplicate(name.to_string()));
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// The underlying map, for checkpointing and expression contexts.
    pub fn as_map(&self) -> &serde_json::Map<String, Value> {
        &self.values
    }

    /// Read-only snapshot handed to the children of a parallel group.
    pub fn snapshot(&self) -> BindingStore {
        self.clone()
    }

    /// Merge buffered writes from a completed parallel group, in the
    /// document order of the children that produced them.
    pub fn merge(
        &mut self,
        buffered: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<(), BindingError> {
        for (name, value) in buffered {
            self.set(&name, value)?;
        }
        Ok(())
    }

    /// Resolve a template strictly: any unresolved reference is an error.
    pub fn resolve(&self, template: &Template) -> Result<Value, BindingError> {
        Ok(template.resolve(&self.values)?)
    }

    /// Resolve a template leniently: unresolved references render as the
    /// empty string and are returned for the caller to record as warnings.
    pub fn resolve_lenient(&self, template: &Template) -> (Value, Vec<String>) {
        template.resolve_lenient(&self.values)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let mut store = BindingStore::new();
        store.set("greet", json!("hello")).unwrap();
        assert_eq!(store.get("greet"), Some(&json!("hello")));
        assert!(store.get("missing").is_none());
        assert!(store.contains("greet"));
    }

    #[test]
    fn test_set_rejects_overwrite() {
        let mut store = BindingStore::new();
        store.set("x", json!(1)).unwrap();
        let err = store.set("x", json!(2)).unwrap_err();
        assert!(matches!(err, BindingError::Duplicate(name) if name == "x"));
        // First write survives.
        assert_eq!(store.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let mut store = BindingStore::new();
        store.set("before", json!(true)).unwrap();

        let snapshot = store.snapshot();
        store.set("after", json!(true)).unwrap();

        assert!(snapshot.contains("before"));
        assert!(!snapshot.contains("after"));
    }

    #[test]
    fn test_merge_in_order() {
        let mut store = BindingStore::new();
        store
            .merge(vec![
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
            ])
            .unwrap();
        assert_eq!(store.get("a"), Some(&json!(1)));
        assert_eq!(store.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_merge_collision_is_duplicate_error() {
        let mut store = BindingStore::new();
        store.set("a", json!(1)).unwrap();
        let err = store.merge(vec![("a".to_string(), json!(2))]).unwrap_err();
        assert!(matches!(err, BindingError::Duplicate(_)));
    }

    #[test]
    fn test_resolve_strict_and_lenient() {
        let mut store = BindingStore::new();
        store.set("greet", json!("hi")).unwrap();

        let template = Template::parse("say ${greet}").unwrap();
        assert_eq!(store.resolve(&template).unwrap(), json!("say hi"));

        let missing = Template::parse("say ${nope}").unwrap();
        assert!(store.resolve(&missing).is_err());
        let (value, unresolved) = store.resolve_lenient(&missing);
        assert_eq!(value, json!("say "));
        assert_eq!(unresolved, vec!["nope"]);
    }
}
