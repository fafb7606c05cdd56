//! Workflow document compilation: validation and execution-unit planning.
//!
//! `compile` turns a parsed YAML/JSON tree into an ordered list of execution
//! units (single steps and parallel groups) plus a list of issues. Compilation
//! never throws: hard errors (duplicate ids, unknown kinds, forward
//! references) suppress the program, while warnings (unknown keys, outputs
//! nothing produces) leave it runnable -- callers decide.
//!
//! `${...}` templates in step params are parsed here, once, so the engine
//! resolves pre-tokenized templates and reference checking can report precise
//! document paths.

use std::collections::{HashMap, HashSet};

use runbook_types::workflow::{InputSpec, OnFailure, StepKind, StepSpec};
use serde::Serialize;
use serde_json::Value;

use super::template::Template;

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// Severity of a compile issue. Errors prevent execution; warnings do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One validation finding, located by document path.
#[derive(Debug, Clone, Serialize)]
pub struct CompileIssue {
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

impl CompileIssue {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

impl std::fmt::Display for CompileIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{tag} at {}: {}", self.path, self.message)
    }
}

/// Result of compiling a workflow document.
///
/// `program` is present only when no error-severity issues were found.
#[derive(Debug)]
pub struct Compilation {
    pub program: Option<Program>,
    pub issues: Vec<CompileIssue>,
}

impl Compilation {
    pub fn errors(&self) -> impl Iterator<Item = &CompileIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CompileIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }
}

// ---------------------------------------------------------------------------
// Compiled program
// ---------------------------------------------------------------------------

/// A step with its `${...}` templates pre-parsed from params string leaves.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub spec: StepSpec,
    /// (JSON pointer into params, parsed template) for each string leaf
    /// containing at least one reference.
    pub templates: Vec<ParamTemplate>,
}

impl CompiledStep {
    pub fn id(&self) -> &str {
        &self.spec.id
    }
}

/// A parsed template anchored at a params location.
#[derive(Debug, Clone)]
pub struct ParamTemplate {
    /// JSON pointer into the step's params (e.g. `/headers/Authorization`).
    pub pointer: String,
    pub template: Template,
}

/// A group of steps scheduled concurrently as one execution unit.
#[derive(Debug, Clone)]
pub struct CompiledGroup {
    pub name: Option<String>,
    pub children: Vec<CompiledStep>,
    pub max_concurrency: Option<usize>,
}

/// One schedulable unit: a single step or a parallel group.
#[derive(Debug, Clone)]
pub enum ExecutionUnit {
    Step(CompiledStep),
    Group(CompiledGroup),
}

/// The compiled workflow: document-ordered execution units plus metadata.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub inputs: Vec<InputSpec>,
    pub units: Vec<ExecutionUnit>,
    pub outputs: Vec<String>,
}

impl Program {
    /// Look up any step (including group children) by id. Used for
    /// `rollback:<stepId>` compensation dispatch.
    pub fn find_step(&self, id: &str) -> Option<&CompiledStep> {
        self.units.iter().find_map(|unit| match unit {
            ExecutionUnit::Step(step) if step.id() == id => Some(step),
            ExecutionUnit::Step(_) => None,
            ExecutionUnit::Group(group) => {
                group.children.iter().find(|child| child.id() == id)
            }
        })
    }

    /// Total number of steps, counting group children.
    pub fn step_count(&self) -> usize {
        self.units
            .iter()
            .map(|unit| match unit {
                ExecutionUnit::Step(_) => 1,
                ExecutionUnit::Group(group) => group.children.len(),
            })
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Known document keys
// ---------------------------------------------------------------------------

const TOP_LEVEL_KEYS: &[&str] = &["name", "version", "description", "inputs", "steps", "outputs"];
const STEP_KEYS: &[&str] = &[
    "id", "kind", "name", "params", "onFailure", "onlyIf", "timeoutMs", "output",
];
const GROUP_KEYS: &[&str] = &["parallel", "name", "maxConcurrency"];

// ---------------------------------------------------------------------------
// Compile
// ---------------------------------------------------------------------------

/// Parse a YAML workflow document into the JSON tree `compile` consumes.
pub fn parse_yaml(yaml: &str) -> Result<Value, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| e.to_string())
}

/// Compile a workflow document into a program and a list of issues.
pub fn compile(document: &Value) -> Compilation {
    let mut issues = Vec::new();

    let Some(doc) = document.as_object() else {
        issues.push(CompileIssue::error("$", "workflow document must be an object"));
        return Compilation { program: None, issues };
    };

    for key in doc.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            issues.push(CompileIssue::warning(
                format!("$.{key}"),
                format!("unknown key '{key}'"),
            ));
        }
    }

    // -- name / version / description --
    let name = match doc.get("name") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::String(_)) => {
            issues.push(CompileIssue::error("$.name", "workflow name must not be empty"));
            String::new()
        }
        Some(_) => {
            issues.push(CompileIssue::error("$.name", "workflow name must be a string"));
            String::new()
        }
        None => {
            issues.push(CompileIssue::error("$.name", "missing required key 'name'"));
            String::new()
        }
    };
    let version = optional_string(doc, "version", &mut issues);
    let description = optional_string(doc, "description", &mut issues);

    // -- inputs --
    let inputs = compile_inputs(doc.get("inputs"), &mut issues);

    // -- steps --
    let units = compile_steps(doc.get("steps"), &mut issues);

    // -- outputs --
    let outputs = compile_outputs(doc.get("outputs"), &mut issues);

    // -- cross-step validation --
    validate_ids_and_policies(&units, &mut issues);
    validate_references(&inputs, &units, &mut issues);
    validate_outputs(&inputs, &units, &outputs, &mut issues);

    let has_errors = issues.iter().any(|i| i.severity == Severity::Error);
    let program = (!has_errors).then(|| Program {
        name,
        version,
        description,
        inputs,
        units,
        outputs,
    });

    Compilation { program, issues }
}

// ---------------------------------------------------------------------------
// Section compilers
// ---------------------------------------------------------------------------

fn optional_string(
    doc: &serde_json::Map<String, Value>,
    key: &str,
    issues: &mut Vec<CompileIssue>,
) -> Option<String> {
    match doc.get(key) {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.push(CompileIssue::error(
                format!("$.{key}"),
                format!("'{key}' must be a string"),
            ));
            None
        }
    }
}

fn compile_inputs(value: Option<&Value>, issues: &mut Vec<CompileIssue>) -> Vec<InputSpec> {
    let mut inputs = Vec::new();
    let Some(value) = value else {
        return inputs;
    };
    let Some(items) = value.as_array() else {
        issues.push(CompileIssue::error("$.inputs", "'inputs' must be an array"));
        return inputs;
    };

    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let path = format!("$.inputs[{i}]");
        match serde_json::from_value::<InputSpec>(item.clone()) {
            Ok(input) => {
                if !seen.insert(input.name.clone()) {
                    issues.push(CompileIssue::error(
                        path,
                        format!("duplicate input name '{}'", input.name),
                    ));
                } else {
                    inputs.push(input);
                }
            }
            Err(e) => issues.push(CompileIssue::error(path, e.to_string())),
        }
    }
    inputs
}

fn compile_outputs(value: Option<&Value>, issues: &mut Vec<CompileIssue>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    match serde_json::from_value::<Vec<String>>(value.clone()) {
        Ok(outputs) => outputs,
        Err(_) => {
            issues.push(CompileIssue::error(
                "$.outputs",
                "'outputs' must be an array of binding names",
            ));
            Vec::new()
        }
    }
}

fn compile_steps(value: Option<&Value>, issues: &mut Vec<CompileIssue>) -> Vec<ExecutionUnit> {
    let mut units = Vec::new();
    let Some(value) = value else {
        issues.push(CompileIssue::error("$.steps", "missing required key 'steps'"));
        return units;
    };
    let Some(items) = value.as_array() else {
        issues.push(CompileIssue::error("$.steps", "'steps' must be an array"));
        return units;
    };
    if items.is_empty() {
        issues.push(CompileIssue::error(
            "$.steps",
            "workflow must have at least one step",
        ));
        return units;
    }

    for (i, item) in items.iter().enumerate() {
        let path = format!("$.steps[{i}]");
        let is_group = item
            .as_object()
            .is_some_and(|obj| obj.contains_key("parallel"));
        if is_group {
            if let Some(group) = compile_group(item, &path, issues) {
                units.push(ExecutionUnit::Group(group));
            }
        } else if let Some(step) = compile_step(item, &path, issues) {
            units.push(ExecutionUnit::Step(step));
        }
    }
    units
}

fn compile_group(
    value: &Value,
    path: &str,
    issues: &mut Vec<CompileIssue>,
) -> Option<CompiledGroup> {
    let obj = value.as_object().expect("checked by caller");

    for key in obj.keys() {
        if !GROUP_KEYS.contains(&key.as_str()) {
            issues.push(CompileIssue::warning(
                format!("{path}.{key}"),
                format!("unknown key '{key}'"),
            ));
        }
    }

    let name = match obj.get("name") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.push(CompileIssue::error(
                format!("{path}.name"),
                "group name must be a string",
            ));
            None
        }
        None => None,
    };

    let max_concurrency = match obj.get("maxConcurrency") {
        None => None,
        Some(value) => match value.as_u64() {
            Some(0) | None => {
                issues.push(CompileIssue::error(
                    format!("{path}.maxConcurrency"),
                    "maxConcurrency must be an integer >= 1",
                ));
                None
            }
            Some(n) => Some(n as usize),
        },
    };

    let Some(children_raw) = obj.get("parallel").and_then(Value::as_array) else {
        issues.push(CompileIssue::error(
            format!("{path}.parallel"),
            "'parallel' must be an array of steps",
        ));
        return None;
    };
    if children_raw.is_empty() {
        issues.push(CompileIssue::error(
            format!("{path}.parallel"),
            "parallel group must contain at least one step",
        ));
        return None;
    }

    let mut children = Vec::new();
    for (j, child_raw) in children_raw.iter().enumerate() {
        let child_path = format!("{path}.parallel[{j}]");
        if child_raw
            .as_object()
            .is_some_and(|o| o.contains_key("parallel"))
        {
            issues.push(CompileIssue::error(
                child_path,
                "nested parallel groups are not supported",
            ));
            continue;
        }
        if let Some(child) = compile_step(child_raw, &child_path, issues) {
            if child.spec.kind == StepKind::Approval {
                issues.push(CompileIssue::error(
                    format!("{child_path}.kind"),
                    "approval steps cannot run inside a parallel group",
                ));
                continue;
            }
            children.push(child);
        }
    }

    Some(CompiledGroup {
        name,
        children,
        max_concurrency,
    })
}

fn compile_step(
    value: &Value,
    path: &str,
    issues: &mut Vec<CompileIssue>,
) -> Option<CompiledStep> {
    let Some(obj) = value.as_object() else {
        issues.push(CompileIssue::error(path, "step must be an object"));
        return None;
    };

    for key in obj.keys() {
        if !STEP_KEYS.contains(&key.as_str()) {
            issues.push(CompileIssue::warning(
                format!("{path}.{key}"),
                format!("unknown key '{key}'"),
            ));
        }
    }

    let spec = match serde_json::from_value::<StepSpec>(value.clone()) {
        Ok(spec) => spec,
        Err(e) => {
            issues.push(CompileIssue::error(path, e.to_string()));
            return None;
        }
    };

    if spec.timeout_ms == Some(0) {
        issues.push(CompileIssue::error(
            format!("{path}.timeoutMs"),
            "timeoutMs must be > 0",
        ));
    }

    // Pre-parse templates from params string leaves.
    let mut templates = Vec::new();
    let mut leaves = Vec::new();
    collect_string_leaves(&spec.params, String::new(), &mut leaves);
    for (pointer, text) in leaves {
        match Template::parse(&text) {
            Ok(template) => {
                if template.has_references() {
                    templates.push(ParamTemplate { pointer, template });
                }
            }
            Err(e) => issues.push(CompileIssue::error(
                format!("{path}.params{pointer}"),
                e.to_string(),
            )),
        }
    }

    Some(CompiledStep { spec, templates })
}

/// Collect (JSON pointer, string) pairs for every string leaf of a value.
fn collect_string_leaves(value: &Value, pointer: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => out.push((pointer, s.clone())),
        Value::Object(map) => {
            for (key, child) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_string_leaves(child, format!("{pointer}/{escaped}"), out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_string_leaves(child, format!("{pointer}/{i}"), out);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Cross-step validation
// ---------------------------------------------------------------------------

/// Iterate all steps with their document paths, group children included.
fn all_steps(units: &[ExecutionUnit]) -> Vec<(String, &CompiledStep)> {
    let mut steps = Vec::new();
    for (i, unit) in units.iter().enumerate() {
        match unit {
            ExecutionUnit::Step(step) => steps.push((format!("$.steps[{i}]"), step)),
            ExecutionUnit::Group(group) => {
                for (j, child) in group.children.iter().enumerate() {
                    steps.push((format!("$.steps[{i}].parallel[{j}]"), child));
                }
            }
        }
    }
    steps
}

fn validate_ids_and_policies(units: &[ExecutionUnit], issues: &mut Vec<CompileIssue>) {
    let steps = all_steps(units);
    let all_ids: HashSet<&str> = steps.iter().map(|(_, s)| s.id()).collect();

    let mut seen = HashSet::new();
    for (path, step) in &steps {
        if !seen.insert(step.id()) {
            issues.push(CompileIssue::error(
                format!("{path}.id"),
                format!("duplicate step id '{}'", step.id()),
            ));
        }

        match &step.spec.on_failure {
            OnFailure::Retry(0) => issues.push(CompileIssue::error(
                format!("{path}.onFailure"),
                "retry count must be >= 1",
            )),
            OnFailure::Rollback(target) => {
                if target == step.id() {
                    issues.push(CompileIssue::error(
                        format!("{path}.onFailure"),
                        format!("step '{}' cannot roll back to itself", step.id()),
                    ));
                } else if !all_ids.contains(target.as_str()) {
                    issues.push(CompileIssue::error(
                        format!("{path}.onFailure"),
                        format!("rollback target '{target}' is not a defined step"),
                    ));
                }
            }
            _ => {}
        }
    }
}

/// Enforce the forward-reference rule: every `${...}` root must be a declared
/// input or the binding of an earlier-producing step in document order.
/// Children of a parallel group see only bindings produced before the group.
fn validate_references(
    inputs: &[InputSpec],
    units: &[ExecutionUnit],
    issues: &mut Vec<CompileIssue>,
) {
    let mut available: HashSet<String> = inputs.iter().map(|i| i.name.clone()).collect();

    // Binding name -> producing step id, for collision diagnostics.
    let mut producers: HashMap<String, String> = HashMap::new();
    for input in inputs {
        producers.insert(input.name.clone(), format!("input '{}'", input.name));
    }

    fn check_step(
        step: &CompiledStep,
        path: &str,
        available: &HashSet<String>,
        sibling_outputs: &HashSet<String>,
        issues: &mut Vec<CompileIssue>,
    ) {
        for param in &step.templates {
            for (root, _offset) in param.template.references() {
                if available.contains(root) {
                    continue;
                }
                let message = if step.spec.output.as_deref() == Some(root) {
                    format!("step '{}' reads its own binding '{root}'", step.id())
                } else if sibling_outputs.contains(root) {
                    format!(
                        "binding '{root}' is produced by a sibling in the same parallel group and is not visible mid-wave"
                    )
                } else {
                    format!(
                        "reference to '{root}' does not resolve to an input or an earlier step's binding"
                    )
                };
                issues.push(CompileIssue::error(
                    format!("{path}.params{}", param.pointer),
                    message,
                ));
            }
        }
    }

    fn bind(
        step: &CompiledStep,
        path: &str,
        available: &mut HashSet<String>,
        producers: &mut HashMap<String, String>,
        issues: &mut Vec<CompileIssue>,
    ) {
        if let Some(binding) = &step.spec.output {
            if let Some(previous) = producers.get(binding) {
                issues.push(CompileIssue::error(
                    format!("{path}.output"),
                    format!("binding '{binding}' is already produced by {previous}"),
                ));
            } else {
                producers.insert(binding.clone(), format!("step '{}'", step.id()));
                available.insert(binding.clone());
            }
        }
    }

    let empty = HashSet::new();
    for (i, unit) in units.iter().enumerate() {
        match unit {
            ExecutionUnit::Step(step) => {
                let path = format!("$.steps[{i}]");
                check_step(step, &path, &available, &empty, issues);
                bind(step, &path, &mut available, &mut producers, issues);
            }
            ExecutionUnit::Group(group) => {
                let sibling_outputs: HashSet<String> = group
                    .children
                    .iter()
                    .filter_map(|c| c.spec.output.clone())
                    .collect();
                // Children resolve against the pre-group snapshot only.
                for (j, child) in group.children.iter().enumerate() {
                    let path = format!("$.steps[{i}].parallel[{j}]");
                    check_step(child, &path, &available, &sibling_outputs, issues);
                }
                for (j, child) in group.children.iter().enumerate() {
                    let path = format!("$.steps[{i}].parallel[{j}]");
                    bind(child, &path, &mut available, &mut producers, issues);
                }
            }
        }
    }
}

fn validate_outputs(
    inputs: &[InputSpec],
    units: &[ExecutionUnit],
    outputs: &[String],
    issues: &mut Vec<CompileIssue>,
) {
    let mut producible: HashSet<&str> = inputs.iter().map(|i| i.name.as_str()).collect();
    for (_, step) in all_steps(units) {
        if let Some(binding) = &step.spec.output {
            producible.insert(binding.as_str());
        }
    }
    for (i, output) in outputs.iter().enumerate() {
        if !producible.contains(output.as_str()) {
            issues.push(CompileIssue::warning(
                format!("$.outputs[{i}]"),
                format!("declared output '{output}' is never produced by any input or step"),
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
