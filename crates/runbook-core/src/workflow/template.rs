//! `${...}` template parsing and resolution.
//!
//! A template string is parsed once into a token list (literal | reference),
//! so repeated resolution never re-scans the string and strict-mode errors can
//! report the exact byte offset of the offending reference. References are a
//! binding name optionally followed by a dotted path (`${report.summary.0}`);
//! numeric segments index into arrays.

use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from template parsing and strict-mode resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// `${` without a closing `}`.
    #[error("unterminated reference at offset {offset}")]
    Unterminated { offset: usize },

    /// `${}` or a reference with an empty path segment.
    #[error("empty reference at offset {offset}")]
    EmptyReference { offset: usize },

    /// Strict mode only: the reference did not resolve to a bound value.
    #[error("unresolved reference '${{{reference}}}' at offset {offset}")]
    Unresolved { reference: String, offset: usize },
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// One parsed token of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Reference {
        /// Root binding name (first path segment).
        name: String,
        /// Remaining dotted path segments.
        path: Vec<String>,
        /// Byte offset of the `${` in the original string.
        offset: usize,
    },
}

/// A parsed template, resolvable against a binding map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    tokens: Vec<Token>,
}

impl Template {
    /// Parse a raw string into a token list.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let bytes = raw.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                let offset = i;
                let rest = &raw[i + 2..];
                let Some(end) = rest.find('}') else {
                    return Err(TemplateError::Unterminated { offset });
                };
                let inner = rest[..end].trim();
                if inner.is_empty() {
                    return Err(TemplateError::EmptyReference { offset });
                }
                let mut segments = inner.split('.').map(str::to_string);
                let name = segments.next().unwrap_or_default();
                let path: Vec<String> = segments.collect();
                if name.is_empty() || path.iter().any(String::is_empty) {
                    return Err(TemplateError::EmptyReference { offset });
                }

                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Reference { name, path, offset });
                i += 2 + end + 1;
            } else {
                let ch = raw[i..].chars().next().expect("in-bounds char");
                literal.push(ch);
                i += ch.len_utf8();
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(Self { tokens })
    }

    /// Whether the template contains at least one `${...}` reference.
    pub fn has_references(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Reference { .. }))
    }

    /// Root binding names referenced by this template, with byte offsets.
    pub fn references(&self) -> impl Iterator<Item = (&str, usize)> {
        self.tokens.iter().filter_map(|t| match t {
            Token::Reference { name, offset, .. } => Some((name.as_str(), *offset)),
            Token::Literal(_) => None,
        })
    }

    /// Resolve against bound values, failing on the first unresolved reference.
    ///
    /// A template that is exactly one reference yields the bound value itself
    /// (structure preserved); anything else yields a concatenated string.
    pub fn resolve(
        &self,
        values: &serde_json::Map<String, Value>,
    ) -> Result<Value, TemplateError> {
        // Whole-reference template: hand back the value, not its rendering.
        if let [Token::Reference { name, path, offset }] = self.tokens.as_slice() {
            return lookup(values, name, path).cloned().ok_or_else(|| {
                TemplateError::Unresolved {
                    reference: reference_display(name, path),
                    offset: *offset,
                }
            });
        }

        let mut rendered = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => rendered.push_str(text),
                Token::Reference { name, path, offset } => {
                    let value =
                        lookup(values, name, path).ok_or_else(|| TemplateError::Unresolved {
                            reference: reference_display(name, path),
                            offset: *offset,
                        })?;
                    rendered.push_str(&value_to_string(value));
                }
            }
        }
        Ok(Value::String(rendered))
    }

    /// Resolve leniently: unresolved references render as the empty string
    /// (or `null` for a whole-reference template) and are returned for the
    /// caller to record as warnings.
    pub fn resolve_lenient(
        &self,
        values: &serde_json::Map<String, Value>,
    ) -> (Value, Vec<String>) {
        let mut unresolved = Vec::new();

        if let [Token::Reference { name, path, .. }] = self.tokens.as_slice() {
            return match lookup(values, name, path) {
                Some(value) => (value.clone(), unresolved),
                None => {
                    unresolved.push(reference_display(name, path));
                    (Value::Null, unresolved)
                }
            };
        }

        let mut rendered = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => rendered.push_str(text),
                Token::Reference { name, path, .. } => match lookup(values, name, path) {
                    Some(value) => rendered.push_str(&value_to_string(value)),
                    None => unresolved.push(reference_display(name, path)),
                },
            }
        }
        (Value::String(rendered), unresolved)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Navigate `values[name]` through the dotted path. Numeric segments index
/// into arrays; anything else is an object key.
fn lookup<'a>(
    values: &'a serde_json::Map<String, Value>,
    name: &str,
    path: &[String],
) -> Option<&'a Value> {
    let mut current = values.get(name)?;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn reference_display(name: &str, path: &[String]) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{name}.{}", path.join("."))
    }
}

/// Render a JSON value for string interpolation.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects/arrays interpolate as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> serde_json::Map<String, Value> {
        let Value::Object(map) = json!({
            "greet": "hello",
            "count": 3,
            "report": { "summary": "all good", "items": ["a", "b"] },
        }) else {
            unreachable!()
        };
        map
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_literal_only() {
        let t = Template::parse("no references here").unwrap();
        assert!(!t.has_references());
        assert_eq!(
            t.resolve(&bindings()).unwrap(),
            json!("no references here")
        );
    }

    #[test]
    fn test_parse_collects_reference_roots_and_offsets() {
        let t = Template::parse("x ${greet} y ${report.summary}").unwrap();
        let refs: Vec<(&str, usize)> = t.references().collect();
        assert_eq!(refs, vec![("greet", 2), ("report", 13)]);
    }

    #[test]
    fn test_parse_unterminated_reference() {
        let err = Template::parse("broken ${greet").unwrap_err();
        assert_eq!(err, TemplateError::Unterminated { offset: 7 });
    }

    #[test]
    fn test_parse_empty_reference() {
        assert!(matches!(
            Template::parse("${}").unwrap_err(),
            TemplateError::EmptyReference { offset: 0 }
        ));
        assert!(matches!(
            Template::parse("${a..b}").unwrap_err(),
            TemplateError::EmptyReference { .. }
        ));
    }

    // -----------------------------------------------------------------------
    // Strict resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_resolve_interpolates_into_string() {
        let t = Template::parse("say ${greet} ${count} times").unwrap();
        assert_eq!(t.resolve(&bindings()).unwrap(), json!("say hello 3 times"));
    }

    #[test]
    fn test_resolve_whole_reference_preserves_structure() {
        let t = Template::parse("${report}").unwrap();
        assert_eq!(
            t.resolve(&bindings()).unwrap(),
            json!({ "summary": "all good", "items": ["a", "b"] })
        );
    }

    #[test]
    fn test_resolve_dotted_path_and_array_index() {
        let t = Template::parse("${report.summary}").unwrap();
        assert_eq!(t.resolve(&bindings()).unwrap(), json!("all good"));

        let t = Template::parse("${report.items.1}").unwrap();
        assert_eq!(t.resolve(&bindings()).unwrap(), json!("b"));
    }

    #[test]
    fn test_resolve_unresolved_is_error_with_offset() {
        let t = Template::parse("ok ${missing.field}").unwrap();
        let err = t.resolve(&bindings()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Unresolved {
                reference: "missing.field".to_string(),
                offset: 3,
            }
        );
    }

    #[test]
    fn test_resolve_path_past_scalar_is_unresolved() {
        let t = Template::parse("${greet.deeper}").unwrap();
        assert!(matches!(
            t.resolve(&bindings()),
            Err(TemplateError::Unresolved { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Lenient resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_lenient_renders_missing_as_empty_string() {
        let t = Template::parse("got: ${missing}!").unwrap();
        let (value, unresolved) = t.resolve_lenient(&bindings());
        assert_eq!(value, json!("got: !"));
        assert_eq!(unresolved, vec!["missing"]);
    }

    #[test]
    fn test_lenient_whole_reference_missing_is_null() {
        let t = Template::parse("${missing}").unwrap();
        let (value, unresolved) = t.resolve_lenient(&bindings());
        assert_eq!(value, Value::Null);
        assert_eq!(unresolved, vec!["missing"]);
    }

    #[test]
    fn test_lenient_resolves_what_it_can() {
        let t = Template::parse("${greet} ${missing}").unwrap();
        let (value, unresolved) = t.resolve_lenient(&bindings());
        assert_eq!(value, json!("hello "));
        assert_eq!(unresolved, vec!["missing"]);
    }
}
