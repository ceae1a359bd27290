//! Template resolution for step parameters.
//!
//! Resolves `{{expression}}` templates in a step's `params` against the run's
//! shared state, so upstream step outputs can feed downstream inputs.
//!
//! # Template Syntax
//!
//! - `{{key}}`: a top-level shared state entry
//! - `{{key.field}}`: nested field access via dot notation
//! - `{{key.items[0].name}}`: array index access
//!
//! If a string is exactly one template, the resolved value keeps its JSON
//! type. Mixed text and templates are stringified and concatenated.

use serde_json::Value;
use thiserror::Error;

use crate::run::SharedState;

/// Errors raised while resolving templates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// `{{}}` with nothing inside.
    #[error("Empty template expression")]
    Empty,

    /// The first path segment is not a shared state key.
    #[error("Template '{{{{{path}}}}}': unknown state key '{key}'")]
    UnknownKey { path: String, key: String },

    /// A later path segment does not exist.
    #[error("Template '{{{{{path}}}}}': cannot resolve segment '{segment}'")]
    Unresolved { path: String, segment: String },
}

/// Resolves `{{expression}}` templates against shared state.
pub struct TemplateResolver<'a> {
    state: &'a SharedState,
}

impl<'a> TemplateResolver<'a> {
    /// Create a resolver backed by a shared state snapshot.
    pub fn new(state: &'a SharedState) -> Self {
        Self { state }
    }

    /// Resolve all templates in a JSON value tree.
    ///
    /// Strings are resolved inline, objects and arrays recursively, other
    /// values are returned unchanged.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::new();
                for (k, v) in map {
                    resolved.insert(k.clone(), self.resolve_value(v)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(arr) => {
                let resolved: Result<Vec<Value>, _> =
                    arr.iter().map(|v| self.resolve_value(v)).collect();
                Ok(Value::Array(resolved?))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, s: &str) -> Result<Value, TemplateError> {
        let expressions = parse_template_expressions(s);

        if expressions.is_empty() {
            return Ok(Value::String(s.to_string()));
        }

        if expressions.len() == 1 && expressions[0].full_match == s {
            return self.resolve_expression(&expressions[0].path);
        }

        let mut result = s.to_string();
        for expr in &expressions {
            let resolved = self.resolve_expression(&expr.path)?;
            result = result.replace(&expr.full_match, &value_to_string(&resolved));
        }

        Ok(Value::String(result))
    }

    fn resolve_expression(&self, path: &str) -> Result<Value, TemplateError> {
        let segments = parse_path_segments(path);
        let Some((root, rest)) = segments.split_first() else {
            return Err(TemplateError::Empty);
        };

        let mut current = self
            .state
            .get(root.name.as_str())
            .ok_or_else(|| TemplateError::UnknownKey {
                path: path.to_string(),
                key: root.name.clone(),
            })?;
        if let Some(i) = root.index {
            current = current.get(i).ok_or_else(|| TemplateError::Unresolved {
                path: path.to_string(),
                segment: root.to_string(),
            })?;
        }

        for segment in rest {
            current = navigate_segment(current, segment).ok_or_else(|| {
                TemplateError::Unresolved {
                    path: path.to_string(),
                    segment: segment.to_string(),
                }
            })?;
        }

        Ok(current.clone())
    }
}

/// Resolve all templates in a step's parameters.
pub fn resolve_params(params: &Value, state: &SharedState) -> Result<Value, TemplateError> {
    TemplateResolver::new(state).resolve_value(params)
}

// ---------------------------------------------------------------------------
// Template expression parsing
// ---------------------------------------------------------------------------

/// A parsed `{{expression}}` occurrence in a string.
#[derive(Debug)]
struct TemplateExpression {
    /// The full match including braces.
    full_match: String,
    /// The inner path.
    path: String,
}

fn parse_template_expressions(s: &str) -> Vec<TemplateExpression> {
    let mut results = Vec::new();
    let mut remaining = s;

    while let Some(start) = remaining.find("{{") {
        let Some(end) = remaining[start..].find("}}") else {
            break;
        };
        let full_end = start + end + 2;
        let inner = remaining[start + 2..start + end].trim();

        if !inner.is_empty() {
            results.push(TemplateExpression {
                full_match: remaining[start..full_end].to_string(),
                path: inner.to_string(),
            });
        }

        remaining = &remaining[full_end..];
    }

    results
}

// ---------------------------------------------------------------------------
// Path navigation
// ---------------------------------------------------------------------------

/// A segment of a dot-separated path, optionally with an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PathSegment {
    pub(crate) name: String,
    pub(crate) index: Option<usize>,
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.name, i),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Parse a dot-separated path into segments.
///
/// `"review.items[0].ok"` → `[("review", None), ("items", Some(0)), ("ok", None)]`
pub(crate) fn parse_path_segments(path: &str) -> Vec<PathSegment> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .map(|part| {
            if let Some(bracket_start) = part.find('[')
                && let Some(bracket_end) = part.find(']')
            {
                let name = part[..bracket_start].to_string();
                let index = part[bracket_start + 1..bracket_end].parse::<usize>().ok();
                return PathSegment { name, index };
            }
            PathSegment {
                name: part.to_string(),
                index: None,
            }
        })
        .collect()
}

fn navigate_segment<'v>(value: &'v Value, segment: &PathSegment) -> Option<&'v Value> {
    let field = if segment.name.is_empty() {
        value
    } else {
        value.get(&segment.name)?
    };

    match segment.index {
        Some(i) => field.get(i),
        None => Some(field),
    }
}

/// Look up a parsed path in shared state. `None` when any segment is missing.
pub(crate) fn lookup<'v>(state: &'v SharedState, segments: &[PathSegment]) -> Option<&'v Value> {
    let (root, rest) = segments.split_first()?;
    let mut current = state.get(root.name.as_str())?;
    if let Some(i) = root.index {
        current = current.get(i)?;
    }
    for segment in rest {
        current = navigate_segment(current, segment)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}
