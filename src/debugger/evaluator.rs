//! Contracts the debugger needs from the execution engine
//!
//! The debugger never parses expressions itself. It asks a [`VariableStore`]
//! to resolve and interpolate variables and an [`Evaluator`] to compute
//! expressions against a store.

use std::sync::Arc;

use serde_json::Value;

use crate::common::Result;

/// Logical variable scopes, innermost first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Local,
    Test,
    Suite,
    Global,
}

impl ScopeKind {
    pub const ALL: [ScopeKind; 4] = [
        ScopeKind::Local,
        ScopeKind::Test,
        ScopeKind::Suite,
        ScopeKind::Global,
    ];

    pub fn index(self) -> usize {
        match self {
            ScopeKind::Local => 0,
            ScopeKind::Test => 1,
            ScopeKind::Suite => 2,
            ScopeKind::Global => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            ScopeKind::Local => "Local",
            ScopeKind::Test => "Test",
            ScopeKind::Suite => "Suite",
            ScopeKind::Global => "Global",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ScopeKind::Local => "local",
            ScopeKind::Test => "test",
            ScopeKind::Suite => "suite",
            ScopeKind::Global => "global",
        }
    }
}

/// Variables visible in one scope
pub trait VariableStore: Send + Sync {
    /// Look up a variable, given as `${name}` or bare `name`
    fn resolve(&self, name: &str) -> Result<Value>;

    fn contains(&self, name: &str) -> bool;

    fn assign(&self, name: &str, value: Value) -> Result<()>;

    /// Replace every embedded variable reference in `text`
    fn replace_variables(&self, text: &str) -> Result<String>;

    /// All variables with their display names
    fn variables(&self) -> Vec<(String, Value)>;
}

/// Expression evaluation against a store
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, store: &dyn VariableStore) -> Result<Value>;
}

/// The running engine's view of its scopes at the current point of execution
pub trait ExecutionContext: Send + Sync {
    /// Store for a scope, `None` when the scope doesn't exist right now
    fn scope(&self, kind: ScopeKind) -> Option<Arc<dyn VariableStore>>;
}

/// Whether `text` is exactly one variable reference like `${x}` or `@{items}`
pub fn is_variable_reference(text: &str) -> bool {
    let text = text.trim();
    let mut chars = text.chars();
    matches!(chars.next(), Some('$' | '@' | '&' | '%'))
        && matches!(chars.next(), Some('{'))
        && text.len() >= 3
        && text.ends_with('}')
        && !text[2..text.len() - 1].contains('}')
}

/// Strip the `${...}` decoration from a variable name
pub fn bare_name(name: &str) -> &str {
    if is_variable_reference(name) {
        let name = name.trim();
        &name[2..name.len() - 1]
    } else {
        name
    }
}

/// Display form of a value
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// Type name shown next to a value
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "none",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dictionary",
    }
}

/// Truthiness used for breakpoint conditions
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variable_reference_detection() {
        assert!(is_variable_reference("${x}"));
        assert!(is_variable_reference(" @{items} "));
        assert!(is_variable_reference("&{d}"));
        assert!(!is_variable_reference("${x} + 1"));
        assert!(!is_variable_reference("x"));
        assert!(!is_variable_reference("{x}"));
    }

    #[test]
    fn test_bare_name() {
        assert_eq!(bare_name("${count}"), "count");
        assert_eq!(bare_name("count"), "count");
    }

    #[test]
    fn test_formatting_and_truthiness() {
        assert_eq!(format_value(&json!("hi")), "'hi'");
        assert_eq!(format_value(&json!(3)), "3");
        assert_eq!(type_name(&json!(3)), "integer");
        assert_eq!(type_name(&json!(3.5)), "number");
        assert!(is_truthy(&json!(1)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn test_scope_index_round_trip() {
        for kind in ScopeKind::ALL {
            assert_eq!(ScopeKind::from_index(kind.index()), Some(kind));
        }
        assert_eq!(ScopeKind::from_index(4), None);
    }
}
