//! Map-backed variable scopes for the plan runner
//!
//! Each store sees its own variables plus those of its parent chain; inner
//! definitions shadow outer ones. Names are kept bare (`x`) and displayed
//! decorated (`${x}`).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::common::{Error, Result};
use crate::debugger::evaluator::bare_name;
use crate::debugger::VariableStore;

#[derive(Default)]
pub struct MapStore {
    vars: Mutex<BTreeMap<String, Value>>,
    parent: Option<Arc<MapStore>>,
}

impl MapStore {
    pub fn new(vars: BTreeMap<String, Value>) -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(vars),
            parent: None,
        })
    }

    /// A nested scope with its own initial variables
    pub fn child(parent: &Arc<MapStore>, vars: BTreeMap<String, Value>) -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(vars),
            parent: Some(Arc::clone(parent)),
        })
    }

    fn own(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        self.vars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.own().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// Define or overwrite a variable in this scope
    pub fn set(&self, name: &str, value: Value) {
        self.own().insert(bare_name(name).to_string(), value);
    }

    fn collect(&self, into: &mut BTreeMap<String, Value>) {
        if let Some(parent) = &self.parent {
            parent.collect(into);
        }
        into.extend(self.own().iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Text a value interpolates to
pub fn plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

impl VariableStore for MapStore {
    fn resolve(&self, name: &str) -> Result<Value> {
        let bare = bare_name(name);
        if name.trim_start().starts_with('%') {
            return std::env::var(bare)
                .map(Value::String)
                .map_err(|_| Error::VariableNotFound(name.to_string()));
        }
        self.lookup(bare)
            .ok_or_else(|| Error::VariableNotFound(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.lookup(bare_name(name)).is_some()
    }

    fn assign(&self, name: &str, value: Value) -> Result<()> {
        self.set(name, value);
        Ok(())
    }

    fn replace_variables(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find('{') {
            let prefix_at = start.checked_sub(1).filter(|&i| {
                matches!(rest.as_bytes()[i], b'$' | b'@' | b'&' | b'%')
            });
            let Some(prefix_at) = prefix_at else {
                out.push_str(&rest[..=start]);
                rest = &rest[start + 1..];
                continue;
            };
            let Some(len) = rest[start..].find('}') else {
                break;
            };

            let reference = &rest[prefix_at..start + len + 1];
            out.push_str(&rest[..prefix_at]);
            out.push_str(&plain_text(&self.resolve(reference)?));
            rest = &rest[start + len + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn variables(&self) -> Vec<(String, Value)> {
        let mut all = BTreeMap::new();
        self.collect(&mut all);
        all.into_iter()
            .map(|(name, value)| (format!("${{{}}}", name), value))
            .collect()
    }
}
