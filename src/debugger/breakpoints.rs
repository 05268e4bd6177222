//! Breakpoint tables and their evaluation
//!
//! Tables live inside the session lock. Evaluation works on a snapshot of
//! the entries for one location so conditions and log messages are computed
//! without holding it.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::dap::{Breakpoint, ExceptionFilterOptions, Source, SourceBreakpoint};

use super::evaluator::{is_truthy, Evaluator, VariableStore};
use super::listener::UnitKind;

/// Exception filters offered to clients
pub const FAILED_KEYWORD: &str = "failed_keyword";
pub const FAILED_TEST: &str = "failed_test";
pub const FAILED_SUITE: &str = "failed_suite";

pub const EXCEPTION_FILTERS: [&str; 3] = [FAILED_KEYWORD, FAILED_TEST, FAILED_SUITE];

/// A source breakpoint as stored in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointEntry {
    pub id: u32,
    pub line: u32,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

impl BreakpointEntry {
    pub fn new(id: u32, breakpoint: SourceBreakpoint) -> Self {
        Self {
            id,
            line: breakpoint.line,
            condition: breakpoint.condition.filter(|c| !c.trim().is_empty()),
            hit_condition: breakpoint.hit_condition.filter(|c| !c.trim().is_empty()),
            log_message: breakpoint.log_message.filter(|m| !m.is_empty()),
        }
    }

    pub fn to_dap(&self, path: &str) -> Breakpoint {
        Breakpoint {
            id: Some(self.id),
            verified: true,
            source: Some(Source::from_path(path)),
            line: Some(self.line),
            ..Default::default()
        }
    }
}

/// Breakpoints per resolved source path
#[derive(Debug, Default)]
pub struct BreakpointTable {
    by_source: HashMap<String, Vec<BreakpointEntry>>,
}

impl BreakpointTable {
    /// Replace every breakpoint of `path`; an empty set removes the path
    pub fn replace(&mut self, path: &str, entries: Vec<BreakpointEntry>) {
        if entries.is_empty() {
            self.by_source.remove(path);
        } else {
            self.by_source.insert(path.to_string(), entries);
        }
    }

    /// Breakpoints at one location, in registration order
    pub fn at(&self, path: &str, line: u32) -> Vec<BreakpointEntry> {
        self.by_source
            .get(path)
            .map(|entries| entries.iter().filter(|e| e.line == line).cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_source(&self, path: &str) -> bool {
        self.by_source.contains_key(path)
    }
}

/// Location a hit count is kept for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HitKey {
    pub source: String,
    pub line: u32,
    pub kind: UnitKind,
}

/// Counts how often hit-conditioned locations were reached; never reset
#[derive(Debug, Default)]
pub struct HitCounter {
    counts: HashMap<HitKey, u64>,
}

impl HitCounter {
    /// Count one more hit and return the new total
    pub fn increment(&mut self, key: HitKey) -> u64 {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, key: &HitKey) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

/// Exception filters currently enabled by the client
#[derive(Debug, Default)]
pub struct ExceptionBreakpoints {
    filters: HashSet<String>,
    options: Vec<ExceptionFilterOptions>,
    exception_options: Vec<Value>,
}

impl ExceptionBreakpoints {
    /// Replace the whole configuration and report which entries were accepted
    pub fn configure(
        &mut self,
        filters: Vec<String>,
        options: Vec<ExceptionFilterOptions>,
        exception_options: Vec<Value>,
    ) -> Vec<Breakpoint> {
        let verdict = |id: &str| Breakpoint {
            verified: EXCEPTION_FILTERS.contains(&id),
            ..Default::default()
        };

        let result = filters
            .iter()
            .map(|f| verdict(f))
            .chain(options.iter().map(|o| verdict(&o.filter_id)))
            .collect();

        self.filters = filters
            .into_iter()
            .filter(|f| EXCEPTION_FILTERS.contains(&f.as_str()))
            .collect();
        self.options = options
            .into_iter()
            .filter(|o| EXCEPTION_FILTERS.contains(&o.filter_id.as_str()))
            .collect();
        self.exception_options = exception_options;

        result
    }

    pub fn is_enabled(&self, filter_id: &str) -> bool {
        self.filters.contains(filter_id) || self.options.iter().any(|o| o.filter_id == filter_id)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.options.is_empty()
    }

    /// Client supplied exception options, kept verbatim
    pub fn exception_options(&self) -> &[Value] {
        &self.exception_options
    }
}

/// What evaluating the breakpoints of one location produced
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Breakpoints that want execution to stop
    pub fired: Vec<u32>,
    /// Rendered log point messages, in order
    pub log_messages: Vec<String>,
}

/// Evaluate a location's breakpoints
///
/// `hit` counts one more hit for the location and returns the new total. It
/// is only called for breakpoints that carry a hit condition and whose
/// condition (if any) held.
pub fn evaluate(
    entries: &[BreakpointEntry],
    store: Option<&dyn VariableStore>,
    evaluator: &dyn Evaluator,
    mut hit: impl FnMut() -> u64,
) -> Evaluation {
    let mut result = Evaluation::default();

    for entry in entries {
        if let Some(condition) = &entry.condition {
            if !condition_holds(condition, store, evaluator) {
                continue;
            }
        }

        if let Some(hit_condition) = &entry.hit_condition {
            let count = hit();
            if hit_target(hit_condition, store, evaluator) != Some(count) {
                continue;
            }
        }

        if let Some(message) = &entry.log_message {
            result.log_messages.push(render_log_message(message, store));
            continue;
        }

        result.fired.push(entry.id);
    }

    result
}

/// Errors count as "not met"
fn condition_holds(condition: &str, store: Option<&dyn VariableStore>, evaluator: &dyn Evaluator) -> bool {
    let Some(store) = store else {
        return false;
    };

    let outcome = store
        .replace_variables(condition)
        .and_then(|expression| evaluator.evaluate(&expression, store));

    match outcome {
        Ok(value) => is_truthy(&value),
        Err(e) => {
            tracing::debug!(condition, "Breakpoint condition failed: {}", e);
            false
        }
    }
}

/// Hit count a breakpoint waits for: an integer literal, else an expression
fn hit_target(hit_condition: &str, store: Option<&dyn VariableStore>, evaluator: &dyn Evaluator) -> Option<u64> {
    if let Ok(n) = hit_condition.trim().parse::<u64>() {
        return Some(n);
    }

    let store = store?;
    let value = store
        .replace_variables(hit_condition)
        .and_then(|expression| evaluator.evaluate(&expression, store));

    match value {
        Ok(Value::Number(n)) => n.as_u64(),
        Ok(Value::String(s)) => s.trim().parse().ok(),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(hit_condition, "Hit condition failed: {}", e);
            None
        }
    }
}

fn render_log_message(message: &str, store: Option<&dyn VariableStore>) -> String {
    let rendered = match store {
        Some(store) => store.replace_variables(message),
        None => Ok(message.to_string()),
    };

    match rendered {
        Ok(text) => text,
        Err(e) => format!("{}\nError: {}", message, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Error, Result};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Store where `${name}` interpolates to the value's plain text
    struct Vars(Mutex<BTreeMap<String, Value>>);

    impl Vars {
        fn with(pairs: &[(&str, Value)]) -> Self {
            Self(Mutex::new(
                pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            ))
        }
    }

    impl VariableStore for Vars {
        fn resolve(&self, name: &str) -> Result<Value> {
            self.0
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::VariableNotFound(name.to_string()))
        }
        fn contains(&self, name: &str) -> bool {
            self.0.lock().unwrap().contains_key(name)
        }
        fn assign(&self, name: &str, value: Value) -> Result<()> {
            self.0.lock().unwrap().insert(name.to_string(), value);
            Ok(())
        }
        fn replace_variables(&self, text: &str) -> Result<String> {
            let mut out = text.to_string();
            for (name, value) in self.0.lock().unwrap().iter() {
                let plain = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&format!("${{{}}}", name), &plain);
            }
            if out.contains("${") {
                return Err(Error::VariableNotFound(out));
            }
            Ok(out)
        }
        fn variables(&self) -> Vec<(String, Value)> {
            self.0.lock().unwrap().clone().into_iter().collect()
        }
    }

    /// Understands `<a> > <b>` on integers, `true`/`false` and integers
    struct Tiny;

    impl Evaluator for Tiny {
        fn evaluate(&self, expression: &str, _store: &dyn VariableStore) -> Result<Value> {
            let expression = expression.trim();
            if let Some((a, b)) = expression.split_once('>') {
                let a: i64 = a.trim().parse().map_err(|_| Error::Evaluation(a.to_string()))?;
                let b: i64 = b.trim().parse().map_err(|_| Error::Evaluation(b.to_string()))?;
                return Ok(json!(a > b));
            }
            match expression {
                "true" => Ok(json!(true)),
                "false" => Ok(json!(false)),
                n => n
                    .parse::<i64>()
                    .map(|n| json!(n))
                    .map_err(|_| Error::Evaluation(format!("cannot evaluate '{}'", n))),
            }
        }
    }

    fn entry(id: u32, line: u32) -> BreakpointEntry {
        BreakpointEntry::new(id, SourceBreakpoint::at_line(line))
    }

    #[test]
    fn test_table_replace_and_lookup() {
        let mut table = BreakpointTable::default();
        table.replace("/a", vec![entry(1, 3), entry(2, 5), entry(3, 3)]);

        let ids: Vec<u32> = table.at("/a", 3).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(table.at("/b", 3).is_empty());

        table.replace("/a", Vec::new());
        assert!(!table.has_source("/a"));
    }

    #[test]
    fn test_hit_condition_fires_only_on_exact_count() {
        let mut bp = entry(7, 1);
        bp.hit_condition = Some("3".to_string());
        let mut counter = HitCounter::default();
        let key = HitKey {
            source: "/a".to_string(),
            line: 1,
            kind: UnitKind::Keyword,
        };

        let fired: Vec<bool> = (0..4)
            .map(|_| {
                let eval = evaluate(std::slice::from_ref(&bp), None, &Tiny, || counter.increment(key.clone()));
                !eval.fired.is_empty()
            })
            .collect();

        assert_eq!(fired, vec![false, false, true, false]);
        assert_eq!(counter.get(&key), 4);
    }

    #[test]
    fn test_condition_controls_firing() {
        let store = Vars::with(&[("x", json!(3))]);
        let mut bp = entry(1, 1);
        bp.condition = Some("${x} > 5".to_string());

        let eval = evaluate(std::slice::from_ref(&bp), Some(&store), &Tiny, || 0);
        assert!(eval.fired.is_empty());

        store.assign("x", json!(9)).unwrap();
        let eval = evaluate(std::slice::from_ref(&bp), Some(&store), &Tiny, || 0);
        assert_eq!(eval.fired, vec![1]);
    }

    #[test]
    fn test_condition_error_means_not_met() {
        let store = Vars::with(&[]);
        let mut bp = entry(1, 1);
        bp.condition = Some("${missing} > 1".to_string());

        let eval = evaluate(std::slice::from_ref(&bp), Some(&store), &Tiny, || 0);
        assert_eq!(eval, Evaluation::default());
    }

    #[test]
    fn test_log_point_renders_and_does_not_fire() {
        let store = Vars::with(&[("name", json!("world"))]);
        let mut log = entry(1, 1);
        log.log_message = Some("hello ${name}".to_string());
        let mut broken = entry(2, 1);
        broken.log_message = Some("oops ${nope}".to_string());

        let eval = evaluate(&[log, broken, entry(3, 1)], Some(&store), &Tiny, || 0);

        assert_eq!(eval.fired, vec![3]);
        assert_eq!(eval.log_messages[0], "hello world");
        assert!(eval.log_messages[1].starts_with("oops ${nope}\nError:"));
    }

    #[test]
    fn test_exception_filters_from_either_list() {
        let mut exceptions = ExceptionBreakpoints::default();
        let result = exceptions.configure(
            vec![FAILED_TEST.to_string(), "bogus".to_string()],
            vec![ExceptionFilterOptions {
                filter_id: FAILED_KEYWORD.to_string(),
                condition: None,
            }],
            Vec::new(),
        );

        let verified: Vec<bool> = result.iter().map(|b| b.verified).collect();
        assert_eq!(verified, vec![true, false, true]);
        assert!(exceptions.is_enabled(FAILED_TEST));
        assert!(exceptions.is_enabled(FAILED_KEYWORD));
        assert!(!exceptions.is_enabled(FAILED_SUITE));

        exceptions.configure(Vec::new(), Vec::new(), Vec::new());
        assert!(exceptions.is_empty());
    }
}
