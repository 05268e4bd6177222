//! Plan files and the runner that executes them
//!
//! A plan is a TOML tree of units. Executing it drives the debugger's
//! lifecycle callbacks exactly like a real execution engine would:
//!
//! ```toml
//! [variables]
//! greeting = "hello"
//!
//! [suite]
//! name = "Demo"
//!
//! [[suite.units]]
//! name = "First Test"
//! type = "TEST"
//! line = 3
//!
//! [[suite.units.units]]
//! name = "Log"
//! line = 4
//! args = ["${greeting}"]
//! log = [{ level = "INFO", message = "${greeting} world" }]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::Deserialize;
use serde_json::Value;

use crate::common::{Error, Result};
use crate::debugger::{
    Debugger, Evaluator, ExecutionContext, LogMessage, ScopeKind, UnitAttributes, UnitKind,
    UnitStatus, VariableStore,
};

use super::store::MapStore;

/// Highest exit code, whatever the number of failed tests
const MAX_EXIT_CODE: i32 = 250;

/// Root of a plan file
#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    /// Global variables
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    pub suite: PlanUnit,
}

/// One unit of a plan
#[derive(Debug, Clone, Deserialize)]
pub struct PlanUnit {
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: UnitKind,
    /// Defaults to the enclosing unit's source, the plan file for the root
    pub source: Option<PathBuf>,
    pub line: Option<u32>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Variables defined in the unit's own scope when it starts
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Expressions evaluated when the unit ends, assigned in the caller's scope
    #[serde(default)]
    pub assign: BTreeMap<String, String>,
    #[serde(default)]
    pub log: Vec<PlanLog>,
    /// Forced outcome: `FAIL` fails the unit with `message`, `NOT RUN` skips it
    pub status: Option<UnitStatus>,
    pub message: Option<String>,
    #[serde(default)]
    pub units: Vec<PlanUnit>,
}

fn default_kind() -> UnitKind {
    UnitKind::Keyword
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanLog {
    #[serde(default = "default_level")]
    pub level: String,
    pub message: String,
}

fn default_level() -> String {
    "INFO".to_string()
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let plan: Plan = toml::from_str(content).map_err(|e| Error::Config(format!("Invalid plan: {}", e)))?;
        if plan.suite.kind != UnitKind::Suite {
            return Err(Error::Config("The plan root must be a SUITE".to_string()));
        }
        Ok(plan)
    }
}

/// Scopes visible at one point of execution
#[derive(Clone)]
struct Scopes {
    local: Arc<MapStore>,
    test: Option<Arc<MapStore>>,
    suite: Arc<MapStore>,
    global: Arc<MapStore>,
}

impl ExecutionContext for Scopes {
    fn scope(&self, kind: ScopeKind) -> Option<Arc<dyn VariableStore>> {
        let store = match kind {
            ScopeKind::Local => Some(&self.local),
            ScopeKind::Test => self.test.as_ref(),
            ScopeKind::Suite => Some(&self.suite),
            ScopeKind::Global => Some(&self.global),
        };
        store.map(|s| Arc::clone(s) as Arc<dyn VariableStore>)
    }
}

impl Scopes {
    fn enter(&self, unit: &PlanUnit) -> Self {
        let vars = unit.variables.clone();
        match unit.kind {
            UnitKind::Suite => {
                let suite = MapStore::child(&self.suite, vars);
                Scopes {
                    local: Arc::clone(&suite),
                    test: None,
                    suite,
                    global: Arc::clone(&self.global),
                }
            }
            UnitKind::Test => {
                let test = MapStore::child(&self.suite, vars);
                Scopes {
                    local: Arc::clone(&test),
                    test: Some(test),
                    suite: Arc::clone(&self.suite),
                    global: Arc::clone(&self.global),
                }
            }
            kind => {
                // Control blocks run in the caller's scope
                let local = if kind.is_control_block() {
                    for (name, value) in vars {
                        self.local.set(&name, value);
                    }
                    Arc::clone(&self.local)
                } else {
                    MapStore::child(&self.local, vars)
                };
                Scopes {
                    local,
                    test: self.test.clone(),
                    suite: Arc::clone(&self.suite),
                    global: Arc::clone(&self.global),
                }
            }
        }
    }
}

/// What a finished unit reports to its parent
struct Outcome {
    status: UnitStatus,
    message: Option<String>,
}

impl Outcome {
    fn pass() -> Self {
        Self {
            status: UnitStatus::Pass,
            message: None,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            status: UnitStatus::Fail,
            message: Some(message),
        }
    }
}

/// Executes a plan on the calling thread
pub struct PlanRunner {
    plan: Plan,
    /// Default source of the root suite and base for relative sources
    plan_path: PathBuf,
    debugger: Arc<Debugger>,
    evaluator: Arc<dyn Evaluator>,
    failed_tests: usize,
}

impl PlanRunner {
    pub fn new(plan: Plan, plan_path: &Path, debugger: Arc<Debugger>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            plan,
            plan_path: plan_path.to_path_buf(),
            debugger,
            evaluator,
            failed_tests: 0,
        }
    }

    /// Run everything and return the exit code: the number of failed tests
    pub fn run(mut self) -> i32 {
        let mut items = Vec::new();
        collect_items(&self.plan.suite, None, &mut items);
        self.debugger.enqueued(items);

        let global = MapStore::new(self.plan.variables.clone());
        let root = Scopes {
            local: Arc::clone(&global),
            test: None,
            suite: Arc::clone(&global),
            global,
        };

        let suite = self.plan.suite.clone();
        let source = self.resolve_source(&suite, &self.plan_path);
        self.run_unit(&suite, &root, None, &source, false);

        i32::try_from(self.failed_tests)
            .unwrap_or(MAX_EXIT_CODE)
            .min(MAX_EXIT_CODE)
    }

    fn resolve_source(&self, unit: &PlanUnit, inherited: &Path) -> PathBuf {
        match &unit.source {
            Some(source) if source.is_absolute() => source.clone(),
            Some(source) => self
                .plan_path
                .parent()
                .map(|dir| dir.join(source))
                .unwrap_or_else(|| source.clone()),
            None => inherited.to_path_buf(),
        }
    }

    fn attributes(&self, unit: &PlanUnit, parent: Option<&str>, source: &Path) -> UnitAttributes {
        let mut attributes = UnitAttributes::new(&unit.name, unit.kind);
        attributes.long_name = long_name(unit, parent);
        attributes.source = Some(source.to_string_lossy().into_owned());
        attributes.line = unit.line;
        attributes.args = unit.args.clone();
        attributes
    }

    fn run_unit(
        &mut self,
        unit: &PlanUnit,
        scopes: &Scopes,
        parent: Option<&str>,
        inherited_source: &Path,
        skip: bool,
    ) -> Outcome {
        let source = self.resolve_source(unit, inherited_source);
        let mut attributes = self.attributes(unit, parent, &source);

        if skip || unit.status == Some(UnitStatus::NotRun) {
            attributes.status = Some(UnitStatus::NotRun);
            let context: Arc<dyn ExecutionContext> = Arc::new(scopes.clone());
            self.debugger.start_unit(&context, &attributes);
            self.debugger.end_unit(&attributes);
            return Outcome {
                status: UnitStatus::NotRun,
                message: None,
            };
        }

        let inner = Arc::new(scopes.enter(unit));
        let context: Arc<dyn ExecutionContext> = inner.clone();

        if unit.kind == UnitKind::Suite {
            self.debugger.message(&LogMessage {
                level: "INFO".to_string(),
                message: format!("Running suite '{}'", attributes.long_name),
                timestamp: timestamp(),
            });
        }
        self.debugger.start_unit(&context, &attributes);

        let mut outcome = self.execute(unit, &inner, &attributes.long_name, &source);

        if outcome.status != UnitStatus::Fail {
            if let Err(e) = self.assign(unit, &inner, scopes) {
                outcome = self.fail(e.to_string());
            }
        }

        if unit.kind == UnitKind::Test && outcome.status == UnitStatus::Fail {
            self.failed_tests += 1;
        }

        attributes.status = Some(outcome.status);
        attributes.message = outcome.message.clone();
        self.debugger.end_unit(&attributes);
        outcome
    }

    /// Log, then run the children; a failed step skips the remaining steps
    fn execute(&mut self, unit: &PlanUnit, scopes: &Scopes, long_name: &str, source: &Path) -> Outcome {
        for log in &unit.log {
            let message = match scopes.local.replace_variables(&log.message) {
                Ok(message) => message,
                Err(e) => format!("{}\nError: {}", log.message, e),
            };
            self.log(&log.level, message);
        }

        let mut outcome = Outcome::pass();
        let mut child_failures = false;
        for child in &unit.units {
            if self.debugger.is_terminated() {
                tracing::debug!(unit = %child.name, "Execution terminated, skipping");
                continue;
            }
            let skip = outcome.status == UnitStatus::Fail && child.kind != UnitKind::Teardown;

            let result = self.run_unit(child, scopes, Some(long_name), source, skip);
            if result.status != UnitStatus::Fail {
                continue;
            }
            if child.kind.is_structural() {
                child_failures = true;
            } else if outcome.status != UnitStatus::Fail {
                outcome = result;
            }
        }

        if unit.status == Some(UnitStatus::Fail) && outcome.status != UnitStatus::Fail {
            let message = unit
                .message
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", unit.name));
            outcome = self.fail(message);
        } else if unit.status == Some(UnitStatus::Skip) {
            outcome.status = UnitStatus::Skip;
        }

        if child_failures && outcome.status != UnitStatus::Fail {
            outcome = Outcome::fail(format!("Failures in '{}'", long_name));
        }
        outcome
    }

    /// Evaluate the unit's assignments into the caller's local scope
    fn assign(&self, unit: &PlanUnit, inner: &Scopes, outer: &Scopes) -> Result<()> {
        for (name, expression) in &unit.assign {
            let expanded = inner.local.replace_variables(expression)?;
            let value = self.evaluator.evaluate(&expanded, inner.local.as_ref())?;
            outer.local.set(name, value);
        }
        Ok(())
    }

    fn fail(&self, message: String) -> Outcome {
        self.log("FAIL", message.clone());
        Outcome::fail(message)
    }

    fn log(&self, level: &str, message: String) {
        self.debugger.log_message(&LogMessage {
            level: level.to_string(),
            message,
            timestamp: timestamp(),
        });
    }
}

fn long_name(unit: &PlanUnit, parent: Option<&str>) -> String {
    match parent {
        Some(parent) if unit.kind.is_structural() => format!("{}.{}", parent, unit.name),
        _ => unit.name.clone(),
    }
}

/// Long names of every test and suite, children before their parent
fn collect_items(unit: &PlanUnit, parent: Option<&str>, items: &mut Vec<String>) {
    if !unit.kind.is_structural() {
        return;
    }
    let name = long_name(unit, parent);
    for child in &unit.units {
        collect_items(child, Some(&name), items);
    }
    items.push(name);
}

/// Current local time as `YYYYMMDD HH:MM:SS.mmm`
fn timestamp() -> String {
    Local::now().format("%Y%m%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
[variables]
limit = 3

[suite]
name = "Demo"
type = "SUITE"
line = 1

[[suite.units]]
name = "Passes"
type = "TEST"
line = 2

[[suite.units.units]]
name = "Compute"
line = 3
assign = { total = "$limit * 2" }

[[suite.units]]
name = "Fails"
type = "TEST"
line = 5

[[suite.units.units]]
name = "Boom"
line = 6
status = "FAIL"
message = "it broke"

[[suite.units.units]]
name = "Never"
line = 7
"#;

    #[test]
    fn test_parse_plan() {
        let plan = Plan::parse(PLAN).unwrap();
        assert_eq!(plan.suite.kind, UnitKind::Suite);
        assert_eq!(plan.suite.units.len(), 2);
        assert_eq!(plan.suite.units[0].units[0].kind, UnitKind::Keyword);
        assert_eq!(plan.suite.units[1].units[0].status, Some(UnitStatus::Fail));
    }

    #[test]
    fn test_plan_root_must_be_suite() {
        let err = Plan::parse("[suite]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_enqueued_items_children_first() {
        let plan = Plan::parse(PLAN).unwrap();
        let mut items = Vec::new();
        collect_items(&plan.suite, None, &mut items);
        assert_eq!(items, vec!["Demo.Passes", "Demo.Fails", "Demo"]);
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), "20240101 00:00:00.000".len());
        assert_eq!(&ts[8..9], " ");
    }
}
