//! Lifecycle callbacks made by the execution thread
//!
//! Calls must arrive in strict nesting order: every `start_unit` is matched
//! by an `end_unit` for the same unit before its parent ends. A callback may
//! block while the session is paused.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::paths::normalize_source;
use crate::dap::{Event, OutputEventBody, Source, StoppedEventBody};

use super::breakpoints::{self, HitKey, FAILED_KEYWORD, FAILED_SUITE, FAILED_TEST};
use super::evaluator::{ExecutionContext, ScopeKind};
use super::frames::FrameLocation;
use super::session::{reason, Debugger, RequestedTransition, RunState};

/// Kind of a lifecycle unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    #[serde(rename = "SUITE")]
    Suite,
    #[serde(rename = "TEST")]
    Test,
    #[serde(rename = "KEYWORD")]
    Keyword,
    #[serde(rename = "SETUP")]
    Setup,
    #[serde(rename = "TEARDOWN")]
    Teardown,
    #[serde(rename = "FOR")]
    For,
    #[serde(rename = "FOR ITERATION")]
    ForIteration,
    #[serde(rename = "IF")]
    If,
    #[serde(rename = "ELSE IF")]
    ElseIf,
    #[serde(rename = "ELSE")]
    Else,
}

impl UnitKind {
    /// Suite and test boundaries, as opposed to steps
    pub fn is_structural(self) -> bool {
        matches!(self, UnitKind::Suite | UnitKind::Test)
    }

    /// Loops and conditionals
    pub fn is_control_block(self) -> bool {
        matches!(
            self,
            UnitKind::For | UnitKind::ForIteration | UnitKind::If | UnitKind::ElseIf | UnitKind::Else
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            UnitKind::Suite => "SUITE",
            UnitKind::Test => "TEST",
            UnitKind::Keyword => "KEYWORD",
            UnitKind::Setup => "SETUP",
            UnitKind::Teardown => "TEARDOWN",
            UnitKind::For => "FOR",
            UnitKind::ForIteration => "FOR ITERATION",
            UnitKind::If => "IF",
            UnitKind::ElseIf => "ELSE IF",
            UnitKind::Else => "ELSE",
        }
    }

    /// `type` field of `unitStarted`/`unitEnded`
    fn event_type(self) -> &'static str {
        match self {
            UnitKind::Suite => "suite",
            UnitKind::Test => "test",
            _ => "keyword",
        }
    }
}

/// Outcome of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "SKIP")]
    Skip,
    #[serde(rename = "NOT RUN")]
    NotRun,
}

/// What the execution engine reports about a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitAttributes {
    pub name: String,
    /// Fully qualified name, used as frame name for suites and tests
    #[serde(default)]
    pub long_name: String,
    #[serde(rename = "type")]
    pub kind: UnitKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Unset while the unit is starting, except for units that won't run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UnitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl UnitAttributes {
    pub fn new(name: &str, kind: UnitKind) -> Self {
        Self {
            name: name.to_string(),
            long_name: name.to_string(),
            kind,
            source: None,
            line: None,
            status: None,
            message: None,
            args: Vec::new(),
        }
    }

    fn frame_name(&self) -> &str {
        if self.kind.is_structural() && !self.long_name.is_empty() {
            &self.long_name
        } else {
            &self.name
        }
    }

    fn not_run(&self) -> bool {
        self.status == Some(UnitStatus::NotRun)
    }
}

/// A log line or engine message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Failed step reported with the enclosing test's `unitEnded`
#[derive(Debug, Clone, Serialize)]
pub struct FailedKeyword {
    pub message: Option<String>,
    #[serde(flatten)]
    pub attributes: UnitAttributes,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnitEventBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    attributes: &'a UnitAttributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_keywords: Option<Vec<FailedKeyword>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnitLogBody<'a> {
    item_id: Option<String>,
    source: Option<String>,
    lineno: Option<u32>,
    column: Option<u32>,
    #[serde(flatten)]
    message: &'a LogMessage,
}

impl Debugger {
    /// A unit starts; may block until the client resumes execution
    pub fn start_unit(&self, context: &Arc<dyn ExecutionContext>, unit: &UnitAttributes) {
        if unit.kind == UnitKind::Test {
            self.bridge.lock().failed_keywords.clear();
        }

        self.emit(Event::custom(
            "unitStarted",
            &UnitEventBody {
                kind: unit.kind.event_type(),
                attributes: unit,
                failed_keywords: None,
            },
        ));
        self.start_output_group(unit);

        if unit.not_run() {
            return;
        }

        let (source, line) = {
            let mut state = self.bridge.lock();
            let location = FrameLocation {
                source: unit
                    .source
                    .as_deref()
                    .map(|s| normalize_source(Path::new(s)).to_string_lossy().into_owned()),
                line: unit.line,
                column: Some(1),
            };
            let frame = state.frames.push(unit.frame_name(), unit.kind, location, context);
            (frame.source.clone(), frame.line)
        };

        if !self.debug_enabled() {
            return;
        }

        let at_entry = unit.kind == UnitKind::Suite && self.stop_on_entry();
        if !at_entry {
            self.process_start(source.as_deref(), line, unit.kind, context);
        }
        self.wait_for_running();
    }

    /// Pause at the first suite when asked to; consumes the flag
    fn stop_on_entry(&self) -> bool {
        let mut state = self.bridge.lock();
        if !state.stop_on_entry {
            return false;
        }
        state.stop_on_entry = false;
        state.run_state = RunState::Paused;
        let thread_id = Self::thread_id(&state);
        self.emit_stopped(&state, StoppedEventBody::new(reason::ENTRY, thread_id));
        true
    }

    /// Apply a pending step request, then the breakpoints at this location
    ///
    /// Units without a source can still stop on a step or pause request,
    /// they just never match a line breakpoint.
    fn process_start(
        &self,
        source: Option<&str>,
        line: u32,
        kind: UnitKind,
        context: &Arc<dyn ExecutionContext>,
    ) {
        let (source, candidates) = {
            let mut state = self.bridge.lock();
            if state.run_state == RunState::Stopped {
                return;
            }

            let depth = state.frames.depth();
            let step_reason = match state.requested {
                RequestedTransition::Pause => Some(reason::PAUSE),
                RequestedTransition::StepIn => Some(reason::STEP),
                RequestedTransition::Next | RequestedTransition::StepOut
                    if depth <= state.target_depth =>
                {
                    Some(reason::STEP)
                }
                _ => None,
            };

            if let Some(step_reason) = step_reason {
                state.run_state = RunState::Paused;
                state.requested = RequestedTransition::None;
                let thread_id = Self::thread_id(&state);
                self.emit_stopped(&state, StoppedEventBody::new(step_reason, thread_id));
            }

            match source {
                Some(source) => (source, state.breakpoints.at(source, line)),
                None => return,
            }
        };

        if candidates.is_empty() {
            return;
        }

        let store = context.scope(ScopeKind::Local);
        let key = HitKey {
            source: source.to_string(),
            line,
            kind,
        };
        let evaluation = breakpoints::evaluate(
            &candidates,
            store.as_deref(),
            self.evaluator.as_ref(),
            || self.bridge.lock().hit_counts.increment(key.clone()),
        );

        for output in evaluation.log_messages {
            self.emit(Event::Output(OutputEventBody {
                category: Some("console".to_string()),
                output,
                source: Some(Source::from_path(source)),
                line: Some(line),
                ..Default::default()
            }));
        }

        if evaluation.fired.is_empty() {
            return;
        }

        let mut state = self.bridge.lock();
        // A step that already stopped here has reported the stop
        if state.run_state == RunState::Running {
            state.run_state = RunState::Paused;
            state.requested = RequestedTransition::None;
            let mut body = StoppedEventBody::new(reason::BREAKPOINT, Self::thread_id(&state));
            body.hit_breakpoint_ids = evaluation.fired;
            self.emit_stopped(&state, body);
        }
    }

    /// A unit ended; may block when an exception filter matches its failure
    pub fn end_unit(&self, unit: &UnitAttributes) {
        if !unit.not_run() {
            if self.debug_enabled() {
                self.process_end(unit);
            }
            self.bridge.lock().frames.pop();
        }

        self.end_output_group(unit);

        let failed_keywords = {
            let mut state = self.bridge.lock();
            if unit.kind.is_structural() {
                Some(std::mem::take(&mut state.failed_keywords)).filter(|k| !k.is_empty())
            } else {
                if unit.status == Some(UnitStatus::Fail) && unit.source.is_some() {
                    let failed = FailedKeyword {
                        message: state.last_fail_message.clone(),
                        attributes: unit.clone(),
                    };
                    state.failed_keywords.insert(0, failed);
                }
                None
            }
        };

        self.emit(Event::custom(
            "unitEnded",
            &UnitEventBody {
                kind: unit.kind.event_type(),
                attributes: unit,
                failed_keywords,
            },
        ));
    }

    fn process_end(&self, unit: &UnitAttributes) {
        if unit.status != Some(UnitStatus::Fail) {
            return;
        }

        let with_message = |prefix: &str| match &unit.message {
            Some(message) if !message.is_empty() => format!("{}: {}", prefix, message),
            _ => prefix.to_string(),
        };

        let stopped = {
            let mut state = self.bridge.lock();
            let (filter, description, text) = match unit.kind {
                UnitKind::Suite => (FAILED_SUITE, "Suite failed.", with_message("Suite failed")),
                UnitKind::Test => (FAILED_TEST, "Test failed.", with_message("Test failed")),
                _ => (
                    FAILED_KEYWORD,
                    "Keyword failed.",
                    format!(
                        "Keyword failed: {}",
                        state.last_fail_message.as_deref().unwrap_or_default()
                    ),
                ),
            };

            if state.run_state == RunState::Stopped || !state.exceptions.is_enabled(filter) {
                false
            } else {
                state.run_state = RunState::Paused;
                let mut body = StoppedEventBody::new(reason::EXCEPTION, Self::thread_id(&state));
                body.description = Some(description.to_string());
                body.text = Some(text);
                body.all_threads_stopped = true;
                self.emit_stopped(&state, body);
                true
            }
        };

        if stopped {
            self.wait_for_running();
        }
    }

    /// A log line was written by the running unit
    pub fn log_message(&self, message: &LogMessage) {
        let (source, line, column, item_id) = {
            let mut state = self.bridge.lock();
            if message.level == "FAIL" {
                state.last_fail_message = Some(message.message.clone());
            }
            let top = state.frames.top();
            let item_id = state
                .frames
                .iter()
                .find(|f| f.kind.is_structural())
                .map(|f| f.name.clone());
            (
                top.and_then(|f| f.source.clone()),
                top.map(|f| f.line),
                top.map(|f| f.column),
                item_id,
            )
        };

        self.emit(Event::custom(
            "unitLog",
            &UnitLogBody {
                item_id,
                source: source.clone(),
                lineno: line,
                column,
                message,
            },
        ));

        if self.options.output_log {
            let has_source = source.is_some();
            self.emit(Event::Output(OutputEventBody {
                category: Some("console".to_string()),
                output: format!("LOG> {} {}: {}\n", message.timestamp, message.level, message.message),
                source: source.map(Source::from_path),
                line,
                column: has_source.then_some(0),
                ..Default::default()
            }));
        }
    }

    /// A message from the execution engine itself
    pub fn message(&self, message: &LogMessage) {
        if self.options.output_messages {
            self.emit(Event::Output(OutputEventBody {
                category: Some("messages".to_string()),
                output: format!("MSG> {} {}: {}\n", message.timestamp, message.level, message.message),
                ..Default::default()
            }));
        }
    }

    /// Names of every test and suite about to run, children before parents
    pub fn enqueued(&self, items: Vec<String>) {
        self.emit(Event::custom("unitsEnqueued", &serde_json::json!({ "items": items })));
    }

    /// The execution engine finished
    pub fn execution_exited(&self, exit_code: i32) {
        self.emit(Event::custom(
            "executionExited",
            &serde_json::json!({ "exitCode": exit_code }),
        ));
    }

    fn start_output_group(&self, unit: &UnitAttributes) {
        if !self.options.group_output {
            return;
        }

        let output = if unit.kind.is_structural() {
            format!("{} {}\n", unit.kind.label(), unit.name)
        } else {
            format!("{} {}({})\n", unit.kind.label(), unit.name, unit.args.join(", "))
        };
        self.emit(Event::Output(OutputEventBody {
            category: Some("console".to_string()),
            output,
            group: Some("startCollapsed".to_string()),
            source: unit.source.clone().map(Source::from_path),
            line: unit.line,
            ..Default::default()
        }));
    }

    fn end_output_group(&self, unit: &UnitAttributes) {
        if !self.options.group_output {
            return;
        }

        self.emit(Event::Output(OutputEventBody {
            category: Some("console".to_string()),
            output: String::new(),
            group: Some("end".to_string()),
            source: unit.source.clone().map(Source::from_path),
            line: unit.line,
            ..Default::default()
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::SessionConfig;
    use crate::common::{Error, Result};
    use crate::dap::{SourceBreakpoint, Thread};
    use crate::debugger::evaluator::{Evaluator, VariableStore};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::sync::mpsc::UnboundedReceiver;

    const SOURCE: &str = "/plans/listener_test.plan";

    struct Vars(Mutex<BTreeMap<String, Value>>);

    impl VariableStore for Vars {
        fn resolve(&self, name: &str) -> Result<Value> {
            let name = crate::debugger::evaluator::bare_name(name);
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
                out = out.replace(&format!("${{{}}}", name), &value.to_string());
            }
            Ok(out)
        }
        fn variables(&self) -> Vec<(String, Value)> {
            self.0.lock().unwrap().clone().into_iter().collect()
        }
    }

    struct Context(Arc<dyn VariableStore>);

    impl ExecutionContext for Context {
        fn scope(&self, _kind: ScopeKind) -> Option<Arc<dyn VariableStore>> {
            Some(Arc::clone(&self.0))
        }
    }

    /// Only understands `true` and `false`
    struct Literal;

    impl Evaluator for Literal {
        fn evaluate(&self, expression: &str, _store: &dyn VariableStore) -> Result<Value> {
            match expression.trim() {
                "true" => Ok(json!(true)),
                "false" => Ok(json!(false)),
                other => Err(Error::Evaluation(other.to_string())),
            }
        }
    }

    fn session(options: SessionConfig) -> (Arc<Debugger>, UnboundedReceiver<Event>, Arc<dyn ExecutionContext>) {
        let (debugger, rx) = Debugger::new(options, Arc::new(Literal));
        debugger.set_main_thread(Thread {
            id: 1,
            name: "main".to_string(),
        });
        debugger.start();
        let store: Arc<dyn VariableStore> = Arc::new(Vars(Mutex::new(BTreeMap::new())));
        let context: Arc<dyn ExecutionContext> = Arc::new(Context(store));
        (debugger, rx, context)
    }

    fn unit(name: &str, kind: UnitKind, line: u32) -> UnitAttributes {
        let mut unit = UnitAttributes::new(name, kind);
        unit.source = Some(SOURCE.to_string());
        unit.line = Some(line);
        unit
    }

    fn ended(mut unit: UnitAttributes, status: UnitStatus) -> UnitAttributes {
        unit.status = Some(status);
        unit
    }

    fn next_matching(rx: &mut UnboundedReceiver<Event>, wanted: impl Fn(&Event) -> bool) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match rx.try_recv() {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => {}
                Err(TryRecvError::Empty) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("no matching event: {:?}", e),
            }
        }
    }

    fn next_stop(rx: &mut UnboundedReceiver<Event>) -> StoppedEventBody {
        match next_matching(rx, |e| matches!(e, Event::Stopped(_))) {
            Event::Stopped(body) => body,
            _ => unreachable!(),
        }
    }

    fn stops(rx: &mut UnboundedReceiver<Event>) -> Vec<StoppedEventBody> {
        let mut stops = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Stopped(body) = event {
                stops.push(body);
            }
        }
        stops
    }

    fn custom_body(rx: &mut UnboundedReceiver<Event>, name: &str) -> Value {
        match next_matching(rx, |e| e.name() == name) {
            Event::Custom { body, .. } => body.unwrap_or_default(),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn path() -> String {
        normalize_source(Path::new(SOURCE)).to_string_lossy().into_owned()
    }

    #[test]
    fn test_stop_on_entry_blocks_until_continue() {
        let (debugger, mut rx, context) = session(SessionConfig {
            stop_on_entry: true,
            ..Default::default()
        });

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || debugger.start_unit(&context, &unit("Suite", UnitKind::Suite, 1)))
        };

        let stop = next_stop(&mut rx);
        assert_eq!(stop.reason, reason::ENTRY);
        assert_eq!(stop.thread_id, Some(1));
        assert!(!runner.is_finished());

        debugger.continue_(1).unwrap();
        runner.join().unwrap();
        assert_eq!(debugger.depth(), 1);
    }

    #[test]
    fn test_terminate_releases_paused_thread() {
        let (debugger, mut rx, context) = session(SessionConfig {
            stop_on_entry: true,
            ..Default::default()
        });

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || debugger.start_unit(&context, &unit("Suite", UnitKind::Suite, 1)))
        };
        next_stop(&mut rx);

        debugger.terminate();
        runner.join().unwrap();
        assert_eq!(debugger.run_state(), RunState::Stopped);
        assert!(matches!(
            next_matching(&mut rx, |e| matches!(e, Event::Continued(_))),
            Event::Continued(body) if body.thread_id == 1
        ));
    }

    #[test]
    fn test_repeated_stop_reports_continued_once() {
        let (debugger, mut rx, _context) = session(SessionConfig::default());

        debugger.stop();
        debugger.stop();
        debugger.terminate();

        let mut continued = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::Continued(_)) {
                continued += 1;
            }
        }
        assert_eq!(continued, 1);
        assert!(debugger.is_terminated());
    }

    #[test]
    fn test_breakpoint_stops_and_reports_ids() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        let set = debugger.set_breakpoints(
            &Source::from_path(SOURCE),
            Some(vec![SourceBreakpoint::at_line(3)]),
            None,
        );
        let id = set[0].id.unwrap();

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || {
                debugger.start_unit(&context, &unit("Suite", UnitKind::Suite, 1));
                debugger.start_unit(&context, &unit("Test", UnitKind::Test, 2));
                debugger.start_unit(&context, &unit("Log", UnitKind::Keyword, 3));
                debugger.end_unit(&ended(unit("Log", UnitKind::Keyword, 3), UnitStatus::Pass));
            })
        };

        let stop = next_stop(&mut rx);
        assert_eq!(stop.reason, reason::BREAKPOINT);
        assert_eq!(stop.hit_breakpoint_ids, vec![id]);
        assert_eq!(debugger.depth(), 3);

        let trace = debugger.stack_trace(1, None, None).unwrap();
        assert_eq!(trace.stack_frames[0].name, "Log");
        assert_eq!(trace.stack_frames[0].line, 3);
        assert_eq!(trace.total_frames, Some(3));

        debugger.continue_(1).unwrap();
        runner.join().unwrap();
        assert_eq!(debugger.depth(), 2);
    }

    #[test]
    fn test_hit_condition_stops_on_third_hit_only() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        let mut breakpoint = SourceBreakpoint::at_line(5);
        breakpoint.hit_condition = Some("3".to_string());
        debugger.set_breakpoints(&Source::from_path(SOURCE), Some(vec![breakpoint]), None);

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || {
                for _ in 0..4 {
                    debugger.start_unit(&context, &unit("Step", UnitKind::Keyword, 5));
                    debugger.end_unit(&ended(unit("Step", UnitKind::Keyword, 5), UnitStatus::Pass));
                }
            })
        };

        next_stop(&mut rx);
        debugger.continue_(1).unwrap();
        runner.join().unwrap();
        assert!(stops(&mut rx).is_empty());
    }

    #[test]
    fn test_condition_and_logpoint() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        let mut never = SourceBreakpoint::at_line(4);
        never.condition = Some("false".to_string());
        let mut logpoint = SourceBreakpoint::at_line(4);
        logpoint.log_message = Some("reached".to_string());
        debugger.set_breakpoints(&Source::from_path(SOURCE), Some(vec![never, logpoint]), None);

        debugger.start_unit(&context, &unit("Step", UnitKind::Keyword, 4));

        match next_matching(&mut rx, |e| matches!(e, Event::Output(_))) {
            Event::Output(body) => {
                assert_eq!(body.output, "reached");
                assert_eq!(body.line, Some(4));
            }
            _ => unreachable!(),
        }
        assert!(stops(&mut rx).is_empty());
        assert_eq!(debugger.run_state(), RunState::Running);
    }

    #[test]
    fn test_next_stops_at_sibling_not_child() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        debugger.set_breakpoints(&Source::from_path(SOURCE), None, Some(vec![3]));

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || {
                debugger.start_unit(&context, &unit("Test", UnitKind::Test, 1));
                debugger.start_unit(&context, &unit("First", UnitKind::Keyword, 3));
                debugger.start_unit(&context, &unit("Inner", UnitKind::Keyword, 10));
                debugger.end_unit(&ended(unit("Inner", UnitKind::Keyword, 10), UnitStatus::Pass));
                debugger.end_unit(&ended(unit("First", UnitKind::Keyword, 3), UnitStatus::Pass));
                debugger.start_unit(&context, &unit("Second", UnitKind::Keyword, 4));
            })
        };

        assert_eq!(next_stop(&mut rx).reason, reason::BREAKPOINT);
        debugger.next(1).unwrap();

        assert_eq!(next_stop(&mut rx).reason, reason::STEP);
        let trace = debugger.stack_trace(1, None, Some(1)).unwrap();
        assert_eq!(trace.stack_frames[0].name, "Second");
        assert_eq!(trace.total_frames, Some(2));

        debugger.continue_(1).unwrap();
        runner.join().unwrap();
    }

    #[test]
    fn test_step_in_stops_at_child() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        debugger.set_breakpoints(&Source::from_path(SOURCE), None, Some(vec![3]));

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || {
                debugger.start_unit(&context, &unit("First", UnitKind::Keyword, 3));
                debugger.start_unit(&context, &unit("Inner", UnitKind::Keyword, 10));
            })
        };

        next_stop(&mut rx);
        debugger.step_in(1).unwrap();
        assert_eq!(next_stop(&mut rx).reason, reason::STEP);
        assert_eq!(debugger.depth(), 2);

        debugger.continue_(1).unwrap();
        runner.join().unwrap();
    }

    #[test]
    fn test_next_on_test_frame_steps_in() {
        let (debugger, _rx, context) = session(SessionConfig::default());
        debugger.start_unit(&context, &UnitAttributes::new("Test", UnitKind::Test));

        debugger.next(1).unwrap();
        assert_eq!(debugger.requested_transition(), RequestedTransition::StepIn);
    }

    #[test]
    fn test_next_over_control_block_targets_one_deeper() {
        let (debugger, _rx, context) = session(SessionConfig::default());
        debugger.start_unit(&context, &UnitAttributes::new("Test", UnitKind::Test));
        debugger.start_unit(&context, &UnitAttributes::new("FOR", UnitKind::For));

        debugger.next(1).unwrap();
        assert_eq!(debugger.requested_transition(), RequestedTransition::Next);
        assert_eq!(debugger.bridge.lock().target_depth, 3);
    }

    #[test]
    fn test_step_out_skips_enclosing_control_blocks() {
        let (debugger, _rx, context) = session(SessionConfig::default());
        debugger.start_unit(&context, &UnitAttributes::new("Test", UnitKind::Test));
        debugger.start_unit(&context, &UnitAttributes::new("FOR", UnitKind::For));
        debugger.start_unit(&context, &UnitAttributes::new("Log", UnitKind::Keyword));
        assert_eq!(debugger.depth(), 3);

        debugger.step_out(1).unwrap();
        assert_eq!(debugger.requested_transition(), RequestedTransition::StepOut);
        assert_eq!(debugger.bridge.lock().target_depth, 1);
    }

    #[test]
    fn test_pause_stops_at_next_unit() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        debugger.pause(1).unwrap();
        assert_eq!(debugger.run_state(), RunState::Paused);

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || debugger.start_unit(&context, &unit("Log", UnitKind::Keyword, 2)))
        };

        assert_eq!(next_stop(&mut rx).reason, reason::PAUSE);
        assert_eq!(debugger.requested_transition(), RequestedTransition::None);
        debugger.continue_(1).unwrap();
        runner.join().unwrap();
    }

    #[test]
    fn test_pause_stops_at_unit_without_source() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        debugger.pause(1).unwrap();

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || {
                debugger.start_unit(&context, &UnitAttributes::new("Generated", UnitKind::Keyword))
            })
        };

        assert_eq!(next_stop(&mut rx).reason, reason::PAUSE);
        thread::sleep(Duration::from_millis(50));
        assert!(!runner.is_finished());

        debugger.continue_(1).unwrap();
        runner.join().unwrap();
        assert_eq!(debugger.depth(), 1);
    }

    #[test]
    fn test_failed_test_stops_when_filter_enabled() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        debugger.set_exception_breakpoints(vec![breakpoints::FAILED_TEST.to_string()], None, None);

        let runner = {
            let debugger = Arc::clone(&debugger);
            thread::spawn(move || {
                debugger.start_unit(&context, &unit("Test", UnitKind::Test, 1));
                let mut failed = ended(unit("Test", UnitKind::Test, 1), UnitStatus::Fail);
                failed.message = Some("boom".to_string());
                debugger.end_unit(&failed);
            })
        };

        let stop = next_stop(&mut rx);
        assert_eq!(stop.reason, reason::EXCEPTION);
        assert_eq!(stop.description.as_deref(), Some("Test failed."));
        assert_eq!(stop.text.as_deref(), Some("Test failed: boom"));

        debugger.continue_(1).unwrap();
        runner.join().unwrap();
        assert_eq!(debugger.depth(), 0);
    }

    #[test]
    fn test_failed_keyword_ignored_without_filter() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        debugger.start_unit(&context, &unit("Fail", UnitKind::Keyword, 2));
        debugger.end_unit(&ended(unit("Fail", UnitKind::Keyword, 2), UnitStatus::Fail));

        assert!(stops(&mut rx).is_empty());
        assert_eq!(debugger.depth(), 0);
    }

    #[test]
    fn test_no_debug_never_pauses() {
        let (debugger, mut rx, context) = session(SessionConfig {
            stop_on_entry: true,
            no_debug: true,
            ..Default::default()
        });
        debugger.set_breakpoints(&Source::from_path(SOURCE), None, Some(vec![1, 2]));

        debugger.start_unit(&context, &unit("Suite", UnitKind::Suite, 1));
        debugger.start_unit(&context, &unit("Log", UnitKind::Keyword, 2));

        assert!(stops(&mut rx).is_empty());
        assert_eq!(debugger.depth(), 2);
    }

    #[test]
    fn test_not_run_units_push_no_frame() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        let skipped = ended(unit("Skipped", UnitKind::Test, 1), UnitStatus::NotRun);

        debugger.start_unit(&context, &skipped);
        assert_eq!(debugger.depth(), 0);
        debugger.end_unit(&skipped);

        assert_eq!(custom_body(&mut rx, "unitStarted")["type"], "test");
        assert_eq!(custom_body(&mut rx, "unitEnded")["attributes"]["status"], "NOT RUN");
    }

    #[test]
    fn test_failed_keywords_reported_with_test() {
        let (debugger, mut rx, context) = session(SessionConfig::default());
        debugger.start_unit(&context, &unit("Test", UnitKind::Test, 1));
        debugger.start_unit(&context, &unit("Should Be Equal", UnitKind::Keyword, 2));
        debugger.log_message(&LogMessage {
            level: "FAIL".to_string(),
            message: "1 != 2".to_string(),
            timestamp: "20260101 10:00:00.000".to_string(),
        });
        debugger.end_unit(&ended(unit("Should Be Equal", UnitKind::Keyword, 2), UnitStatus::Fail));
        debugger.end_unit(&ended(unit("Test", UnitKind::Test, 1), UnitStatus::Fail));

        let log = custom_body(&mut rx, "unitLog");
        assert_eq!(log["itemId"], "Test");
        assert_eq!(log["level"], "FAIL");
        assert_eq!(log["lineno"], 2);

        let keyword_end = custom_body(&mut rx, "unitEnded");
        assert_eq!(keyword_end["type"], "keyword");
        assert!(keyword_end.get("failedKeywords").is_none());

        let test_end = custom_body(&mut rx, "unitEnded");
        assert_eq!(test_end["type"], "test");
        let failed = test_end["failedKeywords"].as_array().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["message"], "1 != 2");
        assert_eq!(failed[0]["name"], "Should Be Equal");
    }

    #[test]
    fn test_group_and_log_output() {
        let (debugger, mut rx, context) = session(SessionConfig {
            output_log: true,
            group_output: true,
            ..Default::default()
        });
        let mut keyword = unit("Log", UnitKind::Keyword, 2);
        keyword.args = vec!["hello".to_string(), "INFO".to_string()];

        debugger.start_unit(&context, &keyword);
        debugger.log_message(&LogMessage {
            level: "INFO".to_string(),
            message: "hello".to_string(),
            timestamp: "ts".to_string(),
        });
        debugger.end_unit(&ended(keyword, UnitStatus::Pass));

        let outputs: Vec<OutputEventBody> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                Event::Output(body) => Some(body),
                _ => None,
            })
            .collect();

        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].group.as_deref(), Some("startCollapsed"));
        assert_eq!(outputs[0].output, "KEYWORD Log(hello, INFO)\n");
        assert_eq!(outputs[1].output, "LOG> ts INFO: hello\n");
        assert_eq!(outputs[1].source.as_ref().and_then(|s| s.path.clone()), Some(path()));
        assert_eq!(outputs[1].column, Some(0));
        assert_eq!(outputs[2].group.as_deref(), Some("end"));
    }
}
