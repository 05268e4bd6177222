//! Debug session state machine
//!
//! One [`Debugger`] exists per process. Protocol handlers call the client
//! operations below, the execution thread calls the lifecycle callbacks in
//! [`super::listener`]. Both go through the same [`Bridge`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::common::config::SessionConfig;
use crate::common::paths::normalize_source;
use crate::common::{Error, Result};
use crate::dap::{
    Breakpoint, ContinuedEventBody, EvaluateResponseBody, Event, ExceptionFilterOptions, Scope,
    SetVariableResponseBody, Source, SourceBreakpoint, StackFrame, StackTraceResponseBody,
    StoppedEventBody, Thread, Variable,
};

use super::breakpoints::{BreakpointEntry, BreakpointTable, ExceptionBreakpoints, HitCounter};
use super::bridge::Bridge;
use super::evaluator::{
    bare_name, format_value, is_variable_reference, type_name, Evaluator, ScopeKind, VariableStore,
};
use super::frames::{decode_reference, FrameStack};
use super::listener::FailedKeyword;

/// Run state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not debugging, or the session ended
    Stopped,
    Running,
    /// The execution thread is (or is about to be) parked
    Paused,
}

/// Client command not yet acted on by the execution thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedTransition {
    None,
    Pause,
    Next,
    StepIn,
    StepOut,
}

/// Stop reasons reported in `stopped` events
pub mod reason {
    pub const ENTRY: &str = "entry";
    pub const PAUSE: &str = "pause";
    pub const STEP: &str = "step";
    pub const BREAKPOINT: &str = "breakpoint";
    pub const EXCEPTION: &str = "exception";
}

/// Everything guarded by the bridge lock
pub(super) struct SessionState {
    pub(super) run_state: RunState,
    pub(super) requested: RequestedTransition,
    pub(super) target_depth: usize,
    pub(super) main_thread: Option<Thread>,
    pub(super) frames: FrameStack,
    pub(super) breakpoints: BreakpointTable,
    pub(super) hit_counts: HitCounter,
    pub(super) exceptions: ExceptionBreakpoints,
    pub(super) stop_on_entry: bool,
    pub(super) last_fail_message: Option<String>,
    pub(super) failed_keywords: Vec<FailedKeyword>,
}

/// Debug session shared by the protocol handlers and the execution thread
pub struct Debugger {
    pub(super) bridge: Bridge<SessionState>,
    pub(super) evaluator: Arc<dyn Evaluator>,
    pub(super) options: SessionConfig,
    events: mpsc::UnboundedSender<Event>,
    last_breakpoint_id: AtomicU32,
    terminated: AtomicBool,
}

impl Debugger {
    /// Create the session and the receiving end of its event channel
    pub fn new(
        options: SessionConfig,
        evaluator: Arc<dyn Evaluator>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = SessionState {
            run_state: RunState::Stopped,
            requested: RequestedTransition::None,
            target_depth: 0,
            main_thread: None,
            frames: FrameStack::new(),
            breakpoints: BreakpointTable::default(),
            hit_counts: HitCounter::default(),
            exceptions: ExceptionBreakpoints::default(),
            stop_on_entry: options.stop_on_entry,
            last_fail_message: None,
            failed_keywords: Vec::new(),
        };

        let debugger = Arc::new(Self {
            bridge: Bridge::new(state),
            evaluator,
            options,
            events,
            last_breakpoint_id: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
        });
        (debugger, rx)
    }

    /// Queue an event for the client
    pub fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::trace!("Event channel closed, dropping event");
        }
    }

    pub(super) fn emit_stopped(&self, state: &SessionState, body: StoppedEventBody) {
        tracing::debug!(reason = %body.reason, depth = state.frames.depth(), "Stopping");
        self.emit(Event::Stopped(body));
    }

    pub(super) fn thread_id(state: &SessionState) -> Option<i64> {
        state.main_thread.as_ref().map(|t| t.id)
    }

    pub fn debug_enabled(&self) -> bool {
        !self.options.no_debug
    }

    // === Run state ===

    pub fn run_state(&self) -> RunState {
        self.bridge.lock().run_state
    }

    pub fn requested_transition(&self) -> RequestedTransition {
        self.bridge.lock().requested
    }

    /// Current stack depth
    pub fn depth(&self) -> usize {
        self.bridge.lock().frames.depth()
    }

    /// Stopped -> Running
    #[tracing::instrument(skip(self))]
    pub fn start(&self) {
        self.bridge.update(|s| s.run_state = RunState::Running);
    }

    /// Any state -> Stopped, releasing a parked execution thread
    ///
    /// `continued` is only reported when the session wasn't stopped yet.
    #[tracing::instrument(skip(self))]
    pub fn stop(&self) {
        self.bridge.update(|s| {
            let previous = std::mem::replace(&mut s.run_state, RunState::Stopped);
            if previous == RunState::Stopped {
                return;
            }
            if let Some(thread_id) = Self::thread_id(s) {
                self.emit(Event::Continued(ContinuedEventBody {
                    thread_id,
                    all_threads_continued: true,
                }));
            }
        });
    }

    /// Stop the session for good and ask the execution engine to wind down
    ///
    /// Repeated calls do nothing.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Terminating debug session");
        self.stop();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Block until the execution thread may proceed
    pub fn wait_for_running(&self) {
        self.bridge
            .wait_until(|s| matches!(s.run_state, RunState::Running | RunState::Stopped));
    }

    /// Block until the session is paused, at most `timeout`
    pub fn wait_for_paused(&self, timeout: Duration) -> bool {
        self.bridge
            .wait_until_timeout(timeout, |s| s.run_state == RunState::Paused)
    }

    // === Threads ===

    /// Record the debuggable thread; only the first call has an effect
    pub fn set_main_thread(&self, thread: Thread) {
        let mut state = self.bridge.lock();
        if let Some(existing) = &state.main_thread {
            tracing::warn!(existing = existing.id, ignored = thread.id, "Main thread already set");
            return;
        }
        state.main_thread = Some(thread);
    }

    pub fn threads(&self) -> Vec<Thread> {
        self.bridge.lock().main_thread.iter().cloned().collect()
    }

    fn check_thread(state: &SessionState, thread_id: i64) -> Result<()> {
        match &state.main_thread {
            Some(thread) if thread.id == thread_id => Ok(()),
            _ => Err(Error::InvalidThread(thread_id)),
        }
    }

    // === Client transitions ===

    #[tracing::instrument(skip(self))]
    pub fn continue_(&self, thread_id: i64) -> Result<()> {
        self.transition(thread_id, |s| s.run_state = RunState::Running)
    }

    #[tracing::instrument(skip(self))]
    pub fn pause(&self, thread_id: i64) -> Result<()> {
        self.transition(thread_id, |s| {
            s.requested = RequestedTransition::Pause;
            s.run_state = RunState::Paused;
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn next(&self, thread_id: i64) -> Result<()> {
        self.transition(thread_id, |s| {
            s.run_state = RunState::Running;
            match s.frames.top() {
                Some(top) if top.kind.is_structural() => {
                    s.requested = RequestedTransition::StepIn;
                }
                top => {
                    let over_block = top.is_some_and(|f| f.kind.is_control_block());
                    s.requested = RequestedTransition::Next;
                    s.target_depth = s.frames.depth() + usize::from(over_block);
                }
            }
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn step_in(&self, thread_id: i64) -> Result<()> {
        self.transition(thread_id, |s| {
            s.requested = RequestedTransition::StepIn;
            s.run_state = RunState::Running;
        })
    }

    #[tracing::instrument(skip(self))]
    pub fn step_out(&self, thread_id: i64) -> Result<()> {
        self.transition(thread_id, |s| {
            s.requested = RequestedTransition::StepOut;
            s.run_state = RunState::Running;

            let depth = s.frames.depth();
            let mut target = depth.saturating_sub(1);
            let mut index = 1;
            while index < depth
                && s.frames.get(index).is_some_and(|f| f.kind.is_control_block())
            {
                target = target.saturating_sub(1);
                index += 1;
            }
            s.target_depth = target;
        })
    }

    fn transition(&self, thread_id: i64, change: impl FnOnce(&mut SessionState)) -> Result<()> {
        {
            let state = self.bridge.lock();
            Self::check_thread(&state, thread_id)?;
        }
        self.bridge.update(change);
        Ok(())
    }

    // === Breakpoints ===

    /// Replace the breakpoints of one source
    ///
    /// `lines` is only used when `breakpoints` is absent. An empty set
    /// clears the source.
    pub fn set_breakpoints(
        &self,
        source: &Source,
        breakpoints: Option<Vec<SourceBreakpoint>>,
        lines: Option<Vec<u32>>,
    ) -> Vec<Breakpoint> {
        let Some(path) = source.path.as_deref().filter(|p| !p.is_empty()) else {
            tracing::error!(?source, "Breakpoints without a source path are not supported");
            return Vec::new();
        };
        let path = normalize_source(Path::new(path)).to_string_lossy().into_owned();

        let requested = breakpoints
            .unwrap_or_else(|| lines.unwrap_or_default().into_iter().map(SourceBreakpoint::at_line).collect());
        let entries: Vec<BreakpointEntry> = requested
            .into_iter()
            .map(|bp| BreakpointEntry::new(self.last_breakpoint_id.fetch_add(1, Ordering::SeqCst) + 1, bp))
            .collect();
        let result = entries.iter().map(|e| e.to_dap(&path)).collect();

        tracing::debug!(path = %path, count = entries.len(), "Setting breakpoints");
        self.bridge.lock().breakpoints.replace(&path, entries);
        result
    }

    /// Replace the exception filter configuration
    pub fn set_exception_breakpoints(
        &self,
        filters: Vec<String>,
        filter_options: Option<Vec<ExceptionFilterOptions>>,
        exception_options: Option<Vec<Value>>,
    ) -> Option<Vec<Breakpoint>> {
        let result = self.bridge.lock().exceptions.configure(
            filters,
            filter_options.unwrap_or_default(),
            exception_options.unwrap_or_default(),
        );
        (!result.is_empty()).then_some(result)
    }

    // === Inspection ===

    pub fn stack_trace(
        &self,
        thread_id: i64,
        start_frame: Option<i64>,
        levels: Option<i64>,
    ) -> Result<StackTraceResponseBody> {
        let state = self.bridge.lock();
        Self::check_thread(&state, thread_id)?;

        let total = state.frames.depth();
        let start = start_frame.unwrap_or(0).max(0) as usize;
        let count = match levels {
            Some(n) if n > 0 => n as usize,
            _ => total,
        };

        let stack_frames = state
            .frames
            .iter()
            .skip(start)
            .take(count)
            .map(|f| StackFrame {
                id: f.id,
                name: f.name.clone(),
                source: f.source.clone().map(Source::from_path),
                line: f.line,
                column: f.column,
            })
            .collect();

        Ok(StackTraceResponseBody {
            stack_frames,
            total_frames: Some(total as i64),
        })
    }

    /// Scopes of a frame: Local, then Test and Suite when distinct, then Global
    pub fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        let state = self.bridge.lock();
        let frame = state.frames.find(frame_id).ok_or(Error::FrameNotFound(frame_id))?;
        if frame.context().is_none() {
            return Ok(Vec::new());
        }

        let local = frame.scope(ScopeKind::Local);
        let distinct_from_local = |store: &Option<Arc<dyn VariableStore>>| match (store, &local) {
            (Some(store), Some(local)) => !Arc::ptr_eq(store, local),
            (Some(_), None) => true,
            (None, _) => false,
        };

        let scope = |kind: ScopeKind| Scope {
            name: kind.label().to_string(),
            presentation_hint: Some(kind.hint().to_string()),
            variables_reference: frame.variables_reference(kind),
            expensive: false,
        };

        let mut scopes = vec![scope(ScopeKind::Local)];
        for kind in [ScopeKind::Test, ScopeKind::Suite] {
            if distinct_from_local(&frame.scope(kind)) {
                scopes.push(scope(kind));
            }
        }
        if frame.scope(ScopeKind::Global).is_some() {
            scopes.push(scope(ScopeKind::Global));
        }
        Ok(scopes)
    }

    /// Store behind a variables reference plus the store of the next outer scope
    fn resolve_reference(
        &self,
        reference: i64,
    ) -> Option<(Arc<dyn VariableStore>, Option<Arc<dyn VariableStore>>)> {
        let (frame_id, kind) = decode_reference(reference)?;
        let state = self.bridge.lock();
        let frame = state.frames.find(frame_id)?;
        let store = frame.scope(kind)?;

        let outer = ScopeKind::ALL[kind.index() + 1..]
            .iter()
            .filter_map(|k| frame.scope(*k))
            .find(|outer| !Arc::ptr_eq(outer, &store));
        Some((store, outer))
    }

    /// Variables of a scope, leaving out those the next outer scope shows identically
    pub fn variables(&self, reference: i64, start: Option<i64>, count: Option<i64>) -> Vec<Variable> {
        let Some((store, outer)) = self.resolve_reference(reference) else {
            return Vec::new();
        };

        let inherited: Vec<(String, Value)> = outer.map(|o| o.variables()).unwrap_or_default();
        let start = start.unwrap_or(0).max(0) as usize;
        let count = match count {
            Some(n) if n > 0 => n as usize,
            _ => usize::MAX,
        };

        store
            .variables()
            .into_iter()
            .filter(|(name, value)| !inherited.iter().any(|(n, v)| n == name && v == value))
            .skip(start)
            .take(count)
            .map(|(name, value)| Variable {
                name,
                value: format_value(&value),
                type_name: Some(type_name(&value).to_string()),
                variables_reference: 0,
            })
            .collect()
    }

    /// Store an evaluation without a frame runs against
    fn evaluation_store(&self, frame_id: Option<i64>) -> Option<Arc<dyn VariableStore>> {
        let state = self.bridge.lock();
        match frame_id {
            Some(id) => state.frames.find(id).and_then(|f| f.scope(ScopeKind::Local)),
            None => state
                .frames
                .top()
                .and_then(|f| f.context())
                .and_then(|c| c.scope(ScopeKind::Global)),
        }
    }

    /// Evaluate an expression for the client
    ///
    /// Hover lookups that fail yield an empty result. Other failures are
    /// reported as the result text.
    pub fn evaluate(&self, expression: &str, frame_id: Option<i64>, context: Option<&str>) -> EvaluateResponseBody {
        if expression.is_empty() {
            return EvaluateResponseBody::default();
        }

        let hover = context == Some("hover");
        let outcome = self
            .evaluation_store(frame_id)
            .ok_or_else(|| Error::Evaluation("No execution context available".to_string()))
            .and_then(|store| {
                if hover {
                    let name = if is_variable_reference(expression) {
                        expression.to_string()
                    } else {
                        format!("${{{}}}", expression.trim())
                    };
                    store.resolve(&name)
                } else if is_variable_reference(expression) {
                    store.resolve(expression.trim())
                } else {
                    let expanded = store.replace_variables(expression)?;
                    self.evaluator.evaluate(&expanded, store.as_ref())
                }
            });

        match outcome {
            Ok(value) => EvaluateResponseBody {
                result: format_value(&value),
                type_name: Some(type_name(&value).to_string()),
                variables_reference: 0,
            },
            Err(_) if hover => EvaluateResponseBody::default(),
            Err(e) => EvaluateResponseBody {
                result: e.to_string(),
                type_name: None,
                variables_reference: 0,
            },
        }
    }

    /// Assign a new value, given as an expression, to a variable of a scope
    pub fn set_variable(&self, reference: i64, name: &str, value: &str) -> Result<SetVariableResponseBody> {
        let (store, _) = self
            .resolve_reference(reference)
            .ok_or(Error::InvalidVariableReference(reference))?;

        if !store.contains(bare_name(name)) && !store.contains(name) {
            return Err(Error::VariableNotFound(name.to_string()));
        }

        let expanded = store.replace_variables(value)?;
        let evaluated = self.evaluator.evaluate(&expanded, store.as_ref())?;
        store.assign(name, evaluated.clone())?;

        Ok(SetVariableResponseBody {
            value: format_value(&evaluated),
            type_name: Some(type_name(&evaluated).to_string()),
            variables_reference: 0,
        })
    }
}
