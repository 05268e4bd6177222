//! DAP request handlers
//!
//! Each handler is a thin synchronous call into the [`Debugger`]; domain
//! errors convert into error responses through `From<Error> for RpcError`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dap::{
    CancelArguments, Capabilities, ContinueArguments, ContinueResponseBody, DisconnectArguments,
    EvaluateArguments, EvaluateResponseBody, ExceptionBreakpointsFilter, InitializeArguments,
    NoArguments, PauseArguments, ScopesArguments, ScopesResponseBody, SetBreakpointsArguments,
    SetBreakpointsResponseBody, SetExceptionBreakpointsArguments,
    SetExceptionBreakpointsResponseBody, SetVariableArguments, SetVariableResponseBody,
    StackTraceArguments, StackTraceResponseBody, StepArguments, StepInArguments,
    TerminateArguments, ThreadsResponseBody, VariablesArguments, VariablesResponseBody,
};
use crate::debugger::breakpoints::{FAILED_KEYWORD, FAILED_SUITE, FAILED_TEST};
use crate::debugger::Debugger;
use crate::rpc::{Call, Field, ParamShape, Params, Registry, RpcError};

/// What the handlers share
pub struct AdapterState {
    pub debugger: Arc<Debugger>,
    /// Cancelled once the client sent `configurationDone`
    pub configuration_done: CancellationToken,
    /// Cancelled when the client left asking the execution to keep running
    pub released: CancellationToken,
}

const THREAD_ID: Field = Field::required("threadId");
const GRANULARITY: Field = Field::optional("granularity");

impl Params for InitializeArguments {
    const SHAPE: ParamShape = ParamShape::Fields {
        fields: &[],
        catch_all: true,
    };
}

impl Params for NoArguments {
    const SHAPE: ParamShape = ParamShape::NONE;
}

impl Params for SetBreakpointsArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[
        Field::required("source"),
        Field::optional("breakpoints"),
        Field::optional("lines"),
        Field::optional("sourceModified"),
    ]);
}

impl Params for SetExceptionBreakpointsArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[
        Field::required("filters"),
        Field::optional("filterOptions"),
        Field::optional("exceptionOptions"),
    ]);
}

impl Params for ContinueArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[THREAD_ID, Field::optional("singleThread")]);
}

impl Params for PauseArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[THREAD_ID]);
}

impl Params for StepArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[THREAD_ID, GRANULARITY]);
}

impl Params for StepInArguments {
    const SHAPE: ParamShape =
        ParamShape::fields(&[THREAD_ID, Field::optional("targetId"), GRANULARITY]);
}

impl Params for StackTraceArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[
        THREAD_ID,
        Field::optional("startFrame"),
        Field::optional("levels"),
    ]);
}

impl Params for ScopesArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[Field::required("frameId")]);
}

impl Params for VariablesArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[
        Field::required("variablesReference"),
        Field::optional("filter"),
        Field::optional("start"),
        Field::optional("count"),
    ]);
}

impl Params for EvaluateArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[
        Field::required("expression"),
        Field::optional("frameId"),
        Field::optional("context"),
    ]);
}

impl Params for SetVariableArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[
        Field::required("variablesReference"),
        Field::required("name"),
        Field::required("value"),
    ]);
}

impl Params for TerminateArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[Field::optional("restart")]);
}

impl Params for DisconnectArguments {
    const SHAPE: ParamShape = ParamShape::fields(&[
        Field::optional("restart"),
        Field::optional("terminateDebuggee"),
    ]);
}

impl Params for CancelArguments {
    const SHAPE: ParamShape =
        ParamShape::fields(&[Field::optional("requestId"), Field::optional("progressId")]);
}

/// Register a synchronous handler that gets the shared state
fn on<A, R, F>(registry: &Registry, name: &str, state: &Arc<AdapterState>, handler: F)
where
    A: Params,
    R: Serialize + Send + 'static,
    F: Fn(&AdapterState, A, &Call) -> Result<R, RpcError> + Send + Sync + 'static,
{
    let state = Arc::clone(state);
    let handler = Arc::new(handler);
    registry.register(name, move |args: A, call: Call| {
        let state = Arc::clone(&state);
        let handler = Arc::clone(&handler);
        async move { handler(&state, args, &call) }
    });
}

/// Capabilities advertised in the `initialize` response
pub fn capabilities() -> Capabilities {
    let filter = |id: &str, label: &str, description: &str, default: bool| ExceptionBreakpointsFilter {
        filter: id.to_string(),
        label: label.to_string(),
        description: Some(description.to_string()),
        default,
        supports_condition: false,
    };

    Capabilities {
        supports_configuration_done_request: true,
        supports_conditional_breakpoints: true,
        supports_hit_conditional_breakpoints: true,
        supports_evaluate_for_hovers: true,
        supports_set_variable: true,
        supports_log_points: true,
        supports_terminate_request: true,
        support_terminate_debuggee: true,
        supports_cancel_request: true,
        supports_exception_filter_options: true,
        exception_breakpoint_filters: vec![
            filter(FAILED_KEYWORD, "Failed Keywords", "Breaks on failed keywords", true),
            filter(FAILED_TEST, "Failed Test", "Breaks on failed tests", false),
            filter(FAILED_SUITE, "Failed Suite", "Breaks on failed suite", false),
        ],
    }
}

/// Register every DAP command the adapter answers
pub fn register(registry: &Registry, state: Arc<AdapterState>) {
    // === Session ===

    on(registry, "initialize", &state, |_, args: InitializeArguments, _| {
        tracing::info!(
            client = args.client_name.as_deref().unwrap_or("unknown"),
            adapter = args.adapter_id.as_deref().unwrap_or("unknown"),
            "Client initializing"
        );
        Ok(capabilities())
    });

    // The debuggee is the in-process execution thread, nothing to launch
    for name in ["launch", "attach"] {
        on(registry, name, &state, |_, _: Value, call| {
            tracing::debug!(command = %call.command, "Acknowledged");
            Ok(())
        });
    }

    on(registry, "configurationDone", &state, |s, _: NoArguments, _| {
        tracing::info!("Client configuration done");
        s.configuration_done.cancel();
        Ok(())
    });

    on(registry, "cancel", &state, |_, args: CancelArguments, call| {
        if let Some(request_id) = args.request_id {
            if !call.engine.cancel_request(request_id) {
                tracing::debug!(request_id, "Nothing to cancel");
            }
        }
        Ok(())
    });

    on(registry, "terminate", &state, |s, _: TerminateArguments, _| {
        s.debugger.terminate();
        Ok(())
    });

    on(registry, "disconnect", &state, |s, args: DisconnectArguments, call| {
        if args.terminate_debuggee == Some(false) {
            tracing::info!("Client disconnected, execution continues");
            s.released.cancel();
            s.debugger.stop();
        } else {
            s.debugger.terminate();
        }
        call.close_after_reply();
        Ok(())
    });

    // === Breakpoints ===

    on(registry, "setBreakpoints", &state, |s, args: SetBreakpointsArguments, _| {
        Ok(SetBreakpointsResponseBody {
            breakpoints: s.debugger.set_breakpoints(&args.source, args.breakpoints, args.lines),
        })
    });

    on(registry, "setExceptionBreakpoints", &state, |s, args: SetExceptionBreakpointsArguments, _| {
        let breakpoints = s.debugger.set_exception_breakpoints(
            args.filters,
            args.filter_options,
            args.exception_options,
        );
        Ok(breakpoints.map(|breakpoints| SetExceptionBreakpointsResponseBody {
            breakpoints: Some(breakpoints),
        }))
    });

    // === Execution control ===

    on(registry, "continue", &state, |s, args: ContinueArguments, _| {
        s.debugger.continue_(args.thread_id)?;
        Ok(ContinueResponseBody {
            all_threads_continued: true,
        })
    });

    on(registry, "pause", &state, |s, args: PauseArguments, _| {
        Ok(s.debugger.pause(args.thread_id)?)
    });

    on(registry, "next", &state, |s, args: StepArguments, _| {
        Ok(s.debugger.next(args.thread_id)?)
    });

    on(registry, "stepIn", &state, |s, args: StepInArguments, _| {
        Ok(s.debugger.step_in(args.thread_id)?)
    });

    on(registry, "stepOut", &state, |s, args: StepArguments, _| {
        Ok(s.debugger.step_out(args.thread_id)?)
    });

    // === Inspection ===

    on(registry, "threads", &state, |s, _: NoArguments, _| {
        Ok(ThreadsResponseBody {
            threads: s.debugger.threads(),
        })
    });

    on(registry, "stackTrace", &state, |s, args: StackTraceArguments, _| -> Result<StackTraceResponseBody, RpcError> {
        Ok(s.debugger.stack_trace(args.thread_id, args.start_frame, args.levels)?)
    });

    on(registry, "scopes", &state, |s, args: ScopesArguments, _| {
        Ok(ScopesResponseBody {
            scopes: s.debugger.scopes(args.frame_id)?,
        })
    });

    on(registry, "variables", &state, |s, args: VariablesArguments, _| {
        if let Some(filter) = &args.filter {
            tracing::trace!(filter = %filter, "Variable filter ignored");
        }
        Ok(VariablesResponseBody {
            variables: s.debugger.variables(args.variables_reference, args.start, args.count),
        })
    });

    on(registry, "evaluate", &state, |s, args: EvaluateArguments, _| -> Result<EvaluateResponseBody, RpcError> {
        Ok(s.debugger.evaluate(&args.expression, args.frame_id, args.context.as_deref()))
    });

    on(registry, "setVariable", &state, |s, args: SetVariableArguments, _| -> Result<SetVariableResponseBody, RpcError> {
        Ok(s.debugger.set_variable(args.variables_reference, &args.name, &args.value)?)
    });
}
