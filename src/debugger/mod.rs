//! Debug session core
//!
//! Independent of the transport: the session receives client operations,
//! lifecycle callbacks from the execution thread, and reports back through
//! an event channel.

pub mod breakpoints;
pub mod bridge;
pub mod evaluator;
pub mod frames;
pub mod listener;
pub mod session;

pub use evaluator::{Evaluator, ExecutionContext, ScopeKind, VariableStore};
pub use listener::{LogMessage, UnitAttributes, UnitKind, UnitStatus};
pub use session::{Debugger, RequestedTransition, RunState};
