//! Plan-driven execution engine
//!
//! Walks a TOML plan of suites, tests and keywords and reports it to the
//! debugger through the lifecycle callbacks.

pub mod expr;
pub mod plan;
pub mod store;

pub use expr::SimpleEvaluator;
pub use plan::{Plan, PlanRunner};
pub use store::MapStore;
