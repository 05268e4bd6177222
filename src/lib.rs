//! dap-bridge - A Debug Adapter Protocol server for test execution engines
//!
//! The protocol engine frames and dispatches DAP messages, the debugger
//! tracks the paused/running state of one execution thread, and the runner
//! drives that thread from a plan file.

pub mod common;
pub mod dap;
pub mod debugger;
pub mod rpc;
pub mod runner;
pub mod server;

pub use common::{Error, Result};
