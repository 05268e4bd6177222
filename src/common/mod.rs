//! Common utilities shared by the protocol engine, the debugger and the server

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};
