//! Debug Adapter Protocol (DAP) implementation
//!
//! This module implements the wire side of DAP: framing and the message
//! types exchanged with a debugging client.

pub mod codec;
pub mod types;

pub use types::*;
