//! Request/response/event engine on top of the DAP transport
//!
//! The [`Registry`] maps command names to typed handlers, the [`Engine`]
//! runs a connection against it.

pub mod engine;
pub mod error;
pub mod registry;

pub use engine::Engine;
pub use error::RpcError;
pub use registry::{Call, Field, ParamShape, Params, Registry};
