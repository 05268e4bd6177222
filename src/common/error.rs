//! Error types for the debug adapter
//!
//! Messages end up in front of a human looking at a debugger UI, so they
//! name the offending id or value whenever one is known.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the debug adapter
#[derive(Error, Debug)]
pub enum Error {
    // === Transport / Protocol Errors ===
    #[error("DAP protocol error: {0}")]
    DapProtocol(String),

    #[error("Unsupported charset '{0}' in Content-Type header")]
    UnsupportedCharset(String),

    #[error("Client connection closed")]
    ConnectionClosed,

    #[error("A client is already connected; only one connection is allowed")]
    AlreadyConnected,

    #[error("DAP request '{command}' failed: {message}")]
    DapRequestFailed { command: String, message: String },

    // === Session Errors ===
    #[error("Invalid threadId {0}")]
    InvalidThread(i64),

    #[error("Frame {0} not found")]
    FrameNotFound(i64),

    #[error("Invalid variable reference.")]
    InvalidVariableReference(i64),

    #[error("Variable '{0}' not found.")]
    VariableNotFound(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    // === Timeout Errors ===
    #[error("No incoming connection from a debugger client after {0} seconds")]
    ClientTimeout(u64),

    #[error("Timeout waiting for configuration from client after {0} seconds")]
    ConfigurationTimeout(u64),

    #[error("Request '{command}' timed out after {millis} ms")]
    RequestTimeout { command: String, millis: u64 },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a DAP request failed error
    pub fn dap_request_failed(command: &str, message: &str) -> Self {
        Self::DapRequestFailed {
            command: command.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a request timeout error
    pub fn request_timeout(command: &str, timeout: std::time::Duration) -> Self {
        Self::RequestTimeout {
            command: command.to_string(),
            millis: timeout.as_millis() as u64,
        }
    }

    /// Whether this error is one of the timeout variants
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ClientTimeout(_) | Self::ConfigurationTimeout(_) | Self::RequestTimeout { .. }
        )
    }
}
