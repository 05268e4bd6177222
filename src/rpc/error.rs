//! Errors that cross the wire as failed responses

use serde_json::Value;

use crate::common::Error;
use crate::dap::ErrorDetail;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

/// Error returned by a dispatched handler
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub detail: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(command: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Unknown command '{}'", command))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// Structured form placed in the response body
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail {
            id: self.code,
            format: self.message.clone(),
            show_user: self.code == SERVER_ERROR,
            variables: self.detail.clone(),
        }
    }
}

impl From<&Error> for RpcError {
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::DapProtocol(_) | Error::UnsupportedCharset(_) => PARSE_ERROR,
            Error::Json(_) | Error::Internal(_) => INTERNAL_ERROR,
            _ => SERVER_ERROR,
        };

        Self::new(code, e.to_string())
    }
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        Self::from(&e)
    }
}
