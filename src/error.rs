//! Error types for Tether

use std::time::Duration;

use thiserror::Error;

use crate::infra::lsp::protocol::{ResponseError, error_codes};
use crate::workspace::ChangeError;

pub type TetherResult<T> = std::result::Result<T, TetherError>;

#[derive(Debug, Error)]
pub enum TetherError {
    #[error("{0}")]
    Lsp(#[from] LspError),

    #[error("{0}")]
    Workspace(#[from] WorkspaceError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LspError {
    #[error("Not connected to a language server")]
    NotConnected,

    #[error("Transport send failed: {0}")]
    Transport(#[source] std::io::Error),

    #[error("'{method}' timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("Request cancelled")]
    RequestCancelled,

    #[error("Server error [{code}]: {message}")]
    ServerError { code: i32, message: String },

    #[error("Server does not support '{method}'")]
    Unsupported { method: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handler registration rejected: {0}")]
    HandlerConflict(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LspError {
    pub fn error_code(&self) -> i32 {
        match self {
            Self::ServerError { code, .. } => *code,
            Self::RequestCancelled => error_codes::REQUEST_CANCELLED,
            Self::NotConnected => error_codes::SERVER_NOT_INITIALIZED,
            Self::Unsupported { .. } => error_codes::METHOD_NOT_FOUND,
            Self::Json(_) => error_codes::PARSE_ERROR,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::RequestCancelled)
            || matches!(self, Self::ServerError { code, .. } if *code == error_codes::REQUEST_CANCELLED)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_content_modified(&self) -> bool {
        matches!(self, Self::ServerError { code, .. } if *code == error_codes::CONTENT_MODIFIED)
    }

    /// Failures worth retrying: the server may answer differently next time.
    pub fn is_recoverable(&self) -> bool {
        self.is_timeout() || self.is_cancelled() || self.is_content_modified()
    }
}

impl From<ResponseError> for LspError {
    fn from(err: ResponseError) -> Self {
        if err.code == error_codes::REQUEST_CANCELLED {
            return LspError::RequestCancelled;
        }
        LspError::ServerError {
            code: err.code,
            message: err.message,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Document already open: {0}")]
    AlreadyOpen(String),

    #[error("Document not open: {0}")]
    NotOpen(String),

    #[error("Invalid edit for {uri}: {reason}")]
    InvalidEdit { uri: String, reason: String },

    #[error("Edit history for {uri} no longer reaches version {version}")]
    MappingUnavailable { uri: String, version: u64 },

    #[error("Document was not open when the mapping started: {0}")]
    UnknownDocument(String),

    #[error("Document was closed after the mapping started: {0}")]
    DocumentClosed(String),

    #[error("Offset {offset} is outside {uri} (length {len})")]
    PositionOutOfRange {
        uri: String,
        offset: usize,
        len: usize,
    },

    #[error(transparent)]
    Change(#[from] ChangeError),
}

impl WorkspaceError {
    pub(crate) fn invalid_edit(uri: &str, reason: impl Into<String>) -> Self {
        Self::InvalidEdit {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_response_maps_to_request_cancelled() {
        let err = LspError::from(ResponseError {
            code: -32800,
            message: "cancelled".to_string(),
            data: None,
        });
        assert!(matches!(err, LspError::RequestCancelled));
        assert!(err.is_cancelled());
        assert_eq!(err.error_code(), -32800);
    }

    #[test]
    fn test_server_error_keeps_code() {
        let err = LspError::from(ResponseError {
            code: -32602,
            message: "bad params".to_string(),
            data: None,
        });
        assert_eq!(err.error_code(), -32602);
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "Server error [-32602]: bad params");
    }

    #[test]
    fn test_timeout_is_recoverable() {
        let err = LspError::Timeout {
            method: "textDocument/hover".to_string(),
            timeout: Duration::from_millis(3000),
        };
        assert!(err.is_timeout());
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "'textDocument/hover' timed out after 3000ms");
    }

    #[test]
    fn test_content_modified_is_recoverable() {
        let err = LspError::ServerError {
            code: -32801,
            message: "content modified".to_string(),
        };
        assert!(err.is_content_modified());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_transport_failure_is_not_recoverable() {
        let err = LspError::Transport(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "closed",
        ));
        assert!(!err.is_recoverable());
        assert_eq!(err.error_code(), -32603);
    }
}
