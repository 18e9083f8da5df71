use shared::domain::NamespaceId;
use thiserror::Error;

use crate::schema::SchemaViolation;

/// Reasons a command is refused before anything is sent.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Schema(#[from] SchemaViolation),
    #[error("{action}: {field} index {index} out of range (0..{len})")]
    OutOfRange {
        action: &'static str,
        field: &'static str,
        index: usize,
        len: usize,
    },
    #[error("{action}: failed to encode command: {source}")]
    Encode {
        action: &'static str,
        source: serde_json::Error,
    },
    #[error("no async runtime available to send {action}")]
    NoRuntime { action: &'static str },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request timed out")]
    Timeout,
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("namespace {namespace} is registered as {registered}, not {requested}")]
    KindMismatch {
        namespace: NamespaceId,
        registered: &'static str,
        requested: &'static str,
    },
}
