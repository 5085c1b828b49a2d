use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a client operation.
///
/// Serializable so that it crosses a message bus unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum ConsulError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to decode store response: {0}")]
    Decode(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("client is closed")]
    Closed,

    #[error("service bus error: {0}")]
    Bus(String),
}

impl ConsulError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for ConsulError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ConsulError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
