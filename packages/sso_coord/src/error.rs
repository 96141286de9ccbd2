//! Error types for the channel, the coordination store, and remote operations.

use serde::{Deserialize, Serialize};

/// HTTP status used by the remote API for SSO enforcement rejections.
pub const FORBIDDEN: u16 = 403;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("payload could not be encoded: {0}")]
    Payload(String),
}

impl ChannelError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Payload(_) => "payload",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Io(_) => "store_io",
            Self::Serialization(_) => "store_serialization",
        }
    }
}

/// Failure of a remote repository operation, as seen by the coordinator.
///
/// `status` is the HTTP status when the failure came from an HTTP response;
/// transport failures carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("remote operation failed (status {status:?}): {message}")]
pub struct RemoteError {
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// A failure without an HTTP status (network error, aborted request, ...).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.status == Some(FORBIDDEN)
    }
}
