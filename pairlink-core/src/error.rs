//! Session error taxonomy.

use crate::capability::Capability;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Recoverable: re-request the capability and retry.
    #[error("permission denied: {0}")]
    PermissionDenied(Capability),
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("not connected")]
    NotConnected,
    /// A handle is live; disconnect first. The live connection is left untouched.
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("connect timed out")]
    Timeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, SessionError::PermissionDenied(_))
    }
}
