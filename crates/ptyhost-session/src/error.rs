use ptyhost_pty::PtyError;

use crate::session::{SessionId, SessionState};

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error("session {id} is {state:?}, expected {expected:?}")]
    InvalidState {
        id: SessionId,
        state: SessionState,
        expected: SessionState,
    },
    #[error("file transfer rejected: {0}")]
    TransferRejected(String),
    #[error("file transfer failed: {0}")]
    Transfer(String),
    #[error("invalid session config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}
