//! Error taxonomy shared by the codec, the security context and the sessions.

use serde::Serialize;
use thiserror::Error;

use crate::{control::ControlState, crypto::CryptoError, messages::AcceptCode};

/// A buffer did not have the exact size of the record it was decoded as.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind}: expected exactly {expected} bytes, got {actual}")]
pub struct FrameError {
    /// Record being decoded.
    pub kind: &'static str,
    pub expected: usize,
    pub actual: usize,
}

impl FrameError {
    /// Fails unless `buf` is exactly `expected` bytes long.
    pub fn check(kind: &'static str, expected: usize, buf: &[u8]) -> Result<(), FrameError> {
        if buf.len() != expected {
            return Err(FrameError {
                kind,
                expected,
                actual: buf.len(),
            });
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum TwampError {
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Server rejected the control connection: {0}")]
    ServerRejected(AcceptCode),

    #[error("Server rejected the test session: {0}")]
    SessionRejected(AcceptCode),

    #[error("Server failed to start the test sessions: {0}")]
    StartFailed(AcceptCode),

    #[error("Authentication failed on {0}")]
    AuthenticationFailed(&'static str),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("No common security mode (server offers {server:#x}, client allows {client:#x})")]
    NoCommonMode { server: u32, client: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key material error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("{operation} is not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ControlState,
    },
}

/// Copyable summary of a fatal error, kept in [`ControlState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Frame,
    ProtocolViolation,
    ServerRejected(AcceptCode),
    SessionRejected(AcceptCode),
    StartFailed(AcceptCode),
    AuthenticationFailed,
    Timeout,
    NoCommonMode,
    Cancelled,
    Io,
    Crypto,
    InvalidState,
}

impl TwampError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            TwampError::Frame(_) => FailureKind::Frame,
            TwampError::ProtocolViolation(_) => FailureKind::ProtocolViolation,
            TwampError::ServerRejected(code) => FailureKind::ServerRejected(*code),
            TwampError::SessionRejected(code) => FailureKind::SessionRejected(*code),
            TwampError::StartFailed(code) => FailureKind::StartFailed(*code),
            TwampError::AuthenticationFailed(_) => FailureKind::AuthenticationFailed,
            TwampError::Timeout(_) => FailureKind::Timeout,
            TwampError::NoCommonMode { .. } => FailureKind::NoCommonMode,
            TwampError::Cancelled => FailureKind::Cancelled,
            TwampError::Io(_) => FailureKind::Io,
            TwampError::Crypto(_) => FailureKind::Crypto,
            TwampError::InvalidState { .. } => FailureKind::InvalidState,
        }
    }
}

pub type Result<T, E = TwampError> = std::result::Result<T, E>;
