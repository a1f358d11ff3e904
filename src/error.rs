//! Error types for DFE sessions
//!
//! Transport failures (the connection or the framing broke) are kept apart
//! from remote failures (the service received the call and refused it), so
//! callers can tell a dead server from a bad request.

use std::io;
use thiserror::Error;

/// Failure of the framed transport underneath the RPC stubs
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u64),

    #[error("Reply sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u32, got: u32 },

    #[error("Unexpected reply to {method}: {detail}")]
    UnexpectedReply { method: &'static str, detail: String },

    #[error("Transport is closed")]
    Closed,
}

/// Errors surfaced by the session client
#[derive(Debug, Error)]
pub enum DfeError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Remote call {method} failed: {message}")]
    Remote { method: &'static str, message: String },

    #[error("Array length mismatch: expected {expected} elements, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Element type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
}

impl DfeError {
    /// True if the failure came from the connection rather than the service
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl From<io::Error> for DfeError {
    fn from(e: io::Error) -> Self {
        Self::Transport(TransportError::Io(e))
    }
}

pub type Result<T, E = DfeError> = std::result::Result<T, E>;
