//! Protocol-level failures and their mapping onto wire error codes.

use crate::auth::AuthError;
use shared::{DecodeError, ErrorCode, ServerMessage};
use thiserror::Error;

/// Everything a session can report back to its client as an `error` frame.
///
/// Only [`ProtocolError::Internal`] is fatal; every other variant leaves the
/// connection open so the client can correct itself and retry.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Authentication failed")]
    InvalidToken(#[source] AuthError),

    #[error("Space not found")]
    SpaceNotFound(String),

    #[error("User not in a space")]
    NotInSpace,

    #[error("Already joined space {0}")]
    AlreadyJoined(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("An unexpected error occurred: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidToken(_) => ErrorCode::InvalidToken,
            ProtocolError::SpaceNotFound(_) => ErrorCode::SpaceNotFound,
            ProtocolError::NotInSpace => ErrorCode::NotInSpace,
            ProtocolError::AlreadyJoined(_) => ErrorCode::AlreadyJoined,
            ProtocolError::Decode(e) => e.code(),
            ProtocolError::Internal(_) => ErrorCode::UnknownError,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::error(self.code(), self.to_string())
    }
}
