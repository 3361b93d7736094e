//! Channel error types.

use thiserror::Error;

use crate::crypto::{FrameError, KeyExchangeError};

/// Errors reported by the secure channel.
///
/// None of these are fatal to the process. Each one is local to the current
/// connection and is handed to the error callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Connect, listen or write failure, or the handshake timed out.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer's public key was rejected. The connection is torn down.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] KeyExchangeError),

    /// One frame failed authentication and was dropped.
    #[error("Decryption failed")]
    Decryption,

    /// Operation not allowed in the current connection state.
    #[error("{0}")]
    State(&'static str),

    /// The peer violated the framing rules. The connection is torn down.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Shorthand for the error returned by `send` outside the secure state.
    pub fn not_connected() -> Self {
        ChannelError::State("Not connected")
    }

    /// True if the connection cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::Transport(_)
                | ChannelError::Handshake(_)
                | ChannelError::Protocol(_)
        )
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Transport(err.to_string())
    }
}

impl From<FrameError> for ChannelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::DecryptionFailed | FrameError::TooShort(_) => ChannelError::Decryption,
            FrameError::TooLarge(len) => {
                ChannelError::Protocol(format!("Message too large: {} bytes", len))
            }
            FrameError::EncryptionFailed => {
                ChannelError::Protocol("Frame encryption failed".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_mapping() {
        assert!(matches!(
            ChannelError::from(FrameError::DecryptionFailed),
            ChannelError::Decryption
        ));
        assert!(matches!(
            ChannelError::from(FrameError::TooLarge(5)),
            ChannelError::Protocol(_)
        ));
    }

    #[test]
    fn test_fatality() {
        assert!(!ChannelError::Decryption.is_fatal());
        assert!(!ChannelError::not_connected().is_fatal());
        assert!(ChannelError::Handshake(KeyExchangeError::NonContributory).is_fatal());
        assert!(ChannelError::Protocol("x".into()).is_fatal());
    }

    #[test]
    fn test_not_connected_message() {
        assert_eq!(ChannelError::not_connected().to_string(), "Not connected");
    }
}
