//! Error taxonomy for session establishment and transfer.

use thiserror::Error;

/// Errors surfaced by the session, signaling, link and transfer layers.
///
/// Only `InvalidToken` is recoverable by re-prompting the user; everything
/// else tears the current session down and requires a fresh attempt.
#[derive(Debug, Error)]
pub enum Error {
    /// Token failed local shape validation (16 hex characters). No network
    /// call is made for an invalid token.
    #[error("invalid session token: expected 16 hexadecimal characters")]
    InvalidToken,

    /// The relay rejected a request or could not be reached.
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    /// The relay connection dropped or reported an error we cannot recover
    /// from by reconnecting.
    #[error("signaling failed: {0}")]
    Signaling(String),

    /// Both peer slots for the token are already taken.
    #[error("session already has two registered peers")]
    SessionFull,

    /// The offer/answer exchange failed. Fatal for the session.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The data channel errored or closed unexpectedly mid-transfer.
    #[error("data channel failed: {0}")]
    Channel(String),

    /// Sending or reassembling file data failed. Partial output is
    /// discarded, never resumed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The peer never became ready within the wait window.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Classify a relay `error-message` payload.
    ///
    /// The relay reports a fully-occupied token as an error message rather
    /// than a dedicated event, so the conflict case is recognized here.
    pub fn from_relay_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("full") || lower.contains("occupied") {
            Error::SessionFull
        } else {
            Error::Signaling(message.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_message_classification() {
        assert!(matches!(
            Error::from_relay_message("session is full"),
            Error::SessionFull
        ));
        assert!(matches!(
            Error::from_relay_message("internal relay error"),
            Error::Signaling(_)
        ));
    }
}
