//! Session token validation and representation.
//!
//! A token is the shared rendezvous secret: exactly 16 hexadecimal
//! characters, matched case-insensitively. Validation happens locally,
//! before any network call.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of a session token in characters.
pub const TOKEN_LENGTH: usize = 16;

/// A validated session token, stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Parse and validate a token, normalizing to lowercase.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if !is_valid_token(trimmed) {
            return Err(Error::InvalidToken);
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check token shape: exactly 16 hex characters, any case.
pub fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_LENGTH && token.chars().all(|c| c.is_ascii_hexdigit())
}
