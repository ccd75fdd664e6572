//! Per-session context shared across components.

use crate::relay::Role;
use crate::token::SessionToken;

/// State established at registration and read-only afterwards.
///
/// Each field is written exactly once, by the session client, when the
/// relay confirms registration. Components receive the context by
/// reference; nothing mutates it after construction.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub token: SessionToken,
    pub role: Role,
    /// Relay-reported expiry, ISO-8601. Carried for display only; the
    /// local waiting watchdog bounds the session independently.
    pub expires_at: String,
}

impl SessionContext {
    pub fn new(token: SessionToken, role: Role, expires_at: String) -> Self {
        Self {
            token,
            role,
            expires_at,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }
}
