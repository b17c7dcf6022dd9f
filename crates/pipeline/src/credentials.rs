//! Credential provider collaborator.
//!
//! The pipeline never performs any token exchange itself. Callers hand it an
//! explicit `SessionContext`; uploads ask the provider for a bearer token at
//! the start of each session and surface expiry as `AuthExpired`.

use crate::error::PipelineError;
use crate::job::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Authenticated session handed in by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub account: String,
    pub access_token: String,
    /// Unix milliseconds after which the token is no longer valid.
    pub expires_at_ms: Option<i64>,
}

impl SessionContext {
    pub fn new(account: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            access_token: access_token.into(),
            expires_at_ms: None,
        }
    }

    pub fn expiring_at(mut self, expires_at_ms: i64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    /// Session for stores that do not authenticate (local directories).
    pub fn local() -> Self {
        Self::new("local", "local")
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(false, |exp| now_ms >= exp)
    }
}

/// Supplies the bearer token for an upload session.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Result<String, PipelineError>;
}

/// Credential provider backed by a replaceable session.
#[derive(Debug, Default)]
pub struct SessionCredentials {
    session: RwLock<Option<SessionContext>>,
}

impl SessionCredentials {
    pub fn new(session: SessionContext) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }

    /// No session yet; every upload fails with `AuthExpired` until one is set.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Install a fresh session after the caller re-authenticated.
    pub fn replace_session(&self, session: SessionContext) {
        tracing::info!(account = %session.account, "session replaced");
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(session);
    }

    pub fn sign_out(&self) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn account(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.account.clone())
    }
}

impl CredentialProvider for SessionCredentials {
    fn bearer_token(&self) -> Result<String, PipelineError> {
        let guard = self.session.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(session)
                if !session.access_token.is_empty()
                    && !session.is_expired(current_timestamp_ms()) =>
            {
                Ok(session.access_token.clone())
            }
            _ => Err(PipelineError::AuthExpired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_session_yields_token() {
        let credentials = SessionCredentials::new(SessionContext::new("alice", "tok-1"));
        assert_eq!(credentials.bearer_token().unwrap(), "tok-1");
        assert_eq!(credentials.account().as_deref(), Some("alice"));
    }

    #[test]
    fn test_expired_or_missing_session_is_auth_expired() {
        let expired = SessionCredentials::new(
            SessionContext::new("alice", "tok-1").expiring_at(current_timestamp_ms() - 1),
        );
        assert!(matches!(
            expired.bearer_token(),
            Err(PipelineError::AuthExpired)
        ));

        let signed_out = SessionCredentials::signed_out();
        assert!(matches!(
            signed_out.bearer_token(),
            Err(PipelineError::AuthExpired)
        ));
    }

    #[test]
    fn test_replace_session_recovers_from_expiry() {
        let credentials = SessionCredentials::new(
            SessionContext::new("alice", "old").expiring_at(current_timestamp_ms() - 1),
        );
        assert!(credentials.bearer_token().is_err());

        credentials.replace_session(SessionContext::new("alice", "new"));
        assert_eq!(credentials.bearer_token().unwrap(), "new");

        credentials.sign_out();
        assert!(credentials.bearer_token().is_err());
        assert!(credentials.account().is_none());
    }
}
