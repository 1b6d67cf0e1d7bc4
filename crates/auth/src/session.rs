//! Backend-issued session and the identity it carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pipedesk_core::UserId;

/// Immutable identity supplied by the identity backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub email: String,
}

/// Bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Proof of authentication: token plus the identity it was issued for.
///
/// Owned by the session synchronizer; views only ever see clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: AccessToken,
    #[serde(default)]
    pub refresh_token: Option<AccessToken>,
    pub user: UserIdentity,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionValidationError {
    #[error("session has expired")]
    Expired,

    #[error("session not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid session window (expires_at <= issued_at)")]
    InvalidTimeWindow,
}

impl Session {
    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    /// Check the validity window against `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), SessionValidationError> {
        if self.expires_at <= self.issued_at {
            return Err(SessionValidationError::InvalidTimeWindow);
        }
        if now < self.issued_at {
            return Err(SessionValidationError::NotYetValid);
        }
        if now >= self.expires_at {
            return Err(SessionValidationError::Expired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(issued_at: DateTime<Utc>, ttl: Duration) -> Session {
        Session {
            access_token: AccessToken::new("secret-token"),
            refresh_token: None,
            user: UserIdentity {
                id: UserId::new(),
                email: "s@example.com".into(),
            },
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    #[test]
    fn validity_window() {
        let now = Utc::now();
        assert_eq!(session(now, Duration::hours(1)).validate(now), Ok(()));
        assert_eq!(
            session(now - Duration::hours(2), Duration::hours(1)).validate(now),
            Err(SessionValidationError::Expired)
        );
        assert_eq!(
            session(now + Duration::minutes(5), Duration::hours(1)).validate(now),
            Err(SessionValidationError::NotYetValid)
        );
        assert_eq!(
            session(now, Duration::zero()).validate(now),
            Err(SessionValidationError::InvalidTimeWindow)
        );
    }

    #[test]
    fn debug_redacts_token() {
        let s = session(Utc::now(), Duration::hours(1));
        let rendered = format!("{s:?}");
        assert!(!rendered.contains("secret-token"));
    }
}
