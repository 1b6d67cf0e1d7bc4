//! Contracts of the external identity and profile backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pipedesk_auth::{Profile, ProfilePatch, Session, UserIdentity};
use pipedesk_core::UserId;
use pipedesk_events::Subscription;

use crate::error::{BackendError, ProfileError};

/// Kind of change pushed by the identity backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthChangeKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// One notification on the identity change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChange {
    pub kind: AuthChangeKind,
    /// The session after the change; `None` when signed out or expired.
    pub session: Option<Session>,
}

impl AuthChange {
    pub fn new(kind: AuthChangeKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }

    pub fn signed_out() -> Self {
        Self::new(AuthChangeKind::SignedOut, None)
    }
}

/// Result of a sign-up. Backends that require email confirmation return
/// the new identity without a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpOutcome {
    pub user: UserIdentity,
    pub session: Option<Session>,
}

/// Remote credential verification, session issuance and change notification.
///
/// Successful `sign_in_with_password`, `sign_up` (with a session),
/// `sign_out` and `refresh_session` must also be announced on the change
/// stream.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Currently held session, if any. Absence is a valid answer, not an error.
    async fn current_session(&self) -> Option<Session>;

    /// Register a listener on the change stream.
    fn subscribe(&self) -> Subscription<AuthChange>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
    -> Result<Session, BackendError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<SignUpOutcome, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Exchange the held refresh token for a new session.
    ///
    /// Success is announced as `TokenRefreshed`. A rejected refresh drops the
    /// held session and is announced as `SignedOut`.
    async fn refresh_session(&self) -> Result<Session, BackendError>;
}

/// Tenant-scoped profile records keyed by user id.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch_profile(&self, user_id: UserId) -> Result<Profile, ProfileError>;

    async fn update_profile(
        &self,
        user_id: UserId,
        patch: &ProfilePatch,
    ) -> Result<Profile, ProfileError>;
}
