use pipedesk_auth::{Profile, Role, Session, UserIdentity, authorize};

/// Where the synchronizer is in resolving the current user.
///
/// `Unauthenticated` and `Ready` are the settled phases; the others mean a
/// backend call is outstanding and `loading` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    ResolvingSession,
    ResolvingProfile,
    /// Settled without a session.
    Unauthenticated,
    /// Settled with a session; the profile may still be absent.
    Ready,
}

/// Why the last profile resolution left the profile empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileFailure {
    NotFound,
    Backend(String),
}

/// Internal bookkeeping kept for diagnostics only. Gating ignores it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDiagnostics {
    /// Profile results dropped because a newer session superseded them.
    pub stale_profile_results: u64,
    /// The initial probe lost to an earlier change-stream event.
    pub probe_superseded: bool,
    pub profile_failure: Option<ProfileFailure>,
}

/// Snapshot of who the current user is.
///
/// Published by the session synchronizer, its single writer. Every gated
/// view reads one of these.
///
/// # Invariants
/// - `session == None` implies `profile == None`.
/// - `loading == false` implies at least one full resolution cycle completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub session: Option<Session>,
    pub profile: Option<Profile>,
    pub loading: bool,
    pub phase: SessionPhase,
    pub diagnostics: SessionDiagnostics,
}

impl Default for AuthContext {
    fn default() -> Self {
        Self {
            session: None,
            profile: None,
            loading: true,
            phase: SessionPhase::Uninitialized,
            diagnostics: SessionDiagnostics::default(),
        }
    }
}

impl AuthContext {
    pub(crate) fn resolving() -> Self {
        Self {
            phase: SessionPhase::ResolvingSession,
            ..Self::default()
        }
    }

    /// Settled state used when the backend is not configured.
    pub(crate) fn unconfigured() -> Self {
        Self {
            loading: false,
            phase: SessionPhase::Unauthenticated,
            ..Self::default()
        }
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.session.as_ref().map(|s| &s.user)
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    /// Signed in, settled, but without a usable profile.
    pub fn is_unprovisioned(&self) -> bool {
        !self.loading && self.session.is_some() && self.profile.is_none()
    }

    pub fn is_admin(&self) -> bool {
        authorize::is_admin(self.profile.as_ref())
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        authorize::has_permission(self.profile.as_ref(), permission)
    }

    pub fn satisfies_role(&self, required: Role) -> bool {
        authorize::satisfies_role(self.profile.as_ref(), required)
    }
}
