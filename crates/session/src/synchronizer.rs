//! Session synchronizer: the single writer of [`AuthContext`].
//!
//! Two asynchronous sources feed it: a one-shot probe of the identity
//! backend's current session and the backend's change stream. Both are
//! funnelled into one actor task, so every state transition is applied on a
//! single timeline and published through a `watch` channel.
//!
//! Each session transition bumps a generation counter. Profile fetches carry
//! the generation they were issued for; results for a superseded generation
//! are dropped instead of being merged into the newer session's state.
//! Profile updates are keyed by user instead, so a token refresh in between
//! does not lose them.
//!
//! While a session is held the actor also keeps a deadline: the session is
//! refreshed `refresh_ahead` before it expires, and cleared once it has.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use pipedesk_auth::{PermissionVocabulary, Profile, ProfilePatch, Session, authorize};
use pipedesk_core::UserId;
use pipedesk_events::Subscription;

use crate::backend::{AuthChange, IdentityBackend, ProfileStore, SignUpOutcome};
use crate::config::SynchronizerConfig;
use crate::context::{AuthContext, ProfileFailure, SessionPhase};
use crate::error::{AuthError, ProfileError};

#[derive(Debug)]
enum Message {
    Probe(Option<Session>),
    ProfileLoaded {
        generation: u64,
        user_id: UserId,
        result: Result<Profile, ProfileError>,
    },
    ProfileUpdated(Profile),
}

#[derive(Clone)]
struct Backends {
    identity: Arc<dyn IdentityBackend>,
    profiles: Arc<dyn ProfileStore>,
}

struct Runtime {
    inbox: mpsc::Sender<Message>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Actor state. Lives inside the spawned task only.
pub struct SessionSynchronizer {
    backends: Backends,
    vocabulary: Option<PermissionVocabulary>,
    refresh_ahead: Duration,
    state: watch::Sender<AuthContext>,
    inbox: mpsc::Sender<Message>,
    generation: u64,
    stream_applied: bool,
    refresh_requested: bool,
}

impl SessionSynchronizer {
    /// Start synchronizing and return the handle views consume.
    ///
    /// Must be called from within a Tokio runtime. With an unconfigured
    /// backend nothing is spawned, no backend is contacted, and the handle
    /// is immediately settled with no session.
    pub fn start(
        config: SynchronizerConfig,
        identity: Arc<dyn IdentityBackend>,
        profiles: Arc<dyn ProfileStore>,
    ) -> SessionHandle {
        if !config.settings.is_configured() {
            warn!("identity backend is not configured; starting signed out");
            let (state, watch) = watch::channel(AuthContext::unconfigured());
            return SessionHandle {
                state: watch,
                _idle: Some(state),
                backends: None,
                runtime: None,
            };
        }

        let backends = Backends { identity, profiles };

        // Register the listener before the probe is dispatched so no change
        // emitted in between can be missed.
        let changes = backends.identity.subscribe();

        let (state, watch) = watch::channel(AuthContext::resolving());
        let (inbox, inbox_rx) = mpsc::channel(config.command_capacity.max(1));
        let shutdown = Arc::new(Notify::new());

        let synchronizer = Self::new(&config, backends.clone(), state, inbox.clone());
        let task = tokio::spawn(synchronizer.run(changes, inbox_rx, shutdown.clone()));

        SessionHandle {
            state: watch,
            _idle: None,
            backends: Some(backends),
            runtime: Some(Runtime {
                inbox,
                shutdown,
                task,
            }),
        }
    }

    fn new(
        config: &SynchronizerConfig,
        backends: Backends,
        state: watch::Sender<AuthContext>,
        inbox: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            backends,
            vocabulary: config.vocabulary.clone(),
            refresh_ahead: config.refresh_ahead,
            state,
            inbox,
            generation: 0,
            stream_applied: false,
            refresh_requested: false,
        }
    }

    async fn run(
        mut self,
        mut changes: Subscription<AuthChange>,
        mut inbox: mpsc::Receiver<Message>,
        shutdown: Arc<Notify>,
    ) {
        debug!("session synchronizer started");
        self.dispatch_probe();

        let mut stream_open = true;
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                change = changes.recv(), if stream_open => match change {
                    Some(change) => self.on_change(change),
                    None => {
                        warn!("identity change stream closed");
                        stream_open = false;
                    }
                },
                Some(message) = inbox.recv() => self.on_message(message),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => self.on_deadline(),
            }
        }

        changes.unsubscribe();
        debug!("session synchronizer stopped");
    }

    fn dispatch_probe(&self) {
        let identity = self.backends.identity.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let session = identity.current_session().await;
            let _ = inbox.send(Message::Probe(session)).await;
        });
    }

    fn dispatch_refresh(&self) {
        let identity = self.backends.identity.clone();
        tokio::spawn(async move {
            // The outcome arrives on the change stream.
            if let Err(e) = identity.refresh_session().await {
                warn!(error = %e, "session refresh failed");
            }
        });
    }

    /// When the held session next needs attention: its refresh point, or its
    /// expiry once a refresh has been requested.
    fn next_deadline(&self) -> Option<Instant> {
        let expires_at = self.state.borrow().session.as_ref()?.expires_at;
        let due = if self.refresh_requested {
            expires_at
        } else {
            let ahead = TimeDelta::from_std(self.refresh_ahead).unwrap_or(TimeDelta::zero());
            expires_at.checked_sub_signed(ahead).unwrap_or(expires_at)
        };
        let remaining = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Some(Instant::now() + remaining)
    }

    fn on_deadline(&mut self) {
        let held = self
            .state
            .borrow()
            .session
            .as_ref()
            .map(|s| (s.user_id(), s.expires_at));
        let Some((user_id, expires_at)) = held else {
            return;
        };

        if expires_at <= Utc::now() {
            info!(%user_id, "session expired");
            self.apply_session(None);
        } else if !self.refresh_requested && !self.refresh_ahead.is_zero() {
            debug!(%user_id, "refreshing session ahead of expiry");
            self.refresh_requested = true;
            self.dispatch_refresh();
        }
    }

    fn on_change(&mut self, change: AuthChange) {
        debug!(event = ?change.kind, "identity change");
        self.stream_applied = true;
        self.apply_session(change.session);
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Probe(session) => {
                if self.stream_applied {
                    debug!("initial session probe superseded by change stream; discarding");
                    self.state.send_modify(|ctx| ctx.diagnostics.probe_superseded = true);
                    return;
                }
                self.apply_session(session);
            }
            Message::ProfileLoaded {
                generation,
                user_id,
                result,
            } => self.on_profile_loaded(generation, user_id, result),
            Message::ProfileUpdated(profile) => self.on_profile_updated(profile),
        }
    }

    fn apply_session(&mut self, session: Option<Session>) {
        let session = session.filter(|s| match s.validate(Utc::now()) {
            Ok(()) => true,
            Err(e) => {
                warn!(user_id = %s.user_id(), error = %e, "ignoring invalid session");
                false
            }
        });

        self.generation += 1;
        self.refresh_requested = false;
        let generation = self.generation;

        let Some(session) = session else {
            self.state.send_modify(|ctx| {
                ctx.session = None;
                ctx.profile = None;
                ctx.loading = false;
                ctx.phase = SessionPhase::Unauthenticated;
                ctx.diagnostics.profile_failure = None;
            });
            return;
        };

        let user_id = session.user_id();
        self.state.send_modify(|ctx| {
            // Same user with a loaded profile (token refresh, user update):
            // keep serving the current profile while it is re-fetched.
            let same_user = ctx.session.as_ref().is_some_and(|s| s.user_id() == user_id)
                && ctx.profile.is_some();
            ctx.session = Some(session);
            if !same_user {
                ctx.profile = None;
                ctx.loading = true;
                ctx.phase = SessionPhase::ResolvingProfile;
            }
        });
        self.fetch_profile(generation, user_id);
    }

    fn fetch_profile(&self, generation: u64, user_id: UserId) {
        let profiles = self.backends.profiles.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = profiles.fetch_profile(user_id).await;
            let _ = inbox
                .send(Message::ProfileLoaded {
                    generation,
                    user_id,
                    result,
                })
                .await;
        });
    }

    fn on_profile_loaded(
        &mut self,
        generation: u64,
        user_id: UserId,
        result: Result<Profile, ProfileError>,
    ) {
        if generation != self.generation {
            debug!(
                %user_id,
                generation,
                current = self.generation,
                "discarding stale profile result"
            );
            self.state.send_modify(|ctx| ctx.diagnostics.stale_profile_results += 1);
            return;
        }

        let failure = match result {
            Ok(profile) if profile.id == user_id => {
                let profile = self.filter_permissions(profile);
                info!(%user_id, role = %profile.role, "profile loaded");
                self.state.send_modify(|ctx| {
                    ctx.profile = Some(profile);
                    ctx.loading = false;
                    ctx.phase = SessionPhase::Ready;
                    ctx.diagnostics.profile_failure = None;
                });
                return;
            }
            Ok(profile) => {
                error!(
                    %user_id,
                    got = %profile.id,
                    "profile store returned another user's profile"
                );
                ProfileFailure::Backend("profile id mismatch".to_string())
            }
            Err(ProfileError::NotFound) => {
                warn!(%user_id, "no profile for authenticated user");
                ProfileFailure::NotFound
            }
            Err(ProfileError::Backend(e)) => {
                error!(%user_id, error = %e, "error fetching profile");
                ProfileFailure::Backend(e.to_string())
            }
        };

        self.state.send_modify(|ctx| {
            // A failed background refresh keeps the profile already shown.
            if ctx.loading {
                ctx.profile = None;
            }
            ctx.loading = false;
            ctx.phase = SessionPhase::Ready;
            ctx.diagnostics.profile_failure = Some(failure);
        });
    }

    fn on_profile_updated(&mut self, profile: Profile) {
        let current_user = self.state.borrow().session.as_ref().map(|s| s.user_id());
        if current_user != Some(profile.id) {
            debug!(user_id = %profile.id, "discarding profile update for another user");
            self.state.send_modify(|ctx| ctx.diagnostics.stale_profile_results += 1);
            return;
        }

        let profile = self.filter_permissions(profile);
        self.state.send_modify(|ctx| {
            ctx.profile = Some(profile);
            ctx.loading = false;
            ctx.phase = SessionPhase::Ready;
            ctx.diagnostics.profile_failure = None;
        });
    }

    fn filter_permissions(&self, mut profile: Profile) -> Profile {
        if let Some(vocabulary) = &self.vocabulary {
            profile.permissions.retain_known(vocabulary);
        }
        profile
    }
}

/// Consumer-facing handle: the current [`AuthContext`] plus the session
/// operations.
///
/// Dropping the handle stops the synchronizer; [`SessionHandle::teardown`]
/// does the same and waits for the listener to be released.
pub struct SessionHandle {
    state: watch::Receiver<AuthContext>,
    /// Keeps the channel open when no actor owns the sender.
    _idle: Option<watch::Sender<AuthContext>>,
    backends: Option<Backends>,
    runtime: Option<Runtime>,
}

impl SessionHandle {
    pub fn is_configured(&self) -> bool {
        self.backends.is_some()
    }

    /// Current snapshot.
    pub fn context(&self) -> AuthContext {
        self.state.borrow().clone()
    }

    /// A receiver notified on every published change.
    pub fn watch(&self) -> watch::Receiver<AuthContext> {
        self.state.clone()
    }

    /// Wait until the published context satisfies `predicate`.
    pub async fn wait_until<F>(&self, predicate: F) -> Result<AuthContext, AuthError>
    where
        F: FnMut(&AuthContext) -> bool,
    {
        let mut rx = self.state.clone();
        let ctx = rx.wait_for(predicate).await.map_err(|_| AuthError::Closed)?;
        Ok(ctx.clone())
    }

    /// Wait until no resolution is in flight.
    pub async fn settled(&self) -> Result<AuthContext, AuthError> {
        self.wait_until(|ctx| !ctx.loading).await
    }

    pub fn is_admin(&self) -> bool {
        authorize::is_admin(self.state.borrow().profile.as_ref())
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        authorize::has_permission(self.state.borrow().profile.as_ref(), permission)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let backends = self.backends("sign in")?;
        backends
            .identity
            .sign_in_with_password(email, password)
            .await
            .map_err(|e| {
                error!(error = %e, "error signing in");
                AuthError::from(e)
            })
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<SignUpOutcome, AuthError> {
        let backends = self.backends("sign up")?;
        backends
            .identity
            .sign_up(email, password, metadata)
            .await
            .map_err(|e| {
                error!(error = %e, "error signing up");
                AuthError::from(e)
            })
    }

    /// Sign out. Signing out while already signed out is a no-op success.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let backends = self.backends("sign out")?;
        backends.identity.sign_out().await.map_err(|e| {
            error!(error = %e, "error signing out");
            AuthError::from(e)
        })
    }

    /// Patch the signed-in user's profile.
    ///
    /// The returned profile is also published, unless another user signed in
    /// while the update was in flight.
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<Profile, AuthError> {
        let backends = self.backends("update profile")?;
        let user_id = self
            .state
            .borrow()
            .session
            .as_ref()
            .map(Session::user_id)
            .ok_or(AuthError::NotAuthenticated)?;

        let profile = backends
            .profiles
            .update_profile(user_id, &patch)
            .await
            .map_err(|e| {
                error!(%user_id, error = %e, "error updating profile");
                AuthError::from(e)
            })?;

        if let Some(runtime) = &self.runtime {
            let _ = runtime
                .inbox
                .send(Message::ProfileUpdated(profile.clone()))
                .await;
        }
        Ok(profile)
    }

    /// Stop the synchronizer and wait until its change listener is released.
    pub async fn teardown(mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        runtime.shutdown.notify_one();
        if let Err(e) = runtime.task.await {
            error!(error = %e, "session synchronizer task failed");
        }
    }

    fn backends(&self, operation: &str) -> Result<&Backends, AuthError> {
        self.backends.as_ref().ok_or_else(|| {
            error!(operation, "identity backend is not configured");
            AuthError::NotConfigured
        })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(runtime) = &self.runtime {
            runtime.shutdown.notify_one();
        }
    }
}

impl core::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("configured", &self.is_configured())
            .field("running", &self.runtime.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AuthChangeKind;
    use crate::config::BackendSettings;
    use crate::memory::{InMemoryIdentityBackend, InMemoryProfileStore};
    use pipedesk_auth::{AccessToken, Role, UserIdentity};
    use pipedesk_core::TenantId;

    fn actor(config: SynchronizerConfig) -> (SessionSynchronizer, mpsc::Receiver<Message>) {
        let backends = Backends {
            identity: Arc::new(InMemoryIdentityBackend::new()),
            profiles: Arc::new(InMemoryProfileStore::new()),
        };
        let (state, _) = watch::channel(AuthContext::resolving());
        let (inbox, inbox_rx) = mpsc::channel(8);
        (SessionSynchronizer::new(&config, backends, state, inbox), inbox_rx)
    }

    fn config() -> SynchronizerConfig {
        SynchronizerConfig::new(BackendSettings::new("memory://crm", "k"))
    }

    fn user(email: &str) -> UserIdentity {
        UserIdentity {
            id: UserId::new(),
            email: email.to_string(),
        }
    }

    fn session(user: &UserIdentity, token: &str, ttl: TimeDelta) -> Session {
        let now = Utc::now();
        Session {
            access_token: AccessToken::new(token),
            refresh_token: Some(AccessToken::new("r")),
            user: user.clone(),
            issued_at: now - TimeDelta::seconds(1),
            expires_at: now + ttl,
        }
    }

    fn profile(user: &UserIdentity) -> Profile {
        Profile::new(user.id, TenantId::new(), user.email.clone(), Role::Sales)
    }

    fn signed_in(a: &mut SessionSynchronizer, who: &UserIdentity, token: &str) {
        a.on_change(AuthChange::new(
            AuthChangeKind::SignedIn,
            Some(session(who, token, TimeDelta::hours(1))),
        ));
    }

    #[tokio::test]
    async fn profile_update_survives_token_refresh_for_same_user() {
        let (mut a, _inbox) = actor(config());
        let who = user("a@example.com");
        signed_in(&mut a, &who, "t1");
        a.on_profile_loaded(a.generation, who.id, Ok(profile(&who)));

        a.on_change(AuthChange::new(
            AuthChangeKind::TokenRefreshed,
            Some(session(&who, "t2", TimeDelta::hours(1))),
        ));

        let mut updated = profile(&who);
        updated.first_name = Some("Rae".into());
        a.on_profile_updated(updated.clone());

        let ctx = a.state.borrow().clone();
        assert_eq!(ctx.profile, Some(updated));
        assert_eq!(ctx.diagnostics.stale_profile_results, 0);
    }

    #[tokio::test]
    async fn profile_update_for_previous_user_is_dropped() {
        let (mut a, _inbox) = actor(config());
        let first = user("a@example.com");
        let second = user("b@example.com");
        signed_in(&mut a, &first, "t1");
        a.on_profile_loaded(a.generation, first.id, Ok(profile(&first)));
        signed_in(&mut a, &second, "t2");

        a.on_profile_updated(profile(&first));

        let ctx = a.state.borrow().clone();
        assert!(ctx.profile.is_none());
        assert!(ctx.loading);
        assert_eq!(ctx.diagnostics.stale_profile_results, 1);
    }

    #[tokio::test]
    async fn deadline_tracks_refresh_point_then_expiry() {
        let (mut a, _inbox) = actor(config().with_refresh_ahead(Duration::from_secs(30)));
        assert_eq!(a.next_deadline(), None);

        let who = user("a@example.com");
        a.on_change(AuthChange::new(
            AuthChangeKind::SignedIn,
            Some(session(&who, "t1", TimeDelta::seconds(10))),
        ));
        // Inside the refresh window already: due now.
        let Some(due) = a.next_deadline() else {
            panic!("expected a deadline");
        };
        assert!(due <= Instant::now());

        a.on_deadline();
        assert!(a.refresh_requested);
        let Some(expiry) = a.next_deadline() else {
            panic!("expected a deadline");
        };
        assert!(expiry > Instant::now() + Duration::from_secs(5));
    }

    #[tokio::test]
    async fn passed_deadline_clears_session_and_profile() {
        let (mut a, _inbox) = actor(config().with_refresh_ahead(Duration::ZERO));
        let who = user("a@example.com");
        signed_in(&mut a, &who, "t1");
        a.on_profile_loaded(a.generation, who.id, Ok(profile(&who)));

        a.state.send_modify(|ctx| {
            if let Some(s) = ctx.session.as_mut() {
                s.expires_at = Utc::now() - TimeDelta::seconds(1);
            }
        });
        a.on_deadline();

        let ctx = a.state.borrow().clone();
        assert!(ctx.session.is_none() && ctx.profile.is_none());
        assert!(!ctx.loading);
        assert_eq!(ctx.phase, SessionPhase::Unauthenticated);
        assert_eq!(a.next_deadline(), None);
    }
}
