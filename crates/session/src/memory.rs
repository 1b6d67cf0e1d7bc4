//! In-memory identity and profile backends for tests/dev.
//!
//! Both are scriptable: the session probe and individual profile fetches can
//! be held back and released later, and every backend call is counted so
//! tests can assert that nothing was contacted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use pipedesk_auth::{AccessToken, Profile, ProfilePatch, Session, UserIdentity};
use pipedesk_core::UserId;
use pipedesk_events::{EventBus, InMemoryEventBus, Subscription};

use crate::backend::{AuthChange, AuthChangeKind, IdentityBackend, ProfileStore, SignUpOutcome};
use crate::error::{BackendError, ProfileError};

#[derive(Debug, Clone)]
struct Account {
    identity: UserIdentity,
    password: String,
    metadata: Option<Value>,
}

/// Identity backend holding accounts and the current session in memory.
#[derive(Debug)]
pub struct InMemoryIdentityBackend {
    accounts: Mutex<HashMap<String, Account>>,
    current: Mutex<Option<Session>>,
    changes: InMemoryEventBus<AuthChange>,
    session_ttl: Duration,
    probe_gate: Mutex<Option<Arc<Notify>>>,
    refresh_rejected: AtomicBool,
    calls: AtomicUsize,
}

impl Default for InMemoryIdentityBackend {
    fn default() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            changes: InMemoryEventBus::new(),
            session_ttl: Duration::hours(1),
            probe_gate: Mutex::new(None),
            refresh_rejected: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

impl InMemoryIdentityBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an account directly, bypassing sign-up.
    pub fn register(&self, email: &str, password: &str) -> UserIdentity {
        let identity = UserIdentity {
            id: UserId::new(),
            email: email.to_string(),
        };
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(
                email.to_string(),
                Account {
                    identity: identity.clone(),
                    password: password.to_string(),
                    metadata: None,
                },
            );
        }
        identity
    }

    /// Metadata supplied when the account signed up.
    pub fn metadata(&self, email: &str) -> Option<Value> {
        self.accounts
            .lock()
            .ok()
            .and_then(|a| a.get(email).and_then(|acc| acc.metadata.clone()))
    }

    /// Mint a fresh session for `identity`.
    pub fn issue_session(&self, identity: &UserIdentity) -> Session {
        let now = Utc::now();
        Session {
            access_token: AccessToken::new(format!("mem-{}", Uuid::now_v7())),
            refresh_token: Some(AccessToken::new(format!("mem-refresh-{}", Uuid::now_v7()))),
            user: identity.clone(),
            issued_at: now,
            expires_at: now + self.session_ttl,
        }
    }

    /// Replace the stored session without announcing it (what a restored
    /// session looks like to the startup probe).
    pub fn set_current_session(&self, session: Option<Session>) {
        if let Ok(mut current) = self.current.lock() {
            *current = session;
        }
    }

    /// Push an arbitrary change on the stream and make it the stored session.
    pub fn emit(&self, kind: AuthChangeKind, session: Option<Session>) {
        self.set_current_session(session.clone());
        if let Err(e) = self.changes.publish(AuthChange::new(kind, session)) {
            tracing::error!(error = ?e, "failed to publish identity change");
        }
    }

    /// Hold the next session probe until [`Self::release_probe`].
    pub fn hold_probe(&self) {
        if let Ok(mut gate) = self.probe_gate.lock() {
            *gate = Some(Arc::new(Notify::new()));
        }
    }

    pub fn release_probe(&self) {
        if let Some(gate) = self.probe_gate.lock().ok().and_then(|mut g| g.take()) {
            gate.notify_one();
        }
    }

    /// Make every later refresh fail as if the refresh token were revoked.
    pub fn reject_refresh(&self) {
        self.refresh_rejected.store(true, Ordering::SeqCst);
    }

    /// Live listeners on the change stream.
    pub fn listener_count(&self) -> usize {
        self.changes.subscriber_count()
    }

    /// Number of backend calls made (probe, sign in/up/out, refresh).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn account(&self, email: &str) -> Option<Account> {
        self.accounts.lock().ok().and_then(|a| a.get(email).cloned())
    }
}

#[async_trait]
impl IdentityBackend for InMemoryIdentityBackend {
    async fn current_session(&self) -> Option<Session> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // The answer is fixed when the probe is issued, even if it is held.
        let session = self.current.lock().ok().and_then(|c| c.clone());
        let gate = self.probe_gate.lock().ok().and_then(|g| g.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        session
    }

    fn subscribe(&self) -> Subscription<AuthChange> {
        self.changes.subscribe()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let account = self
            .account(email)
            .filter(|a| a.password == password)
            .ok_or_else(|| BackendError::Rejected("invalid login credentials".to_string()))?;

        let session = self.issue_session(&account.identity);
        self.emit(AuthChangeKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<SignUpOutcome, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if password.len() < 6 {
            return Err(BackendError::Rejected(
                "password should be at least 6 characters".to_string(),
            ));
        }
        if self.account(email).is_some() {
            return Err(BackendError::Rejected("user already registered".to_string()));
        }

        let identity = self.register(email, password);
        if let Ok(mut accounts) = self.accounts.lock() {
            if let Some(account) = accounts.get_mut(email) {
                account.metadata = metadata;
            }
        }

        let session = self.issue_session(&identity);
        self.emit(AuthChangeKind::SignedIn, Some(session.clone()));
        Ok(SignUpOutcome {
            user: identity,
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.emit(AuthChangeKind::SignedOut, None);
        Ok(())
    }

    async fn refresh_session(&self) -> Result<Session, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self
            .current
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .filter(|s| s.refresh_token.is_some())
            .filter(|_| !self.refresh_rejected.load(Ordering::SeqCst));

        let Some(current) = current else {
            self.emit(AuthChangeKind::SignedOut, None);
            return Err(BackendError::Rejected("invalid refresh token".to_string()));
        };

        let session = self.issue_session(&current.user);
        self.emit(AuthChangeKind::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }
}

/// Profile store keyed by user id.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: Mutex<HashMap<UserId, Profile>>,
    held: Mutex<HashMap<UserId, Arc<Notify>>>,
    failing: Mutex<HashSet<UserId>>,
    calls: AtomicUsize,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: Profile) {
        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.insert(profile.id, profile);
        }
    }

    /// Hold fetches for `user_id` until [`Self::release`].
    pub fn hold(&self, user_id: UserId) {
        if let Ok(mut held) = self.held.lock() {
            held.insert(user_id, Arc::new(Notify::new()));
        }
    }

    pub fn release(&self, user_id: UserId) {
        if let Some(gate) = self.held.lock().ok().and_then(|mut h| h.remove(&user_id)) {
            gate.notify_one();
        }
    }

    /// Make every fetch/update for `user_id` fail with a transport error.
    pub fn fail_for(&self, user_id: UserId) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(user_id);
        }
    }

    /// Number of fetch/update calls made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_failing(&self, user_id: UserId) -> Result<(), ProfileError> {
        let failing = self.failing.lock().map(|f| f.contains(&user_id)).unwrap_or(false);
        if failing {
            Err(BackendError::Transport("profile store unavailable".to_string()).into())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn fetch_profile(&self, user_id: UserId) -> Result<Profile, ProfileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.held.lock().ok().and_then(|h| h.get(&user_id).cloned());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.check_failing(user_id)?;

        self.profiles
            .lock()
            .map_err(|_| BackendError::Transport("profile store poisoned".to_string()))?
            .get(&user_id)
            .cloned()
            .ok_or(ProfileError::NotFound)
    }

    async fn update_profile(
        &self,
        user_id: UserId,
        patch: &ProfilePatch,
    ) -> Result<Profile, ProfileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing(user_id)?;

        let mut profiles = self
            .profiles
            .lock()
            .map_err(|_| BackendError::Transport("profile store poisoned".to_string()))?;
        let profile = profiles.get_mut(&user_id).ok_or(ProfileError::NotFound)?;
        patch.apply(profile, Utc::now());
        Ok(profile.clone())
    }
}
