//! REST client for the hosted identity/data API.
//!
//! Auth endpoints live under `/auth/v1`, table rows under `/rest/v1`. Every
//! request carries the configured API key; row requests additionally carry
//! the signed-in user's access token so tenant row-level policies apply.
//!
//! The hosted API has no push channel of its own, so this client announces
//! its own sign-in, sign-up, refresh and sign-out results on an in-memory
//! change stream.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use pipedesk_auth::{AccessToken, Profile, ProfilePatch, Session, UserIdentity};
use pipedesk_core::UserId;
use pipedesk_events::{EventBus, InMemoryEventBus, Subscription};

use crate::backend::{AuthChange, AuthChangeKind, IdentityBackend, ProfileStore, SignUpOutcome};
use crate::config::BackendSettings;
use crate::error::{BackendError, ProfileError};

const PROFILES_TABLE: &str = "profiles";

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: UserId,
    #[serde(default)]
    email: Option<String>,
}

impl From<UserPayload> for UserIdentity {
    fn from(value: UserPayload) -> Self {
        UserIdentity {
            id: value.id,
            email: value.email.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    user: UserPayload,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        Session {
            access_token: AccessToken::new(self.access_token),
            refresh_token: self.refresh_token.map(AccessToken::new),
            user: self.user.into(),
            issued_at: now,
            expires_at: now + Duration::seconds(self.expires_in),
        }
    }
}

/// Identity backend and profile store over HTTP.
///
/// One instance serves both roles so the profile requests can reuse the
/// session it holds.
#[derive(Debug)]
pub struct RestBackend {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    session: Mutex<Option<Session>>,
    changes: InMemoryEventBus<AuthChange>,
}

impl RestBackend {
    /// Build the client. Unconfigured settings produce a client that is
    /// never called: the synchronizer refuses to start against it.
    pub fn new(settings: &BackendSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: settings.endpoint().unwrap_or_default().to_string(),
            api_key: settings.api_key().unwrap_or_default().to_string(),
            session: Mutex::new(None),
            changes: InMemoryEventBus::new(),
        }
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.endpoint, path)
    }

    fn profile_url(&self, user_id: UserId) -> String {
        format!("{}/rest/v1/{}?id=eq.{}", self.endpoint, PROFILES_TABLE, user_id)
    }

    fn stored_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn store_and_announce(&self, kind: AuthChangeKind, session: Option<Session>) {
        if let Ok(mut stored) = self.session.lock() {
            *stored = session.clone();
        }
        if let Err(e) = self.changes.publish(AuthChange::new(kind, session)) {
            error!(error = ?e, "failed to publish identity change");
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let bearer = self
            .stored_session()
            .map(|s| s.access_token.expose().to_string())
            .unwrap_or_else(|| self.api_key.clone());
        self.request_as(method, url, &bearer)
    }

    fn request_as(&self, method: Method, url: String, bearer: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn exchange_refresh_token(&self) -> Result<Session, BackendError> {
        let refresh_token = self
            .stored_session()
            .and_then(|s| s.refresh_token)
            .ok_or_else(|| BackendError::Rejected("no refresh token held".to_string()))?;

        // The held access token may already be expired, so this goes out
        // under the API key.
        let request = self
            .request_as(
                Method::POST,
                self.auth_url("token?grant_type=refresh_token"),
                &self.api_key,
            )
            .json(&json!({ "refresh_token": refresh_token.expose() }));

        let token: TokenResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(token.into_session(Utc::now()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }

    async fn fetch_rows(&self, request: RequestBuilder) -> Result<Vec<Profile>, BackendError> {
        self.send(request)
            .await?
            .json::<Vec<Profile>>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// Map an error response to a [`BackendError`], preferring the API's own message.
fn classify_failure(status: StatusCode, body: &str) -> BackendError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["error_description", "msg", "message", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| status.to_string());

    if status.is_client_error() {
        BackendError::Rejected(message)
    } else {
        BackendError::Transport(format!("{status}: {message}"))
    }
}

/// Sign-up answers with a full session, or with only the user when the
/// account still needs email confirmation.
fn parse_sign_up(body: Value, now: DateTime<Utc>) -> Result<SignUpOutcome, BackendError> {
    if body.get("access_token").is_some() {
        let token: TokenResponse =
            serde_json::from_value(body).map_err(|e| BackendError::Decode(e.to_string()))?;
        let session = token.into_session(now);
        return Ok(SignUpOutcome {
            user: session.user.clone(),
            session: Some(session),
        });
    }

    let user = body.get("user").cloned().unwrap_or(body);
    let user: UserPayload =
        serde_json::from_value(user).map_err(|e| BackendError::Decode(e.to_string()))?;
    Ok(SignUpOutcome {
        user: user.into(),
        session: None,
    })
}

#[async_trait]
impl IdentityBackend for RestBackend {
    async fn current_session(&self) -> Option<Session> {
        self.stored_session()
    }

    fn subscribe(&self) -> Subscription<AuthChange> {
        self.changes.subscribe()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let request = self
            .request(Method::POST, self.auth_url("token?grant_type=password"))
            .json(&json!({ "email": email, "password": password }));

        let token: TokenResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let session = token.into_session(Utc::now());
        info!(user_id = %session.user_id(), "signed in");
        self.store_and_announce(AuthChangeKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Option<Value>,
    ) -> Result<SignUpOutcome, BackendError> {
        let request = self.request(Method::POST, self.auth_url("signup")).json(&json!({
            "email": email,
            "password": password,
            "data": metadata.unwrap_or_else(|| json!({})),
        }));

        let body: Value = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let outcome = parse_sign_up(body, Utc::now())?;
        if let Some(session) = &outcome.session {
            self.store_and_announce(AuthChangeKind::SignedIn, Some(session.clone()));
        }
        Ok(outcome)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let result = match self.stored_session() {
            Some(_) => self
                .send(self.request(Method::POST, self.auth_url("logout")))
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        // The local session is dropped even if the server call failed.
        self.store_and_announce(AuthChangeKind::SignedOut, None);
        result
    }

    async fn refresh_session(&self) -> Result<Session, BackendError> {
        match self.exchange_refresh_token().await {
            Ok(session) => {
                debug!(user_id = %session.user_id(), "session refreshed");
                self.store_and_announce(AuthChangeKind::TokenRefreshed, Some(session.clone()));
                Ok(session)
            }
            Err(e @ BackendError::Rejected(_)) => {
                warn!(error = %e, "refresh token rejected; signing out");
                self.store_and_announce(AuthChangeKind::SignedOut, None);
                Err(e)
            }
            // Transport trouble keeps the session until it expires.
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ProfileStore for RestBackend {
    async fn fetch_profile(&self, user_id: UserId) -> Result<Profile, ProfileError> {
        let request = self.request(Method::GET, format!("{}&select=*", self.profile_url(user_id)));
        self.fetch_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or(ProfileError::NotFound)
    }

    async fn update_profile(
        &self,
        user_id: UserId,
        patch: &ProfilePatch,
    ) -> Result<Profile, ProfileError> {
        let request = self
            .request(Method::PATCH, self.profile_url(user_id))
            .header("Prefer", "return=representation")
            .json(patch);
        self.fetch_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or(ProfileError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RestBackend {
        RestBackend::new(&BackendSettings::new("https://crm.example.com/", "anon-key"))
    }

    #[test]
    fn urls_are_rooted_at_the_endpoint() {
        let b = backend();
        let id = UserId::new();
        assert_eq!(b.auth_url("logout"), "https://crm.example.com/auth/v1/logout");
        assert_eq!(
            b.profile_url(id),
            format!("https://crm.example.com/rest/v1/profiles?id=eq.{id}")
        );
    }

    #[test]
    fn token_response_becomes_a_session() {
        let id = UserId::new();
        let body = json!({
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 3600,
            "token_type": "bearer",
            "user": { "id": id.to_string(), "email": "r@example.com" }
        });
        let now = Utc::now();
        let outcome = parse_sign_up(body, now).unwrap();
        let session = outcome.session.unwrap();

        assert_eq!(session.user_id(), id);
        assert_eq!(session.access_token.expose(), "at");
        assert_eq!(session.expires_at, now + Duration::hours(1));
        assert_eq!(session.validate(now), Ok(()));
    }

    #[test]
    fn sign_up_pending_confirmation_has_no_session() {
        let id = UserId::new();
        let body = json!({ "id": id.to_string(), "email": "p@example.com" });
        let outcome = parse_sign_up(body, Utc::now()).unwrap();
        assert!(outcome.session.is_none());
        assert_eq!(outcome.user.id, id);
    }

    #[test]
    fn failures_prefer_api_message() {
        let err = classify_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        );
        assert_eq!(err, BackendError::Rejected("Invalid login credentials".to_string()));

        let err = classify_failure(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(err, BackendError::Transport(msg) if msg.starts_with("502")));
    }

    #[tokio::test]
    async fn refresh_without_session_signs_out_locally() {
        let b = backend();
        let mut changes = b.subscribe();
        let err = b.refresh_session().await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert_eq!(changes.recv().await, Some(AuthChange::signed_out()));
        assert_eq!(b.current_session().await, None);
    }

    #[tokio::test]
    async fn sign_out_without_session_is_local_only() {
        let b = backend();
        let mut changes = b.subscribe();
        assert_eq!(b.sign_out().await, Ok(()));
        assert_eq!(changes.recv().await, Some(AuthChange::signed_out()));
    }
}
