//! Error taxonomy for session operations.

use thiserror::Error;

/// Failure reported by the identity or profile backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend refused the request (bad credentials, duplicate account, ...).
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// The backend could not be reached or answered with a server error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with a body we could not decode.
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("profile not found")]
    NotFound,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result error of every operation exposed by the session handle.
///
/// Operations never panic; callers render these inline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Backend endpoint/credentials are missing. No request was made.
    #[error("identity backend is not configured")]
    NotConfigured,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("no profile exists for the signed-in user")]
    ProfileNotFound,

    #[error("not authenticated")]
    NotAuthenticated,

    /// The synchronizer is gone; no further state will be published.
    #[error("session synchronizer is closed")]
    Closed,
}

impl From<ProfileError> for AuthError {
    fn from(value: ProfileError) -> Self {
        match value {
            ProfileError::NotFound => AuthError::ProfileNotFound,
            ProfileError::Backend(e) => AuthError::Backend(e),
        }
    }
}
