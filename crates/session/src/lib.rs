//! `pipedesk-session`: who the current user is, and what they may see.
//!
//! The [`SessionSynchronizer`] keeps an [`AuthContext`] in step with the
//! identity backend; the [`AccessGate`] turns that context into a render
//! decision for each protected view.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod memory;
pub mod rest;
pub mod synchronizer;

pub use backend::{AuthChange, AuthChangeKind, IdentityBackend, ProfileStore, SignUpOutcome};
pub use config::{BackendSettings, SynchronizerConfig};
pub use context::{AuthContext, ProfileFailure, SessionDiagnostics, SessionPhase};
pub use error::{AuthError, BackendError, ProfileError};
pub use gate::{AccessGate, GateDecision, Rendered};
pub use memory::{InMemoryIdentityBackend, InMemoryProfileStore};
pub use rest::RestBackend;
pub use synchronizer::{SessionHandle, SessionSynchronizer};
