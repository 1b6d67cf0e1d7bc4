//! `pipedesk-auth`: pure authorization domain for the CRM.
//!
//! Roles, permission keys, profiles, sessions and the checks over them.
//! This crate is decoupled from transport and storage.

pub mod authorize;
pub mod permissions;
pub mod profile;
pub mod roles;
pub mod session;

pub use authorize::{
    AuthorizationExplanation, DenialKind, DenialReason, ProfileState, Requirement, explain_access,
    has_permission, is_admin, role_level, satisfies_role,
};
pub use permissions::{PermissionKey, PermissionSet, PermissionVocabulary};
pub use profile::{Profile, ProfilePatch};
pub use roles::Role;
pub use session::{AccessToken, Session, SessionValidationError, UserIdentity};
