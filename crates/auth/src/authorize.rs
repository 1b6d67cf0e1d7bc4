//! Authorization engine: role hierarchy and permission checks.
//!
//! - No IO
//! - No panics
//! - Every predicate accepts a missing profile and answers `false`

use serde::Serialize;

use crate::permissions::PermissionKey;
use crate::profile::Profile;
use crate::roles::Role;

/// Hierarchy level of `role`.
pub fn role_level(role: Role) -> u8 {
    role.level()
}

/// `true` iff a profile exists and its role is at least `required`.
pub fn satisfies_role(profile: Option<&Profile>, required: Role) -> bool {
    profile.is_some_and(|p| role_level(p.role) >= role_level(required))
}

/// `true` iff the profile is an admin, or explicitly holds `permission`.
///
/// Admins bypass the permission set entirely.
pub fn has_permission(profile: Option<&Profile>, permission: &str) -> bool {
    match profile {
        Some(p) if p.role == Role::Admin => true,
        Some(p) => p.permissions.contains(permission),
        None => false,
    }
}

pub fn is_admin(profile: Option<&Profile>) -> bool {
    profile.is_some_and(|p| p.role == Role::Admin)
}

/// Something a protected region may demand of the current profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Requirement {
    MinimumRole(Role),
    Permission(PermissionKey),
}

impl Requirement {
    pub fn is_satisfied_by(&self, profile: Option<&Profile>) -> bool {
        match self {
            Requirement::MinimumRole(role) => satisfies_role(profile, *role),
            Requirement::Permission(key) => has_permission(profile, key.as_str()),
        }
    }
}

impl core::fmt::Display for Requirement {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Requirement::MinimumRole(role) => write!(f, "role >= {role}"),
            Requirement::Permission(key) => write!(f, "permission {key}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization Explanation
// ─────────────────────────────────────────────────────────────────────────────

/// Why a requirement was (or would be) granted or denied.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationExplanation {
    pub requirement: Requirement,
    pub granted: bool,
    pub reason: String,
    /// Snapshot of the evaluated profile, absent when there was none.
    pub profile: Option<ProfileState>,
    pub denial: Option<DenialReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileState {
    pub role: Role,
    pub role_level: u8,
    pub permissions: Vec<String>,
    pub admin_bypass: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DenialReason {
    pub kind: DenialKind,
    pub message: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    NoProfile,
    InsufficientRole,
    MissingPermission,
}

/// Explain the outcome of checking `requirement` against `profile`.
///
/// Always agrees with [`Requirement::is_satisfied_by`].
pub fn explain_access(
    profile: Option<&Profile>,
    requirement: &Requirement,
) -> AuthorizationExplanation {
    let Some(p) = profile else {
        return AuthorizationExplanation {
            requirement: requirement.clone(),
            granted: false,
            reason: "No profile is loaded for the current session".to_string(),
            profile: None,
            denial: Some(DenialReason {
                kind: DenialKind::NoProfile,
                message: "Authorization requires a provisioned profile".to_string(),
                suggestions: vec![
                    "Sign in".to_string(),
                    "Ask an administrator to provision a profile for this account".to_string(),
                ],
            }),
        };
    };

    let state = ProfileState {
        role: p.role,
        role_level: role_level(p.role),
        permissions: p.permissions.iter().map(|k| k.as_str().to_string()).collect(),
        admin_bypass: p.role == Role::Admin,
    };
    let granted = requirement.is_satisfied_by(profile);

    let (reason, denial) = match requirement {
        Requirement::MinimumRole(required) if granted => (
            format!(
                "Role '{}' (level {}) meets required role '{}' (level {})",
                p.role,
                role_level(p.role),
                required,
                role_level(*required)
            ),
            None,
        ),
        Requirement::MinimumRole(required) => (
            format!(
                "Role '{}' (level {}) is below required role '{}' (level {})",
                p.role,
                role_level(p.role),
                required,
                role_level(*required)
            ),
            Some(DenialReason {
                kind: DenialKind::InsufficientRole,
                message: format!("Requires role '{required}' or higher"),
                suggestions: vec![format!(
                    "Assign one of: {}",
                    Role::ALL
                        .iter()
                        .filter(|r| r.level() >= required.level())
                        .map(|r| r.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )],
            }),
        ),
        Requirement::Permission(_) if p.role == Role::Admin => {
            ("Admin role grants every permission".to_string(), None)
        }
        Requirement::Permission(key) if granted => {
            (format!("Profile holds permission '{key}'"), None)
        }
        Requirement::Permission(key) => (
            format!(
                "Profile does not hold permission '{}'. Current permissions: {:?}",
                key, state.permissions
            ),
            Some(DenialReason {
                kind: DenialKind::MissingPermission,
                message: format!("Missing required permission: '{key}'"),
                suggestions: vec![
                    format!("Grant the '{key}' permission on the profile"),
                    "Assign the admin role".to_string(),
                ],
            }),
        ),
    };

    AuthorizationExplanation {
        requirement: requirement.clone(),
        granted,
        reason,
        profile: Some(state),
        denial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionSet;
    use pipedesk_core::{TenantId, UserId};
    use proptest::prelude::*;

    fn profile(role: Role, perms: &[&'static str]) -> Profile {
        Profile::new(UserId::new(), TenantId::new(), "p@example.com", role).with_permissions(
            PermissionSet::new(perms.iter().copied().map(PermissionKey::from_static)),
        )
    }

    fn any_role() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    #[test]
    fn sales_does_not_satisfy_manager() {
        let p = profile(Role::Sales, &[]);
        assert!(!satisfies_role(Some(&p), Role::Manager));
        assert!(satisfies_role(Some(&p), Role::Support));
        assert!(satisfies_role(Some(&p), Role::Sales));
    }

    #[test]
    fn explicit_permission_membership() {
        let p = profile(Role::User, &["leads.view"]);
        assert!(has_permission(Some(&p), "leads.view"));
        assert!(!has_permission(Some(&p), "leads.delete"));
    }

    #[test]
    fn missing_profile_is_never_authorized() {
        for role in Role::ALL {
            assert!(!satisfies_role(None, role));
        }
        assert!(!has_permission(None, "leads.view"));
        assert!(!has_permission(None, ""));
        assert!(!is_admin(None));
    }

    #[test]
    fn explanation_for_missing_permission() {
        let p = profile(Role::Finance, &["invoices.view"]);
        let req = Requirement::Permission(PermissionKey::from_static("invoices.delete"));
        let e = explain_access(Some(&p), &req);

        assert!(!e.granted);
        let denial = e.denial.unwrap();
        assert_eq!(denial.kind, DenialKind::MissingPermission);
        assert!(e.reason.contains("invoices.delete"));
    }

    #[test]
    fn explanation_for_insufficient_role_lists_qualifying_roles() {
        let p = profile(Role::Support, &[]);
        let e = explain_access(Some(&p), &Requirement::MinimumRole(Role::Manager));

        assert!(!e.granted);
        let denial = e.denial.unwrap();
        assert_eq!(denial.kind, DenialKind::InsufficientRole);
        assert_eq!(denial.suggestions, vec!["Assign one of: manager, admin".to_string()]);
    }

    #[test]
    fn explanation_without_profile() {
        let e = explain_access(None, &Requirement::MinimumRole(Role::User));
        assert!(!e.granted);
        assert!(e.profile.is_none());
        assert_eq!(e.denial.unwrap().kind, DenialKind::NoProfile);
    }

    #[test]
    fn explanation_notes_admin_bypass() {
        let p = profile(Role::Admin, &[]);
        let requirement = Requirement::Permission(PermissionKey::from_static("users.manage"));
        let e = explain_access(Some(&p), &requirement);
        assert!(e.granted);
        assert!(e.profile.unwrap().admin_bypass);
    }

    proptest! {
        #[test]
        fn satisfies_role_is_monotonic(held in any_role(), required in any_role()) {
            let p = profile(held, &[]);
            prop_assert_eq!(
                satisfies_role(Some(&p), required),
                role_level(held) >= role_level(required)
            );
        }

        #[test]
        fn admin_holds_every_permission(
            key in "[a-z]{1,8}\\.[a-z]{1,8}",
            with_perms in any::<bool>()
        ) {
            let perms: &[&'static str] = if with_perms { &["leads.view"] } else { &[] };
            let p = profile(Role::Admin, perms);
            prop_assert!(has_permission(Some(&p), &key));
        }

        #[test]
        fn explanation_agrees_with_predicate(held in any_role(), required in any_role()) {
            let p = profile(held, &[]);
            let req = Requirement::MinimumRole(required);
            prop_assert_eq!(explain_access(Some(&p), &req).granted, req.is_satisfied_by(Some(&p)));
        }
    }
}
