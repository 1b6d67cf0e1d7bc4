//! Access gate for protected views.
//!
//! Consumes the synchronizer's [`AuthContext`] and never sees raw backend
//! errors. Decision order, first match wins:
//!
//! 1. still loading → [`GateDecision::Loading`]
//! 2. no session or no profile → [`GateDecision::SignInRequired`]
//! 3. required role not met → [`GateDecision::AccessDenied`]
//! 4. required permission not held → [`GateDecision::AccessDenied`]
//! 5. otherwise → [`GateDecision::Granted`]
//!
//! Role and permission checks only ever run against a loaded profile.

use serde::Serialize;

use pipedesk_auth::{
    AuthorizationExplanation, PermissionKey, Profile, Requirement, Role, explain_access,
};

use crate::context::AuthContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Loading,
    SignInRequired,
    AccessDenied { requirement: Requirement },
    Granted,
}

/// What a protected region renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered<T> {
    Loading,
    SignInPrompt,
    AccessDenied(Requirement),
    Content(T),
}

/// Requirements declared by one protected region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessGate {
    required_role: Option<Role>,
    required_permission: Option<PermissionKey>,
}

impl AccessGate {
    /// A gate that only requires a signed-in, provisioned user.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.required_role = Some(role);
        self
    }

    pub fn with_permission(mut self, permission: PermissionKey) -> Self {
        self.required_permission = Some(permission);
        self
    }

    pub fn decide(&self, ctx: &AuthContext) -> GateDecision {
        if ctx.loading {
            return GateDecision::Loading;
        }
        let (Some(_), Some(profile)) = (&ctx.session, &ctx.profile) else {
            return GateDecision::SignInRequired;
        };

        match self.first_unmet(profile) {
            Some(requirement) => GateDecision::AccessDenied { requirement },
            None => GateDecision::Granted,
        }
    }

    /// Run `content` only when access is granted.
    pub fn render<T, F>(&self, ctx: &AuthContext, content: F) -> Rendered<T>
    where
        F: FnOnce(&Profile) -> T,
    {
        match self.decide(ctx) {
            GateDecision::Loading => Rendered::Loading,
            GateDecision::SignInRequired => Rendered::SignInPrompt,
            GateDecision::AccessDenied { requirement } => Rendered::AccessDenied(requirement),
            GateDecision::Granted => match &ctx.profile {
                Some(profile) => Rendered::Content(content(profile)),
                None => Rendered::SignInPrompt,
            },
        }
    }

    /// One explanation per declared requirement, for diagnostics.
    pub fn explain(&self, ctx: &AuthContext) -> Vec<AuthorizationExplanation> {
        self.requirements()
            .iter()
            .map(|r| explain_access(ctx.profile.as_ref(), r))
            .collect()
    }

    fn requirements(&self) -> Vec<Requirement> {
        let mut out = Vec::with_capacity(2);
        if let Some(role) = self.required_role {
            out.push(Requirement::MinimumRole(role));
        }
        if let Some(permission) = &self.required_permission {
            out.push(Requirement::Permission(permission.clone()));
        }
        out
    }

    fn first_unmet(&self, profile: &Profile) -> Option<Requirement> {
        self.requirements()
            .into_iter()
            .find(|r| !r.is_satisfied_by(Some(profile)))
    }
}
