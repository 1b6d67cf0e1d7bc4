//! Tenant-scoped user profile (role + permissions).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pipedesk_core::{TenantId, UserId};

use crate::permissions::PermissionSet;
use crate::roles::{self, Role};

/// Application record describing a user inside their tenant.
///
/// # Invariants
/// - `id` equals the identity backend's user id (one profile per identity).
/// - `role` is always one of the closed [`Role`] set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(rename = "company_id", alias = "tenant_id")]
    pub tenant_id: TenantId,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "roles::deserialize_lenient")]
    pub role: Role,
    #[serde(default)]
    pub permissions: PermissionSet,
    #[serde(default = "active_by_default")]
    pub is_active: bool,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn active_by_default() -> bool {
    true
}

impl Profile {
    /// Minimal active profile with no explicit permissions.
    pub fn new(id: UserId, tenant_id: TenantId, email: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            tenant_id,
            email: email.into(),
            first_name: None,
            last_name: None,
            avatar_url: None,
            phone: None,
            role,
            permissions: PermissionSet::default(),
            is_active: true,
            last_login: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    /// "First Last", falling back to the email address.
    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if parts.is_empty() {
            self.email.clone()
        } else {
            parts.join(" ")
        }
    }
}

/// Partial update of the mutable profile columns. `None` leaves a column as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch in place and stamp `updated_at`.
    pub fn apply(&self, profile: &mut Profile, now: DateTime<Utc>) {
        if let Some(v) = &self.first_name {
            profile.first_name = Some(v.clone());
        }
        if let Some(v) = &self.last_name {
            profile.last_name = Some(v.clone());
        }
        if let Some(v) = &self.avatar_url {
            profile.avatar_url = Some(v.clone());
        }
        if let Some(v) = &self.phone {
            profile.phone = Some(v.clone());
        }
        if let Some(v) = self.role {
            profile.role = v;
        }
        if let Some(v) = &self.permissions {
            profile.permissions = v.clone();
        }
        if let Some(v) = self.is_active {
            profile.is_active = v;
        }
        if let Some(v) = self.last_login {
            profile.last_login = Some(v);
        }
        profile.updated_at = Some(now);
    }
}
