use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use pipedesk_core::DomainError;

/// CRM role, drawn from a closed set with a total order.
///
/// Ordering follows the hierarchy used for minimum-level checks:
/// `user < support < sales < finance < manager < admin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Support,
    Sales,
    Finance,
    Manager,
    Admin,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::User,
        Role::Support,
        Role::Sales,
        Role::Finance,
        Role::Manager,
        Role::Admin,
    ];

    /// Position in the hierarchy, `0` for `user` up to `5` for `admin`.
    pub fn level(self) -> u8 {
        match self {
            Role::User => 0,
            Role::Support => 1,
            Role::Sales => 2,
            Role::Finance => 3,
            Role::Manager => 4,
            Role::Admin => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Support => "support",
            Role::Sales => "sales",
            Role::Finance => "finance",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }

    /// Decode a stored role name, falling back to `user` for anything
    /// missing or outside the closed set.
    pub fn lenient(name: Option<&str>) -> Self {
        match name {
            Some(name) => name.parse().unwrap_or_else(|_| {
                tracing::debug!(role = name, "unknown role; treating as user");
                Role::User
            }),
            None => Role::User,
        }
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown role '{s}'")))
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serde hook for profile rows: unknown, null or non-string roles decode as `user`.
pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Role, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(Role::lenient(raw.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_follow_declaration_order() {
        for pair in Role::ALL.windows(2) {
            assert!(pair[0].level() < pair[1].level());
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Role::User.level(), 0);
        assert_eq!(Role::Admin.level(), 5);
    }

    #[test]
    fn parse_is_exact() {
        assert_eq!("finance".parse::<Role>().unwrap(), Role::Finance);
        assert!("Finance".parse::<Role>().is_err());
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn lenient_defaults_to_user() {
        assert_eq!(Role::lenient(Some("owner")), Role::User);
        assert_eq!(Role::lenient(None), Role::User);
        assert_eq!(Role::lenient(Some("manager")), Role::Manager);
    }
}
