//! Backend configuration.
//!
//! Two settings are required: the backend endpoint and its API key. Missing
//! either one leaves the whole backend unconfigured; there is no partial mode.

use std::time::Duration;

use pipedesk_auth::PermissionVocabulary;

pub const ENDPOINT_VAR: &str = "PIPEDESK_BACKEND_URL";
pub const API_KEY_VAR: &str = "PIPEDESK_BACKEND_KEY";

#[derive(Clone, Default, PartialEq, Eq)]
pub struct BackendSettings {
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl BackendSettings {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: normalize_endpoint(Some(endpoint.into())),
            api_key: normalize(Some(api_key.into())),
        }
    }

    pub fn unconfigured() -> Self {
        Self::default()
    }

    /// Read `PIPEDESK_BACKEND_URL` / `PIPEDESK_BACKEND_KEY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Self {
            endpoint: normalize_endpoint(lookup(ENDPOINT_VAR)),
            api_key: normalize(lookup(API_KEY_VAR)),
        };
        if !settings.is_configured() {
            tracing::warn!(
                "{ENDPOINT_VAR} and {API_KEY_VAR} must both be set; backend features are disabled"
            );
        }
        settings
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.api_key.is_some()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

impl core::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_endpoint(value: Option<String>) -> Option<String> {
    normalize(value)
        .map(|v| v.trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

/// How long before expiry a held session is refreshed.
pub const DEFAULT_REFRESH_AHEAD: Duration = Duration::from_secs(30);

/// Bound of the synchronizer's internal command channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Session synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    pub settings: BackendSettings,
    /// When set, profile permissions outside this vocabulary are dropped on load.
    pub vocabulary: Option<PermissionVocabulary>,
    /// Zero disables proactive refresh; the session is still cleared at expiry.
    pub refresh_ahead: Duration,
    pub command_capacity: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self::new(BackendSettings::unconfigured())
    }
}

impl SynchronizerConfig {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            vocabulary: None,
            refresh_ahead: DEFAULT_REFRESH_AHEAD,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }

    pub fn with_vocabulary(mut self, vocabulary: PermissionVocabulary) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    pub fn with_refresh_ahead(mut self, ahead: Duration) -> Self {
        self.refresh_ahead = ahead;
        self
    }

    /// Capacity of the command channel; clamped to at least one.
    pub fn with_command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn both_values_required() {
        let full = BackendSettings::from_lookup(lookup(&[
            (ENDPOINT_VAR, "https://crm.example.com/"),
            (API_KEY_VAR, "anon"),
        ]));
        assert!(full.is_configured());
        assert_eq!(full.endpoint(), Some("https://crm.example.com"));

        let no_key =
            BackendSettings::from_lookup(lookup(&[(ENDPOINT_VAR, "https://crm.example.com")]));
        assert!(!no_key.is_configured());

        let no_endpoint = BackendSettings::from_lookup(lookup(&[(API_KEY_VAR, "anon")]));
        assert!(!no_endpoint.is_configured());
    }

    #[test]
    fn blank_values_are_missing() {
        let blank = BackendSettings::new("  ", "anon");
        assert!(!blank.is_configured());
        assert!(!BackendSettings::new("/", "anon").is_configured());
        assert!(!BackendSettings::new("https://crm.example.com", "\t").is_configured());
    }

    #[test]
    fn debug_hides_the_key() {
        let s = BackendSettings::new("https://crm.example.com", "super-secret");
        assert!(!format!("{s:?}").contains("super-secret"));
    }

    #[test]
    fn synchronizer_defaults_and_builders() {
        let config = SynchronizerConfig::default();
        assert!(!config.settings.is_configured());
        assert_eq!(config.refresh_ahead, DEFAULT_REFRESH_AHEAD);
        assert_eq!(config.command_capacity, DEFAULT_COMMAND_CAPACITY);

        let tuned = SynchronizerConfig::new(BackendSettings::new("https://crm.example.com", "k"))
            .with_refresh_ahead(Duration::ZERO)
            .with_command_capacity(0);
        assert!(tuned.refresh_ahead.is_zero());
        assert_eq!(tuned.command_capacity, 1);
    }
}
