use std::borrow::Cow;
use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use pipedesk_core::DomainError;

/// Permission identifier, e.g. `"leads.view"`.
///
/// Keys are dot-separated lowercase segments (`module.action`, or
/// `module.resource.action`). Segments may contain `a-z`, `0-9` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PermissionKey(Cow<'static, str>);

impl PermissionKey {
    /// Build a key from a trusted literal. Use [`PermissionKey::parse`] for
    /// anything that came off the wire.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn parse(name: impl Into<Cow<'static, str>>) -> Result<Self, DomainError> {
        let name = name.into();
        if is_well_formed(&name) {
            Ok(Self(name))
        } else {
            Err(DomainError::validation(format!("malformed permission key '{name}'")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PermissionKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        PermissionKey::parse(raw).map_err(serde::de::Error::custom)
    }
}

fn is_well_formed(name: &str) -> bool {
    let mut segments = 0;
    for segment in name.split('.') {
        if segment.is_empty()
            || !segment
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

/// The externally defined set of permission keys the application knows about.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionVocabulary(BTreeSet<PermissionKey>);

impl PermissionVocabulary {
    pub fn new(keys: impl IntoIterator<Item = PermissionKey>) -> Self {
        Self(keys.into_iter().collect())
    }

    /// Capabilities exposed by the CRM screens.
    pub fn crm_default() -> Self {
        const MODULES: [&str; 8] = [
            "leads", "contacts", "deals", "projects", "tasks", "quotes", "invoices", "companies",
        ];
        const ACTIONS: [&str; 4] = ["view", "create", "edit", "delete"];

        let mut keys: BTreeSet<PermissionKey> = MODULES
            .iter()
            .flat_map(|m| ACTIONS.iter().map(move |a| format!("{m}.{a}")))
            .filter_map(|k| PermissionKey::parse(k).ok())
            .collect();
        keys.extend([
            PermissionKey::from_static("reports.view"),
            PermissionKey::from_static("reports.export"),
            PermissionKey::from_static("settings.view"),
            PermissionKey::from_static("settings.manage"),
            PermissionKey::from_static("users.view"),
            PermissionKey::from_static("users.manage"),
        ]);
        Self(keys)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|k| k.as_str() == key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Validated set of permission keys granted to a profile.
///
/// Profiles store permissions as loosely typed JSON. Decoding keeps only
/// well-formed string keys and silently drops everything else, so a bad row
/// narrows access instead of failing the load.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<PermissionKey>);

impl PermissionSet {
    pub fn new(keys: impl IntoIterator<Item = PermissionKey>) -> Self {
        Self(keys.into_iter().collect())
    }

    /// Decode a stored permission payload.
    ///
    /// Accepts an array of strings; any other shape yields an empty set.
    /// With a vocabulary, keys outside it are dropped as well.
    pub fn from_json(value: &Value, vocabulary: Option<&PermissionVocabulary>) -> Self {
        let Some(items) = value.as_array() else {
            if !value.is_null() {
                tracing::debug!("permission payload is not an array; ignoring");
            }
            return Self::default();
        };

        let mut set = BTreeSet::new();
        for item in items {
            let Some(raw) = item.as_str() else {
                tracing::debug!(entry = %item, "dropping non-string permission entry");
                continue;
            };
            match PermissionKey::parse(raw.to_owned()) {
                Ok(key) if vocabulary.is_none_or(|v| v.contains(key.as_str())) => {
                    set.insert(key);
                }
                Ok(key) => tracing::debug!(permission = %key, "dropping unknown permission"),
                Err(e) => tracing::debug!(error = %e, "dropping malformed permission"),
            }
        }
        Self(set)
    }

    /// Drop keys that are not part of `vocabulary`.
    pub fn retain_known(&mut self, vocabulary: &PermissionVocabulary) {
        self.0.retain(|k| vocabulary.contains(k.as_str()));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|k| k.as_str() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionKey> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<PermissionKey> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = PermissionKey>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl<'de> Deserialize<'de> for PermissionSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Ok(PermissionSet::from_json(&raw, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_shape_is_validated() {
        assert!(PermissionKey::parse("leads.view").is_ok());
        assert!(PermissionKey::parse("admin.users.manage").is_ok());
        assert!(PermissionKey::parse("leads").is_err());
        assert!(PermissionKey::parse("Leads.View").is_err());
        assert!(PermissionKey::parse("leads..view").is_err());
        assert!(PermissionKey::parse("*").is_err());
    }

    #[test]
    fn from_json_keeps_only_well_formed_strings() {
        let raw = json!(["leads.view", 42, null, "BAD KEY", {"k": "v"}, "deals.edit"]);
        let set = PermissionSet::from_json(&raw, None);

        assert_eq!(set.len(), 2);
        assert!(set.contains("leads.view"));
        assert!(set.contains("deals.edit"));
    }

    #[test]
    fn from_json_tolerates_non_array_payloads() {
        assert!(PermissionSet::from_json(&json!({"leads.view": true}), None).is_empty());
        assert!(PermissionSet::from_json(&json!("leads.view"), None).is_empty());
        assert!(PermissionSet::from_json(&Value::Null, None).is_empty());
    }

    #[test]
    fn vocabulary_filters_unknown_keys() {
        let vocab = PermissionVocabulary::crm_default();
        let set = PermissionSet::from_json(&json!(["leads.view", "rockets.launch"]), Some(&vocab));

        assert!(set.contains("leads.view"));
        assert!(!set.contains("rockets.launch"));
    }

    #[test]
    fn retain_known_narrows_an_existing_set() {
        let mut set = PermissionSet::new([
            PermissionKey::from_static("leads.delete"),
            PermissionKey::from_static("rockets.launch"),
        ]);
        set.retain_known(&PermissionVocabulary::crm_default());
        assert_eq!(set.len(), 1);
        assert!(set.contains("leads.delete"));
    }

    #[test]
    fn default_vocabulary_covers_crm_modules() {
        let vocab = PermissionVocabulary::crm_default();
        assert!(vocab.contains("leads.view"));
        assert!(vocab.contains("invoices.delete"));
        assert!(vocab.contains("settings.manage"));
        assert_eq!(vocab.len(), 8 * 4 + 6);
    }

    #[test]
    fn deserialize_is_lenient() {
        let set: PermissionSet = serde_json::from_value(json!(["tasks.create", 1])).unwrap();
        assert_eq!(set.len(), 1);
    }
}
