//! Configuration center model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a config file: `(namespace, group, file_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigFileKey {
    /// Namespace.
    pub namespace: String,
    /// Group.
    pub group: String,
    /// File name.
    pub file_name: String,
}

impl ConfigFileKey {
    /// Creates a key.
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            file_name: file_name.into(),
        }
    }
}

impl fmt::Display for ConfigFileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.group, self.file_name)
    }
}

/// A configuration file held by a config center.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Namespace.
    pub namespace: String,
    /// Group.
    pub group: String,
    /// File name.
    pub file_name: String,
    /// File content.
    #[serde(default)]
    pub content: String,
    /// Labels.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ConfigFile {
    /// Creates a file.
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            file_name: file_name.into(),
            content: content.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Adds a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// The identity key of this file.
    pub fn key(&self) -> ConfigFileKey {
        ConfigFileKey::new(
            self.namespace.clone(),
            self.group.clone(),
            self.file_name.clone(),
        )
    }
}

/// Kind of change reported for a watched config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigChangeKind {
    /// Content or tags changed.
    Modified,
    /// The file was removed at the source.
    Deleted,
}

/// An incremental change to one config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    /// The file after the change (for deletes, the last known value).
    pub file: ConfigFile,
    /// What happened.
    pub kind: ConfigChangeKind,
}

impl ConfigChangeEvent {
    /// A modification event.
    pub fn modified(file: ConfigFile) -> Self {
        Self {
            file,
            kind: ConfigChangeKind::Modified,
        }
    }

    /// A deletion event.
    pub fn deleted(file: ConfigFile) -> Self {
        Self {
            file,
            kind: ConfigChangeKind::Deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_content() {
        let a = ConfigFile::new("ns", "g", "app.yaml", "a: 1");
        let b = ConfigFile::new("ns", "g", "app.yaml", "a: 2").with_tag("env", "dev");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "ns:g:app.yaml");
    }

    #[test]
    fn change_kind_serializes_lowercase() {
        let event = ConfigChangeEvent::deleted(ConfigFile::new("ns", "g", "f", ""));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "deleted");
    }
}
