//! Change-notification model and remote keys
//!
//! A remote key is the canonical identifier for a sync endpoint: a location
//! with a `<remote>:` prefix is its own key, a bare local path is rewritten
//! to `local:<path>`. Watchers buffer [`FileChange`] values per key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical identifier for a sync endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteKey(String);

impl RemoteKey {
    /// Canonicalises a location string into a remote key.
    ///
    /// `"gdrive:/data"` → `"gdrive:/data"`, `"/home/a"` → `"local:/home/a"`.
    pub fn from_location(location: &str) -> Self {
        if location.contains(':') {
            RemoteKey(location.to_string())
        } else {
            RemoteKey(format!("local:{location}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a change concerns a directory or an object (file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    Object,
}

/// The kind of change a watcher detected.
///
/// The notification callback cannot distinguish create from modify, so both
/// surface as `Modified`. `Deleted` exists in the wire format but is never
/// produced by the current notification path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Modified,
    Deleted,
}

/// A single detected change on a remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the remote root.
    pub path: String,
    pub entry: EntryKind,
    pub kind: ChangeKind,
    pub detected_at: DateTime<Utc>,
}

impl FileChange {
    pub fn modified(path: impl Into<String>, entry: EntryKind) -> Self {
        FileChange {
            path: path.into(),
            entry,
            kind: ChangeKind::Modified,
            detected_at: Utc::now(),
        }
    }
}

/// Changes drained from a watcher in one atomic operation.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub remote_key: Option<RemoteKey>,
    pub changes: Vec<FileChange>,
}

impl ChangeSet {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Persisted per-remote delta record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaState {
    pub remote_key: RemoteKey,
    /// Provider tag, `"none"` when the backend lacks change notification.
    pub provider: String,
    pub is_watching: bool,
    pub last_full_sync: Option<DateTime<Utc>>,
    /// Consecutive delta syncs since the last full sync.
    pub delta_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_key_keeps_remote_prefix() {
        let key = RemoteKey::from_location("gdrive:/data");
        assert_eq!(key.as_str(), "gdrive:/data");
    }

    #[test]
    fn test_remote_key_rewrites_local_path() {
        let key = RemoteKey::from_location("/home/user/docs");
        assert_eq!(key.as_str(), "local:/home/user/docs");
    }

    #[test]
    fn test_remote_key_equality() {
        assert_eq!(
            RemoteKey::from_location("/a"),
            RemoteKey::from_location("/a")
        );
        assert_ne!(
            RemoteKey::from_location("/a"),
            RemoteKey::from_location("dropbox:/a")
        );
    }

    #[test]
    fn test_changeset_has_changes() {
        let mut set = ChangeSet::default();
        assert!(!set.has_changes());
        set.changes
            .push(FileChange::modified("notes.md", EntryKind::Object));
        assert!(set.has_changes());
    }
}
