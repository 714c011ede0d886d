//! Document metadata as known to the local cache.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Stable location handle identifying one document.
///
/// Handles are compared by value and never recycled while the document exists,
/// so they double as cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(PathBuf);

impl DocumentId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Base name of the handle, if it has one and it is valid UTF-8.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|name| name.to_str())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for DocumentId {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Root of the per-account document container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerRoot(PathBuf);

impl ContainerRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Location handle for a document named `name` with the given extension.
    ///
    /// The extension is appended, never substituted: `"a.b"` becomes `"a.b.txt"`.
    pub fn document_id(&self, name: &str, extension: &str) -> DocumentId {
        DocumentId(self.0.join(format!("{name}.{extension}")))
    }
}

/// Whether `name` can be used as a single entry directly under a directory:
/// one normal path component, no separators, not hidden.
pub fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !name.contains(['/', '\\'])
        && !name.starts_with('.')
}

/// Derive the user-facing name from a file name: everything before the first
/// dot, skipping leading dots. Falls back to the whole name.
pub fn display_name(file_name: &str) -> &str {
    file_name
        .split('.')
        .find(|segment| !segment.is_empty())
        .unwrap_or(file_name)
}

/// One document as known to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub id: DocumentId,
    pub display_name: String,
    /// Content modification time in milliseconds since the Unix epoch.
    /// Absent until the remote store reports one.
    pub last_modified: Option<u64>,
}

impl DocumentMetadata {
    /// Build metadata for a handle, deriving the display name from its base name.
    /// Returns `None` if the handle has no usable base name.
    pub fn from_id(id: DocumentId, last_modified: Option<u64>) -> Option<Self> {
        let display_name = display_name(id.file_name()?).to_string();
        Some(Self {
            id,
            display_name,
            last_modified,
        })
    }
}

/// A raw item as reported by the metadata feed.
///
/// Feeds may report items that lack a location or a file name (foreign or
/// half-materialized entries); those never reach the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub location: Option<DocumentId>,
    pub file_name: Option<String>,
    pub last_modified: Option<u64>,
}

impl FeedItem {
    /// Item for a location whose file name is taken from the handle itself.
    pub fn at(location: impl Into<DocumentId>, last_modified: Option<u64>) -> Self {
        let location = location.into();
        let file_name = location.file_name().map(str::to_string);
        Self {
            location: Some(location),
            file_name,
            last_modified,
        }
    }

    /// Resolve into cache metadata. `None` when the item has no id or no name.
    pub fn resolve(&self) -> Option<DocumentMetadata> {
        let id = self.location.clone()?;
        let file_name = self.file_name.as_deref()?;
        Some(DocumentMetadata {
            id,
            display_name: display_name(file_name).to_string(),
            last_modified: self.last_modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_strips_extension() {
        assert_eq!(display_name("notes.txt"), "notes");
        assert_eq!(display_name("archive.tar.txt"), "archive");
        assert_eq!(display_name(".hidden.txt"), "hidden");
        assert_eq!(display_name("README"), "README");
    }

    #[test]
    fn test_container_appends_extension() {
        let root = ContainerRoot::new("/docs");
        let id = root.document_id("a.b", "txt");
        assert_eq!(id.as_path(), Path::new("/docs/a.b.txt"));
        assert_eq!(id.file_name(), Some("a.b.txt"));
    }

    #[test]
    fn test_plain_names() {
        assert!(is_plain_name("plan"));
        assert!(is_plain_name("a.b"));
        for name in ["", "/tmp/x", "../up", "a/b", "a/", ".", "..", ".hidden", "a\\b"] {
            assert!(!is_plain_name(name), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_feed_item_requires_location_and_name() {
        let item = FeedItem::at("/docs/plan.txt", Some(5));
        let metadata = item.resolve().unwrap();
        assert_eq!(metadata.display_name, "plan");
        assert_eq!(metadata.last_modified, Some(5));

        let nameless = FeedItem {
            location: Some("/docs/plan.txt".into()),
            file_name: None,
            last_modified: None,
        };
        assert!(nameless.resolve().is_none());

        let unlocated = FeedItem {
            location: None,
            file_name: Some("plan.txt".into()),
            last_modified: None,
        };
        assert!(unlocated.resolve().is_none());
    }
}
