//! Path normalization for the ownership ledger
//!
//! Every path tracked by the ledger is relative to the game data root,
//! forward-slash separated, and folded to lower case so lookups are
//! case-insensitive. Display casing is carried separately on the virtual
//! link that registered the path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A slash-normalized, case-folded path relative to the game data root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedPath(String);

impl NormalizedPath {
    /// Normalize a relative path: forward slashes, lower case, no `.`/`..`
    /// or root components.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut parts = Vec::new();
        for component in path.as_ref().components() {
            if let Component::Normal(part) = component {
                parts.push(part.to_string_lossy().to_lowercase());
            }
        }
        Self(parts.join("/"))
    }

    /// Reconstruct from an already-normalized string (document load).
    pub fn from_normalized(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The path as an OS-native relative path for joining onto a root.
    pub fn to_rel_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }

    /// File extension, if any, in lower case.
    pub fn extension(&self) -> Option<&str> {
        let name = self.0.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            None
        } else {
            Some(ext)
        }
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NormalizedPath {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Preserve the caller's casing with forward slashes, without folding case.
/// This is the form stored on `VirtualLink::virtual_path` for display.
pub fn display_form(path: impl AsRef<Path>) -> String {
    let mut parts = Vec::new();
    for component in path.as_ref().components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_string_lossy().into_owned());
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_case_insensitive() {
        assert_eq!(
            NormalizedPath::new("Data/Textures/Sky.DDS"),
            NormalizedPath::new("data/textures/sky.dds")
        );
    }

    #[test]
    fn normalization_uses_forward_slashes() {
        let p = NormalizedPath::new(Path::new("meshes").join("actors").join("body.nif"));
        assert_eq!(p.as_str(), "meshes/actors/body.nif");
    }

    #[test]
    fn extension_is_lowercase_half_of_the_name() {
        assert_eq!(NormalizedPath::new("Data/Foo.ESP").extension(), Some("esp"));
        assert_eq!(NormalizedPath::new("Data/noext").extension(), None);
        assert_eq!(NormalizedPath::new(".hidden").extension(), None);
    }

    #[test]
    fn display_form_keeps_casing() {
        assert_eq!(display_form("Data/Textures/Sky.DDS"), "Data/Textures/Sky.DDS");
    }

    #[test]
    fn rel_path_round_trips() {
        let p = NormalizedPath::new("textures/sky.dds");
        assert_eq!(p.to_rel_path(), PathBuf::from("textures").join("sky.dds"));
    }
}
