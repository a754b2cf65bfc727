//! Capsule image descriptors.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Immutable descriptor of one verified capsule image file.
///
/// Produced by the image verifier; read-only for everyone downstream.
/// Identity is `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleImage {
    pub name: String,
    /// Monotonically increasing per package.
    pub version: u64,
    /// Absolute path of the backing image file.
    pub path: PathBuf,
    /// Whether the image must be mounted through a dm-verity layer.
    pub integrity_protected: bool,
}

impl CapsuleImage {
    /// Canonical `name@version` id, also used for version-qualified
    /// mount-point names and mapper device names.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

impl fmt::Display for CapsuleImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Split a `name@version` id into its parts.
///
/// Returns `None` when there is no `@` or the version is not an integer,
/// e.g. for canonical (version-less) mount-point names.
pub fn parse_image_id(id: &str) -> Option<(String, u64)> {
    let (name, version) = id.rsplit_once('@')?;
    if name.is_empty() {
        return None;
    }
    let version = version.parse().ok()?;
    Some((name.to_string(), version))
}
