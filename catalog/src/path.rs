//! Platform-independent byte paths within the published tree.
//!
//! Paths are absolute: the repository root is the empty path, every other
//! path starts with `/` and consists of non-empty components that contain
//! neither `/` nor NUL. The byte ordering of this representation makes
//! catalog range scans line up with subtrees.

use bstr::ByteSlice;
use thiserror::Error;

#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct CatalogPath(Vec<u8>);

#[derive(Error, Debug, PartialEq)]
pub enum PathError {
    #[error("path must be empty (root) or start with '/'")]
    NotAbsolute,
    #[error("empty path component")]
    EmptyComponent,
    #[error("NUL byte in path component")]
    NulByte,
}

impl CatalogPath {
    /// The repository root.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, PathError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Ok(Self(bytes));
        }
        if bytes[0] != b'/' {
            return Err(PathError::NotAbsolute);
        }
        for component in bytes[1..].split_str(b"/") {
            if component.is_empty() {
                return Err(PathError::EmptyComponent);
            }
            if component.contains(&0) {
                return Err(PathError::NulByte);
            }
        }
        Ok(Self(bytes))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of components; 0 for the root.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.iter().filter(|b| **b == b'/').count()
        }
    }

    pub fn join(&self, name: &[u8]) -> Result<Self, PathError> {
        if name.is_empty() {
            return Err(PathError::EmptyComponent);
        }
        if name.contains(&b'/') {
            return Err(PathError::NotAbsolute);
        }
        if name.contains(&0) {
            return Err(PathError::NulByte);
        }
        let mut bytes = self.0.clone();
        bytes.push(b'/');
        bytes.extend_from_slice(name);
        Ok(Self(bytes))
    }

    /// The parent path; `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let cut = self.0.rfind_byte(b'/').unwrap();
        Some(Self(self.0[..cut].to_vec()))
    }

    pub fn file_name(&self) -> Option<&[u8]> {
        if self.is_root() {
            return None;
        }
        let cut = self.0.rfind_byte(b'/').unwrap();
        Some(&self.0[cut + 1..])
    }

    /// Component-aware prefix test; every path is an ancestor of itself,
    /// and the root is an ancestor of everything.
    pub fn is_ancestor_of(&self, other: &CatalogPath) -> bool {
        if self.is_root() {
            return true;
        }
        other.0.starts_with(&self.0)
            && (other.0.len() == self.0.len() || other.0[self.0.len()] == b'/')
    }

    /// Strictly contains, i.e. ancestor but not equal.
    pub fn is_strict_ancestor_of(&self, other: &CatalogPath) -> bool {
        self != other && self.is_ancestor_of(other)
    }
}

impl std::fmt::Display for CatalogPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            std::fmt::Display::fmt(self.0.as_bstr(), f)
        }
    }
}

impl std::fmt::Debug for CatalogPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.0.as_bstr(), f)
    }
}

impl std::str::FromStr for CatalogPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept "/" as a spelling of the root.
        if s == "/" {
            return Ok(Self::root());
        }
        Self::new(s.as_bytes().to_vec())
    }
}
