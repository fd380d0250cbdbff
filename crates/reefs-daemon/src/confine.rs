// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mapping of caller-supplied paths onto the confinement root
//!
//! This is the only place where bytes from the secure side become host
//! paths. Every path is treated as relative to the root; `..` is refused
//! outright rather than normalised.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use reefs_proto::REEFS_PATH_MAX;

use crate::error::{ReefsError, ReefsResult};

/// A resolved host path below the confinement root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfinedPath {
    pub host: PathBuf,
    /// The caller named the confinement root itself
    pub is_root: bool,
}

#[derive(Clone, Debug)]
pub struct ConfinedRoot {
    root: PathBuf,
}

impl ConfinedRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller path (terminator already stripped)
    pub fn resolve(&self, raw: &[u8]) -> ReefsResult<ConfinedPath> {
        if raw.len() >= REEFS_PATH_MAX {
            return Err(ReefsError::NameTooLong);
        }

        let mut host = self.root.clone();
        let mut depth = 0usize;
        for component in raw.split(|&b| b == b'/') {
            match component {
                b"" | b"." => continue,
                b".." => return Err(ReefsError::PathEscape),
                name => {
                    host.push(OsStr::from_bytes(name));
                    depth += 1;
                }
            }
        }

        Ok(ConfinedPath {
            host,
            is_root: depth == 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> ConfinedRoot {
        ConfinedRoot::new("/data/reefs")
    }

    #[test]
    fn absolute_and_relative_paths_land_under_root() {
        let resolved = root().resolve(b"/a/b/c").unwrap();
        assert_eq!(resolved.host, PathBuf::from("/data/reefs/a/b/c"));
        assert!(!resolved.is_root);

        assert_eq!(root().resolve(b"a//./b/").unwrap().host, PathBuf::from("/data/reefs/a/b"));
    }

    #[test]
    fn root_spellings() {
        for raw in [&b""[..], b"/", b"/./", b"//."] {
            let resolved = root().resolve(raw).unwrap();
            assert!(resolved.is_root, "{:?}", raw);
            assert_eq!(resolved.host, PathBuf::from("/data/reefs"));
        }
    }

    #[test]
    fn parent_components_are_refused() {
        for raw in [&b".."[..], b"/../etc/passwd", b"/a/../../b", b"a/.."] {
            assert!(matches!(root().resolve(raw), Err(ReefsError::PathEscape)));
        }
        // only an exact `..` component is special
        assert!(root().resolve(b"/a/..b/c..").is_ok());
    }

    #[test]
    fn overlong_paths_are_refused() {
        let long = vec![b'x'; REEFS_PATH_MAX];
        assert!(matches!(root().resolve(&long), Err(ReefsError::NameTooLong)));
    }
}
