//! Safe path resolution against an allowed root.
//!
//! Every other component must route caller-supplied relative paths through
//! [`SafeRoot::resolve`] before any read or write. Resolution is pure
//! validation: it never creates, writes, or deletes anything. The denylist
//! check is separate because it applies to mutating tools even when the
//! resolver itself succeeds.

use std::path::{Component, Path, PathBuf};

use crate::error::{KernelError, KernelResult};

/// Directory names no agent mutation may enter.
const DENY_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "vendor",
];

/// File extensions that commonly hold private key material.
const DENY_EXTENSIONS: &[&str] = &[".pem", ".key", ".p12", ".pfx"];

/// An absolute directory a caller is permitted to mutate within.
#[derive(Debug, Clone)]
pub struct SafeRoot {
    root: PathBuf,
}

impl SafeRoot {
    /// Wrap an existing directory as an allowed root.
    pub fn new(root: impl Into<PathBuf>) -> KernelResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(KernelError::PathAncestorMissing {
                path: root.display().to_string(),
            });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `relative` and return the absolute path inside the root.
    ///
    /// The candidate path's nearest existing ancestor, after symlink
    /// resolution, must be the root or a descendant of it. This defeats
    /// attacks where a symlinked intermediate directory points outside the
    /// root even though the final path string looks safe.
    pub fn resolve(&self, relative: &str) -> KernelResult<PathBuf> {
        if is_absolute_like(relative) {
            return Err(KernelError::PathAbsolute {
                path: relative.to_string(),
            });
        }

        let normalized = relative.replace('\\', "/");
        let mut segments = Vec::new();
        for segment in normalized.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(KernelError::PathTraversal {
                        path: relative.to_string(),
                    });
                }
                other => segments.push(other),
            }
        }

        // Defense in depth: the split above already catches `..`, but a path
        // built from raw components must agree.
        let joined: PathBuf = segments.iter().collect();
        if joined
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(KernelError::PathTraversal {
                path: relative.to_string(),
            });
        }

        let canonical_root =
            self.root
                .canonicalize()
                .map_err(|_| KernelError::PathAncestorMissing {
                    path: self.root.display().to_string(),
                })?;

        let candidate = self.root.join(&joined);
        let ancestor = nearest_existing_ancestor(&candidate, &self.root);
        let canonical_ancestor =
            ancestor
                .canonicalize()
                .map_err(|err| KernelError::Io {
                    reason: format!("canonicalize {}: {err}", ancestor.display()),
                })?;

        if !canonical_ancestor.starts_with(&canonical_root) {
            if contains_symlink(&self.root, &ancestor) {
                return Err(KernelError::PathSymlinkEscape {
                    path: relative.to_string(),
                });
            }
            return Err(KernelError::PathOutsideRoot {
                path: relative.to_string(),
            });
        }

        Ok(candidate)
    }
}

/// Check `relative` against the denylist of sensitive targets.
///
/// Applied by every mutating tool regardless of resolver success. `extra`
/// comes from [`crate::config::KernelConfig::denylist_extra`].
pub fn check_denylist(relative: &str, extra: &[String]) -> KernelResult<()> {
    let normalized = relative.replace('\\', "/");
    let segments: Vec<&str> = normalized
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();

    let denied = || KernelError::DenylistPath {
        path: relative.to_string(),
    };

    for (idx, segment) in segments.iter().enumerate() {
        let is_last = idx + 1 == segments.len();
        if DENY_DIRS.contains(segment) {
            return Err(denied());
        }
        if extra.iter().any(|e| e.as_str() == *segment) {
            return Err(denied());
        }
        if is_last {
            if *segment == ".env" || segment.starts_with(".env.") {
                return Err(denied());
            }
            for ext in DENY_EXTENSIONS {
                if segment.ends_with(ext) {
                    return Err(denied());
                }
            }
            for entry in extra {
                if entry.starts_with('.') && segment.ends_with(entry.as_str()) {
                    return Err(denied());
                }
            }
        }
    }
    Ok(())
}

/// Reject POSIX-absolute, drive-letter, and UNC forms.
fn is_absolute_like(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Walk up from `candidate` to the nearest path that exists on disk.
///
/// Stops at `root` so a fully missing subtree validates against the root
/// itself.
fn nearest_existing_ancestor(candidate: &Path, root: &Path) -> PathBuf {
    let mut current = candidate.to_path_buf();
    loop {
        if current.symlink_metadata().is_ok() || current == root {
            return current;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return root.to_path_buf(),
        }
    }
}

/// True if any component strictly below `root` on the way to `path` is a
/// symlink.
fn contains_symlink(root: &Path, path: &Path) -> bool {
    let Ok(stripped) = path.strip_prefix(root) else {
        return false;
    };
    let mut current = root.to_path_buf();
    for component in stripped.components() {
        current.push(component);
        if let Ok(meta) = current.symlink_metadata() {
            if meta.file_type().is_symlink() {
                return true;
            }
        }
    }
    false
}
