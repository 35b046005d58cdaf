//! Patch application engines.
//!
//! Three in-process dialects share the goal "turn text/operations into file
//! state changes" at increasing strictness:
//!
//! - [`unified`]: classic `--- / +++ / @@` diffs applied by line position.
//! - [`headerless`]: context-only hunks located by unique full-file scan.
//! - [`anchor`]: single edits located by literal anchors with a content-hash
//!   precondition.
//!
//! (The fourth dialect, version-control-native apply, lives in
//! [`crate::vcs::Git::apply_patch`].)
//!
//! All engines route targets through [`crate::paths`] before any read or
//! write, and none ever truncates a file in place: writes are staged to
//! sibling temp files and renamed into place only after the whole batch
//! succeeds, so no partial multi-file patch is ever observable.

pub mod anchor;
pub mod headerless;
pub mod unified;

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{KernelError, KernelResult};

/// Hex-encoded SHA-256 of raw bytes, used for stale-read preconditions and
/// before/after audit records.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// What a patch did to one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Line-change counters for one apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatchStats {
    pub insertions: usize,
    pub deletions: usize,
}

impl PatchStats {
    pub fn add(&mut self, other: PatchStats) {
        self.insertions += other.insertions;
        self.deletions += other.deletions;
    }
}

/// Audit record for one touched file.
#[derive(Debug, Clone, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
}

/// Result of applying one batch of operations.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub stats: PatchStats,
    pub files: Vec<FileChange>,
}

/// Split text into lines, remembering whether a trailing newline existed so
/// content round-trips byte-for-byte.
pub(crate) fn split_lines(text: &str) -> (Vec<String>, bool) {
    if text.is_empty() {
        return (Vec::new(), true);
    }
    let trailing_newline = text.ends_with('\n');
    let body = if trailing_newline {
        &text[..text.len() - 1]
    } else {
        text
    };
    let lines = body.split('\n').map(str::to_string).collect();
    (lines, trailing_newline)
}

pub(crate) fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    if trailing_newline {
        out.push('\n');
    }
    out
}

/// All-or-nothing multi-file commit.
///
/// Writes are staged to temp files next to their targets; `commit` renames
/// every staged file into place and only then performs deferred deletions.
/// Dropping an uncommitted batch removes the temp files, so a failure at any
/// stage leaves every target untouched.
pub struct BatchCommit {
    staged: Vec<(PathBuf, PathBuf)>,
    deletes: Vec<PathBuf>,
}

impl BatchCommit {
    pub fn new() -> Self {
        Self {
            staged: Vec::new(),
            deletes: Vec::new(),
        }
    }

    /// Stage `contents` for `target`. Parent directories are created eagerly;
    /// the target itself is not touched.
    pub fn stage_write(&mut self, target: &Path, contents: &str) -> KernelResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| KernelError::Io {
                reason: format!("create directory {}: {err}", parent.display()),
            })?;
        }
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KernelError::InvalidArgs {
                reason: format!("invalid target path {}", target.display()),
            })?;
        let tmp = target.with_file_name(format!(
            ".{}.{}.patchbay-tmp",
            file_name,
            self.staged.len()
        ));
        fs::write(&tmp, contents).map_err(|err| KernelError::Io {
            reason: format!("stage {}: {err}", tmp.display()),
        })?;
        self.staged.push((target.to_path_buf(), tmp));
        Ok(())
    }

    /// Defer a deletion until every staged write has landed.
    pub fn stage_delete(&mut self, target: &Path) {
        self.deletes.push(target.to_path_buf());
    }

    /// Rename every staged file into place, then apply deferred deletions.
    pub fn commit(mut self) -> KernelResult<()> {
        // Entries leave the staged list only after their rename lands, so a
        // mid-commit failure still hands the unrenamed temps to `Drop`.
        while !self.staged.is_empty() {
            let (target, tmp) = &self.staged[0];
            fs::rename(tmp, target).map_err(|err| KernelError::Io {
                reason: format!("commit {}: {err}", target.display()),
            })?;
            self.staged.remove(0);
        }
        for target in self.deletes.drain(..) {
            fs::remove_file(&target).map_err(|err| KernelError::Io {
                reason: format!("delete {}: {err}", target.display()),
            })?;
        }
        Ok(())
    }
}

impl Default for BatchCommit {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BatchCommit {
    fn drop(&mut self) {
        for (_, tmp) in self.staged.drain(..) {
            if let Err(err) = fs::remove_file(&tmp) {
                warn!(tmp = %tmp.display(), err = %err, "failed to clean staged temp file");
            }
        }
    }
}

/// Single-file atomic replace (temp file + rename).
pub(crate) fn write_atomic(target: &Path, contents: &str) -> KernelResult<()> {
    let mut batch = BatchCommit::new();
    batch.stage_write(target, contents)?;
    batch.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn split_and_join_round_trip() {
        for text in ["", "a\n", "a\nb", "a\n\nb\n", "\n"] {
            let (lines, trailing) = split_lines(text);
            assert_eq!(join_lines(&lines, trailing), text, "text: {text:?}");
        }
    }

    #[test]
    fn batch_commit_lands_all_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = temp.path().join("a.txt");
        let b = temp.path().join("sub/b.txt");

        let mut batch = BatchCommit::new();
        batch.stage_write(&a, "a").expect("stage a");
        batch.stage_write(&b, "b").expect("stage b");
        batch.commit().expect("commit");

        assert_eq!(fs::read_to_string(&a).expect("read a"), "a");
        assert_eq!(fs::read_to_string(&b).expect("read b"), "b");
    }

    #[test]
    fn dropped_batch_leaves_no_temp_files_or_targets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = temp.path().join("a.txt");
        {
            let mut batch = BatchCommit::new();
            batch.stage_write(&a, "a").expect("stage a");
            // dropped without commit
        }
        assert!(!a.exists());
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }

    #[test]
    fn failed_commit_cleans_unrenamed_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("first.txt");
        let blocked = temp.path().join("blocked");

        let mut batch = BatchCommit::new();
        batch.stage_write(&first, "one").expect("stage first");
        batch.stage_write(&blocked, "two").expect("stage blocked");
        // A directory at the target makes the second rename fail.
        fs::create_dir(&blocked).expect("block the rename target");

        let err = batch.commit().expect_err("rename onto a directory");
        assert_eq!(err.code(), "IO_ERROR");

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .filter(|name| name.contains("patchbay-tmp"))
            .collect();
        assert!(leftovers.is_empty(), "staged temps leaked: {leftovers:?}");
    }

    #[test]
    fn deletes_apply_after_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let keep = temp.path().join("keep.txt");
        let gone = temp.path().join("gone.txt");
        fs::write(&gone, "old").expect("seed");

        let mut batch = BatchCommit::new();
        batch.stage_write(&keep, "new").expect("stage");
        batch.stage_delete(&gone);
        batch.commit().expect("commit");

        assert!(keep.exists());
        assert!(!gone.exists());
    }
}
