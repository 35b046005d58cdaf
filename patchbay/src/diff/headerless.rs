//! Headerless (context-only) diff engine for structured file operations.
//!
//! `create_file` / `update_file` / `delete_file` operations carry hunks that
//! start with a bare `@@` and have no line numbers. Update hunks are located
//! by scanning the entire file for positions matching the hunk's non-added
//! lines; exactly one match is required, forcing the caller to add
//! disambiguating context rather than letting the engine guess.

use std::collections::HashSet;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::diff::{
    ApplyReport, BatchCommit, ChangeKind, FileChange, PatchStats, join_lines, sha256_hex,
    split_lines,
};
use crate::error::{KernelError, KernelResult};
use crate::paths::{SafeRoot, check_denylist};

/// One structured operation against a single relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOperation {
    CreateFile { path: String, diff: String },
    UpdateFile { path: String, diff: String },
    DeleteFile { path: String },
}

impl FileOperation {
    pub fn path(&self) -> &str {
        match self {
            Self::CreateFile { path, .. }
            | Self::UpdateFile { path, .. }
            | Self::DeleteFile { path } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

struct Hunk {
    lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines that must appear verbatim in the current file (context + removals).
    fn pattern(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    fn has_context(&self) -> bool {
        self.lines
            .iter()
            .any(|line| matches!(line, HunkLine::Context(_)))
    }

    fn is_pure_addition(&self) -> bool {
        self.lines
            .iter()
            .all(|line| matches!(line, HunkLine::Add(_)))
    }
}

fn parse_hunks(diff: &str, path: &str) -> KernelResult<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    for raw in diff.lines() {
        if raw.starts_with("@@") {
            hunks.push(Hunk { lines: Vec::new() });
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            return Err(KernelError::MalformedDiff {
                reason: format!("{path}: content before first @@ marker"),
            });
        };
        if let Some(rest) = raw.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(rest.to_string()));
        } else if let Some(rest) = raw.strip_prefix('-') {
            hunk.lines.push(HunkLine::Remove(rest.to_string()));
        } else if let Some(rest) = raw.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(rest.to_string()));
        } else if raw.is_empty() {
            hunk.lines.push(HunkLine::Context(String::new()));
        } else {
            return Err(KernelError::MalformedHunkLine {
                line: raw.to_string(),
            });
        }
    }
    if hunks.is_empty() || hunks.iter().any(|h| h.lines.is_empty()) {
        return Err(KernelError::MalformedDiff {
            reason: format!("{path}: no hunk content"),
        });
    }
    Ok(hunks)
}

/// Apply a batch of operations under `root`.
///
/// Creates and updates are staged first; deletions are deferred and applied
/// only after every staged write lands, preserving batch atomicity across
/// mixed operation types.
pub fn apply(
    root: &SafeRoot,
    denylist_extra: &[String],
    operations: &[FileOperation],
) -> KernelResult<ApplyReport> {
    let mut seen = HashSet::new();
    for op in operations {
        if !seen.insert(op.path()) {
            return Err(KernelError::MalformedDiff {
                reason: format!("path named twice: {}", op.path()),
            });
        }
    }

    let mut batch = BatchCommit::new();
    let mut stats = PatchStats::default();
    let mut changes = Vec::new();

    for op in operations {
        check_denylist(op.path(), denylist_extra)?;
        let target = root.resolve(op.path())?;
        match op {
            FileOperation::CreateFile { path, diff } => {
                if target.exists() {
                    return Err(KernelError::CreateButExists { path: path.clone() });
                }
                let hunks = parse_hunks(diff, path)?;
                let mut added = Vec::new();
                for hunk in &hunks {
                    if !hunk.is_pure_addition() {
                        return Err(KernelError::MalformedDiff {
                            reason: format!("{path}: creation hunk carries non-added lines"),
                        });
                    }
                    for line in &hunk.lines {
                        if let HunkLine::Add(s) = line {
                            added.push(s.clone());
                        }
                    }
                }
                stats.insertions += added.len();
                let contents = join_lines(&added, true);
                let after_hash = sha256_hex(contents.as_bytes());
                batch.stage_write(&target, &contents)?;
                changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Create,
                    before_hash: None,
                    after_hash: Some(after_hash),
                });
            }
            FileOperation::UpdateFile { path, diff } => {
                if !target.is_file() {
                    return Err(KernelError::FileNotFound { path: path.clone() });
                }
                let original = fs::read_to_string(&target).map_err(|err| KernelError::Io {
                    reason: format!("read {path}: {err}"),
                })?;
                let hunks = parse_hunks(diff, path)?;
                let (file_stats, contents) = apply_update(path, &original, &hunks)?;
                stats.add(file_stats);
                let after_hash = sha256_hex(contents.as_bytes());
                batch.stage_write(&target, &contents)?;
                changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Update,
                    before_hash: Some(sha256_hex(original.as_bytes())),
                    after_hash: Some(after_hash),
                });
            }
            FileOperation::DeleteFile { path } => {
                if !target.is_file() {
                    return Err(KernelError::FileNotFound { path: path.clone() });
                }
                let original = fs::read(&target).map_err(|err| KernelError::Io {
                    reason: format!("read {path}: {err}"),
                })?;
                batch.stage_delete(&target);
                changes.push(FileChange {
                    path: path.clone(),
                    kind: ChangeKind::Delete,
                    before_hash: Some(sha256_hex(&original)),
                    after_hash: None,
                });
            }
        }
    }

    batch.commit()?;
    Ok(ApplyReport {
        stats,
        files: changes,
    })
}

fn apply_update(path: &str, original: &str, hunks: &[Hunk]) -> KernelResult<(PatchStats, String)> {
    let (mut lines, trailing) = split_lines(original);
    let mut stats = PatchStats::default();

    for (hunk_idx, hunk) in hunks.iter().enumerate() {
        if !hunk.has_context() {
            return Err(KernelError::MalformedDiff {
                reason: format!(
                    "{path}: update hunk {} has no context line",
                    hunk_idx + 1
                ),
            });
        }
        let pattern = hunk.pattern();
        let matches = find_matches(&lines, &pattern);
        match matches.len() {
            0 => {
                return Err(KernelError::HunkFailed {
                    reason: format!(
                        "{path}: hunk {} context not found in file",
                        hunk_idx + 1
                    ),
                });
            }
            1 => {}
            n => {
                return Err(KernelError::AmbiguousMatch {
                    reason: format!(
                        "{path}: hunk {} context matches {n} locations; add more context",
                        hunk_idx + 1
                    ),
                });
            }
        }

        let position = matches[0];
        let mut replacement = Vec::with_capacity(hunk.lines.len());
        for line in &hunk.lines {
            match line {
                HunkLine::Context(s) => replacement.push(s.clone()),
                HunkLine::Add(s) => {
                    replacement.push(s.clone());
                    stats.insertions += 1;
                }
                HunkLine::Remove(_) => {
                    stats.deletions += 1;
                }
            }
        }
        lines.splice(position..position + pattern.len(), replacement);
    }

    Ok((stats, join_lines(&lines, trailing)))
}

/// Every start index where `pattern` appears as a contiguous window in `lines`.
fn find_matches(lines: &[String], pattern: &[&str]) -> Vec<usize> {
    if pattern.is_empty() || pattern.len() > lines.len() {
        return Vec::new();
    }
    let mut matches = Vec::new();
    for start in 0..=lines.len() - pattern.len() {
        if lines[start..start + pattern.len()]
            .iter()
            .zip(pattern.iter())
            .all(|(line, expected)| line == expected)
        {
            matches.push(start);
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, SafeRoot) {
        let temp = tempfile::tempdir().expect("tempdir");
        let safe = SafeRoot::new(temp.path()).expect("safe root");
        (temp, safe)
    }

    fn update(path: &str, diff: &str) -> FileOperation {
        FileOperation::UpdateFile {
            path: path.to_string(),
            diff: diff.to_string(),
        }
    }

    #[test]
    fn creates_updates_and_deletes_in_one_batch() {
        let (temp, safe) = root();
        fs::write(temp.path().join("edit.txt"), "keep\nold\n").expect("seed");
        fs::write(temp.path().join("drop.txt"), "bye\n").expect("seed");

        let ops = vec![
            FileOperation::CreateFile {
                path: "fresh.txt".to_string(),
                diff: "@@\n+hello\n+world\n".to_string(),
            },
            update("edit.txt", "@@\n keep\n-old\n+new\n"),
            FileOperation::DeleteFile {
                path: "drop.txt".to_string(),
            },
        ];
        let report = apply(&safe, &[], &ops).expect("apply");

        assert_eq!(
            fs::read_to_string(temp.path().join("fresh.txt")).expect("read"),
            "hello\nworld\n"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("edit.txt")).expect("read"),
            "keep\nnew\n"
        );
        assert!(!temp.path().join("drop.txt").exists());
        assert_eq!(report.stats, PatchStats { insertions: 3, deletions: 1 });
        assert_eq!(report.files.len(), 3);
    }

    #[test]
    fn ambiguous_context_is_never_silently_applied() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "dup\nx\ndup\n").expect("seed");
        let ops = vec![update("f", "@@\n dup\n+inserted\n")];
        let err = apply(&safe, &[], &ops).expect_err("ambiguous");
        assert_eq!(err.code(), "AMBIGUOUS_MATCH");
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "dup\nx\ndup\n"
        );
    }

    #[test]
    fn zero_matches_is_hunk_failed() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "a\n").expect("seed");
        let ops = vec![update("f", "@@\n missing\n+x\n")];
        let err = apply(&safe, &[], &ops).expect_err("no match");
        assert_eq!(err.code(), "HUNK_FAILED");
    }

    #[test]
    fn update_hunk_without_context_is_malformed() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "a\n").expect("seed");
        let ops = vec![update("f", "@@\n+only adds\n")];
        let err = apply(&safe, &[], &ops).expect_err("no context");
        assert_eq!(err.code(), "MALFORMED_DIFF");
    }

    #[test]
    fn create_hunk_with_context_is_malformed() {
        let (_temp, safe) = root();
        let ops = vec![FileOperation::CreateFile {
            path: "f".to_string(),
            diff: "@@\n context\n+x\n".to_string(),
        }];
        let err = apply(&safe, &[], &ops).expect_err("context in create");
        assert_eq!(err.code(), "MALFORMED_DIFF");
    }

    #[test]
    fn duplicate_path_in_batch_is_rejected() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "a\n").expect("seed");
        let ops = vec![update("f", "@@\n a\n+x\n"), update("f", "@@\n a\n+y\n")];
        let err = apply(&safe, &[], &ops).expect_err("dup");
        assert_eq!(err.code(), "MALFORMED_DIFF");
    }

    #[test]
    fn failed_update_rolls_back_whole_batch() {
        let (temp, safe) = root();
        fs::write(temp.path().join("good.txt"), "a\n").expect("seed");

        let ops = vec![
            update("good.txt", "@@\n a\n+b\n"),
            update("missing.txt", "@@\n x\n+y\n"),
        ];
        let err = apply(&safe, &[], &ops).expect_err("missing file");
        assert_eq!(err.code(), "FILE_NOT_FOUND");
        assert_eq!(
            fs::read_to_string(temp.path().join("good.txt")).expect("read"),
            "a\n"
        );
    }

    #[test]
    fn delete_failure_does_not_lose_updates_staging() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "a\n").expect("seed");
        let ops = vec![
            update("f", "@@\n a\n+b\n"),
            FileOperation::DeleteFile {
                path: "ghost.txt".to_string(),
            },
        ];
        let err = apply(&safe, &[], &ops).expect_err("ghost");
        assert_eq!(err.code(), "FILE_NOT_FOUND");
        // Nothing committed, nothing staged left behind.
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "a\n"
        );
    }
}
