//! In-process unified diff engine (no external tool).
//!
//! Parses `--- / +++ / @@ -a,b +c,d @@` headers and per-line `+/-/ ` bodies,
//! and applies hunks sequentially against an in-memory line array with an
//! offset counter for prior insertions and deletions. Creation and same-path
//! modification only: renames, deletions, and binary patches are rejected
//! with their taxonomy codes rather than guessed at.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::diff::{
    ApplyReport, BatchCommit, ChangeKind, FileChange, PatchStats, join_lines, sha256_hex,
    split_lines,
};
use crate::error::{KernelError, KernelResult};
use crate::paths::{SafeRoot, check_denylist};

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// One `@@` region of a file patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

/// All hunks against a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` when the old side is `/dev/null` (file creation).
    pub old_path: Option<String>,
    /// Target path, relative to the allowed root.
    pub path: String,
    pub hunks: Vec<Hunk>,
    /// `\ No newline at end of file` seen on the old side.
    pub old_no_newline: bool,
    /// `\ No newline at end of file` seen on the new side.
    pub new_no_newline: bool,
}

/// A parsed multi-file unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedPatch {
    pub files: Vec<FilePatch>,
}

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hunk header regex")
});

/// Parse unified diff text into a structured patch.
pub fn parse(text: &str) -> KernelResult<UnifiedPatch> {
    let lines: Vec<&str> = text.lines().collect();
    let mut files: Vec<FilePatch> = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        if line.is_empty()
            || line.starts_with("diff --git")
            || line.starts_with("index ")
            || line.starts_with("new file mode")
            || line.starts_with("old mode")
            || line.starts_with("new mode")
        {
            i += 1;
            continue;
        }
        if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
            return Err(KernelError::BinaryPatchNotSupported);
        }
        if line.starts_with("rename from") || line.starts_with("rename to") {
            return Err(KernelError::RenameNotSupported);
        }
        if line.starts_with("deleted file mode") {
            return Err(KernelError::DeleteNotSupported);
        }
        if let Some(old_raw) = line.strip_prefix("--- ") {
            let Some(new_line) = lines.get(i + 1) else {
                return Err(KernelError::MalformedDiff {
                    reason: "missing +++ header".to_string(),
                });
            };
            let Some(new_raw) = new_line.strip_prefix("+++ ") else {
                return Err(KernelError::MalformedDiff {
                    reason: format!("expected +++ header, found '{new_line}'"),
                });
            };
            let old_path = parse_header_path(old_raw);
            let new_path = parse_header_path(new_raw);
            let Some(path) = new_path else {
                return Err(KernelError::DeleteNotSupported);
            };
            if let Some(old) = &old_path {
                if *old != path {
                    return Err(KernelError::RenameNotSupported);
                }
            }
            i += 2;
            let mut file = FilePatch {
                old_path,
                path,
                hunks: Vec::new(),
                old_no_newline: false,
                new_no_newline: false,
            };
            i = parse_hunks(&lines, i, &mut file)?;
            if file.hunks.is_empty() {
                return Err(KernelError::MalformedDiff {
                    reason: format!("no hunks for {}", file.path),
                });
            }
            files.push(file);
            continue;
        }
        return Err(KernelError::MalformedDiff {
            reason: format!("unexpected line outside hunk: '{line}'"),
        });
    }

    if files.is_empty() {
        return Err(KernelError::MalformedDiff {
            reason: "no file patches found".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for file in &files {
        if !seen.insert(file.path.as_str()) {
            return Err(KernelError::MalformedDiff {
                reason: format!("path named twice: {}", file.path),
            });
        }
    }

    Ok(UnifiedPatch { files })
}

fn parse_header_path(raw: &str) -> Option<String> {
    // Header may carry a tab-separated timestamp.
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

fn parse_hunks(lines: &[&str], mut i: usize, file: &mut FilePatch) -> KernelResult<usize> {
    while i < lines.len() {
        let line = lines[i];
        if !line.starts_with("@@") {
            break;
        }
        let caps = HUNK_HEADER
            .captures(line)
            .ok_or_else(|| KernelError::MalformedHunkHeader {
                header: line.to_string(),
            })?;
        let num = |idx: usize, default: usize| -> usize {
            caps.get(idx)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(default)
        };
        let mut hunk = Hunk {
            old_start: num(1, 0),
            old_len: num(2, 1),
            new_start: num(3, 0),
            new_len: num(4, 1),
            lines: Vec::new(),
        };
        i += 1;
        let mut last_was_add = false;
        while i < lines.len() {
            let body = lines[i];
            if body.starts_with("@@") || body.starts_with("--- ") || body.starts_with("diff ") {
                break;
            }
            if let Some(rest) = body.strip_prefix('+') {
                hunk.lines.push(HunkLine::Add(rest.to_string()));
                last_was_add = true;
            } else if let Some(rest) = body.strip_prefix('-') {
                hunk.lines.push(HunkLine::Remove(rest.to_string()));
                last_was_add = false;
            } else if let Some(rest) = body.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(rest.to_string()));
                last_was_add = false;
            } else if body.starts_with('\\') {
                // `\ No newline at end of file` binds to the preceding line's side.
                if last_was_add {
                    file.new_no_newline = true;
                } else {
                    file.old_no_newline = true;
                    if matches!(hunk.lines.last(), Some(HunkLine::Context(_))) {
                        file.new_no_newline = true;
                    }
                }
            } else if body.is_empty() {
                // Tolerate context lines whose trailing space was stripped.
                hunk.lines.push(HunkLine::Context(String::new()));
                last_was_add = false;
            } else {
                return Err(KernelError::MalformedHunkLine {
                    line: body.to_string(),
                });
            }
            i += 1;
        }
        if hunk.lines.is_empty() {
            return Err(KernelError::MalformedHunkHeader {
                header: line.to_string(),
            });
        }
        file.hunks.push(hunk);
    }
    Ok(i)
}

/// Compute the inverse patch: applying `patch` then `reverse(patch)` returns
/// every touched file to its pre-patch bytes.
///
/// The reverse of a creation would be a deletion, which this engine refuses.
pub fn reverse(patch: &UnifiedPatch) -> KernelResult<UnifiedPatch> {
    let mut files = Vec::with_capacity(patch.files.len());
    for file in &patch.files {
        if file.old_path.is_none() {
            return Err(KernelError::DeleteNotSupported);
        }
        let hunks = file
            .hunks
            .iter()
            .map(|hunk| Hunk {
                old_start: hunk.new_start,
                old_len: hunk.new_len,
                new_start: hunk.old_start,
                new_len: hunk.old_len,
                lines: hunk
                    .lines
                    .iter()
                    .map(|line| match line {
                        HunkLine::Context(s) => HunkLine::Context(s.clone()),
                        HunkLine::Add(s) => HunkLine::Remove(s.clone()),
                        HunkLine::Remove(s) => HunkLine::Add(s.clone()),
                    })
                    .collect(),
            })
            .collect();
        files.push(FilePatch {
            old_path: file.old_path.clone(),
            path: file.path.clone(),
            hunks,
            old_no_newline: file.new_no_newline,
            new_no_newline: file.old_no_newline,
        });
    }
    Ok(UnifiedPatch { files })
}

/// Apply a parsed patch under `root`.
///
/// Every file is staged first and committed only after the whole batch
/// succeeds; any failure leaves all targets untouched.
pub fn apply(
    root: &SafeRoot,
    denylist_extra: &[String],
    patch: &UnifiedPatch,
) -> KernelResult<ApplyReport> {
    let mut batch = BatchCommit::new();
    let mut stats = PatchStats::default();
    let mut changes = Vec::new();

    for file in &patch.files {
        check_denylist(&file.path, denylist_extra)?;
        let target = root.resolve(&file.path)?;

        if file.old_path.is_none() {
            if target.exists() {
                return Err(KernelError::CreateButExists {
                    path: file.path.clone(),
                });
            }
            let (file_stats, contents) = render_creation(file)?;
            stats.add(file_stats);
            let after_hash = sha256_hex(contents.as_bytes());
            batch.stage_write(&target, &contents)?;
            changes.push(FileChange {
                path: file.path.clone(),
                kind: ChangeKind::Create,
                before_hash: None,
                after_hash: Some(after_hash),
            });
            continue;
        }

        if !target.is_file() {
            return Err(KernelError::FileNotFound {
                path: file.path.clone(),
            });
        }
        let original = std::fs::read_to_string(&target).map_err(|err| KernelError::Io {
            reason: format!("read {}: {err}", file.path),
        })?;
        let (file_stats, contents) = apply_to_content(file, &original)?;
        stats.add(file_stats);
        let after_hash = sha256_hex(contents.as_bytes());
        batch.stage_write(&target, &contents)?;
        changes.push(FileChange {
            path: file.path.clone(),
            kind: ChangeKind::Update,
            before_hash: Some(sha256_hex(original.as_bytes())),
            after_hash: Some(after_hash),
        });
    }

    batch.commit()?;
    Ok(ApplyReport {
        stats,
        files: changes,
    })
}

fn render_creation(file: &FilePatch) -> KernelResult<(PatchStats, String)> {
    let mut added = Vec::new();
    for hunk in &file.hunks {
        for line in &hunk.lines {
            match line {
                HunkLine::Add(s) => added.push(s.clone()),
                _ => {
                    return Err(KernelError::MalformedDiff {
                        reason: format!("creation of {} carries non-added lines", file.path),
                    });
                }
            }
        }
    }
    let stats = PatchStats {
        insertions: added.len(),
        deletions: 0,
    };
    Ok((stats, join_lines(&added, !file.new_no_newline)))
}

/// Apply one file's hunks to in-memory content.
pub fn apply_to_content(file: &FilePatch, original: &str) -> KernelResult<(PatchStats, String)> {
    let (mut lines, original_trailing) = split_lines(original);
    let mut stats = PatchStats::default();
    let mut offset: isize = 0;

    for (hunk_idx, hunk) in file.hunks.iter().enumerate() {
        // `@@ -0,0 +n @@` means insert before the first line.
        let base = if hunk.old_len == 0 {
            hunk.old_start as isize
        } else {
            hunk.old_start as isize - 1
        };
        let start = base + offset;
        if start < 0 || start as usize > lines.len() {
            return Err(KernelError::HunkOutOfBounds {
                reason: format!(
                    "{}: hunk {} starts at line {} but file has {} lines",
                    file.path,
                    hunk_idx + 1,
                    hunk.old_start,
                    lines.len()
                ),
            });
        }

        let mut cursor = start as usize;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) => {
                    let actual = lines.get(cursor).map(String::as_str);
                    if actual != Some(expected.as_str()) {
                        return Err(hunk_mismatch(file, hunk_idx, cursor, expected, actual));
                    }
                    cursor += 1;
                }
                HunkLine::Remove(expected) => {
                    let actual = lines.get(cursor).map(String::as_str);
                    if actual != Some(expected.as_str()) {
                        return Err(hunk_mismatch(file, hunk_idx, cursor, expected, actual));
                    }
                    lines.remove(cursor);
                    stats.deletions += 1;
                }
                HunkLine::Add(added) => {
                    lines.insert(cursor, added.clone());
                    cursor += 1;
                    stats.insertions += 1;
                }
            }
        }
        offset += hunk.new_len as isize - hunk.old_len as isize;
    }

    let trailing = if file.new_no_newline {
        false
    } else if file.old_no_newline {
        true
    } else {
        original_trailing
    };
    Ok((stats, join_lines(&lines, trailing)))
}

fn hunk_mismatch(
    file: &FilePatch,
    hunk_idx: usize,
    cursor: usize,
    expected: &str,
    actual: Option<&str>,
) -> KernelError {
    KernelError::HunkFailed {
        reason: format!(
            "{}: hunk {} expected '{}' at line {}, found {}",
            file.path,
            hunk_idx + 1,
            expected,
            cursor + 1,
            actual.map_or("end of file".to_string(), |a| format!("'{a}'")),
        ),
    }
}
