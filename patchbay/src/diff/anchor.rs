//! Anchor-based single-edit tool.
//!
//! Edits are located by literal text anchors instead of line numbers, with a
//! content-hash precondition so a stale read can never clobber newer content.
//! On success the caller gets back hashes, sizes, and the touched line range,
//! enabling chained edits without re-reading the file.

use std::fs;

use serde::{Deserialize, Serialize};

use crate::diff::{sha256_hex, write_atomic};
use crate::error::{KernelError, KernelResult};
use crate::paths::{SafeRoot, check_denylist};

/// How the edit site is located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    /// Replace the span between `anchor` and `anchor_after` (or EOF).
    AnchorReplace,
    /// Insert `content` immediately following `anchor`.
    InsertAfter,
    /// Append `content` at end of file.
    Append,
}

fn default_occurrences() -> usize {
    1
}

/// One edit against a single relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub path: String,
    pub mode: EditMode,
    /// Hash of the file as the caller last read it; mismatch means re-read.
    pub expected_sha256: String,
    #[serde(default)]
    pub anchor: Option<String>,
    /// End anchor for `anchor_replace`; `None` means the span runs to EOF.
    #[serde(default)]
    pub anchor_after: Option<String>,
    pub content: String,
    /// How many times the caller expects `anchor` to occur from
    /// `search_offset` on. A different count fails the edit.
    #[serde(default = "default_occurrences")]
    pub expected_occurrences: usize,
    /// Byte offset at which anchor search begins.
    #[serde(default)]
    pub search_offset: usize,
}

/// Result of a successful edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub path: String,
    pub before_sha256: String,
    pub after_sha256: String,
    pub before_bytes: usize,
    pub after_bytes: usize,
    /// 1-based line range the edit touched in the new content.
    pub first_line: usize,
    pub last_line: usize,
}

/// Apply one edit under `root`. The write is temp-file-then-rename; the
/// target is never truncated in place.
pub fn apply_edit(
    root: &SafeRoot,
    denylist_extra: &[String],
    request: &EditRequest,
) -> KernelResult<EditOutcome> {
    check_denylist(&request.path, denylist_extra)?;
    let target = root.resolve(&request.path)?;
    if !target.is_file() {
        return Err(KernelError::FileNotFound {
            path: request.path.clone(),
        });
    }
    let original = fs::read_to_string(&target).map_err(|err| KernelError::Io {
        reason: format!("read {}: {err}", request.path),
    })?;

    let before_sha256 = sha256_hex(original.as_bytes());
    if before_sha256 != request.expected_sha256 {
        return Err(KernelError::PreconditionFailed {
            reason: format!(
                "{}: content hash changed since last read; re-read before retrying",
                request.path
            ),
        });
    }

    let (edit_start, edit_end) = locate_edit(&original, request)?;
    let mut updated = String::with_capacity(
        original.len() - (edit_end - edit_start) + request.content.len(),
    );
    updated.push_str(&original[..edit_start]);
    updated.push_str(&request.content);
    updated.push_str(&original[edit_end..]);

    write_atomic(&target, &updated)?;

    let first_line = line_at(&updated, edit_start);
    let last_line = if request.content.is_empty() {
        first_line
    } else {
        let newlines = request.content.matches('\n').count();
        let ends_with_newline = usize::from(request.content.ends_with('\n'));
        first_line + newlines - ends_with_newline
    };

    Ok(EditOutcome {
        path: request.path.clone(),
        before_sha256,
        after_sha256: sha256_hex(updated.as_bytes()),
        before_bytes: original.len(),
        after_bytes: updated.len(),
        first_line,
        last_line,
    })
}

/// Byte span `[start, end)` of `original` that the edit replaces.
fn locate_edit(original: &str, request: &EditRequest) -> KernelResult<(usize, usize)> {
    if request.mode == EditMode::Append {
        return Ok((original.len(), original.len()));
    }

    let anchor = match request.anchor.as_deref() {
        Some(a) if !a.is_empty() => a,
        _ => {
            return Err(KernelError::InvalidArgs {
                reason: format!("{:?} mode requires a non-empty anchor", request.mode),
            });
        }
    };
    if request.search_offset > original.len() || !original.is_char_boundary(request.search_offset)
    {
        return Err(KernelError::InvalidArgs {
            reason: format!(
                "search_offset {} is not a valid position in a file of {} bytes",
                request.search_offset,
                original.len()
            ),
        });
    }

    let matches = find_all(original, anchor, request.search_offset);
    if let Some(ranges) = overlapping(&matches, anchor.len()) {
        return Err(KernelError::OverlappingAnchors { ranges });
    }
    if matches.is_empty() {
        return Err(KernelError::AnchorNotFound {
            anchor: anchor.to_string(),
        });
    }
    if matches.len() != request.expected_occurrences {
        return Err(KernelError::AmbiguousMatch {
            reason: format!(
                "anchor occurs {} times, caller expected {}",
                matches.len(),
                request.expected_occurrences
            ),
        });
    }

    // The declared count is a guard; the edit site is the first match.
    let site_end = matches[0] + anchor.len();
    match request.mode {
        EditMode::InsertAfter => Ok((site_end, site_end)),
        EditMode::AnchorReplace => {
            let span_end = match request.anchor_after.as_deref() {
                None => original.len(),
                Some(after) if after.is_empty() => original.len(),
                Some(after) => match original[site_end..].find(after) {
                    Some(rel) => site_end + rel,
                    None => {
                        return Err(KernelError::AnchorNotFound {
                            anchor: after.to_string(),
                        });
                    }
                },
            };
            Ok((site_end, span_end))
        }
        EditMode::Append => unreachable!("handled above"),
    }
}

/// All match offsets of `needle` in `haystack[from..]`, including overlaps.
fn find_all(haystack: &str, needle: &str, from: usize) -> Vec<usize> {
    let mut matches = Vec::new();
    let mut pos = from;
    while let Some(rel) = haystack[pos..].find(needle) {
        let at = pos + rel;
        matches.push(at);
        // Advance one character so overlapping matches are still seen.
        match haystack[at..].chars().next() {
            Some(c) => pos = at + c.len_utf8(),
            None => break,
        }
    }
    matches
}

/// Conflicting byte ranges, if any two match spans overlap.
fn overlapping(matches: &[usize], len: usize) -> Option<Vec<(usize, usize)>> {
    for pair in matches.windows(2) {
        if pair[0] + len > pair[1] {
            return Some(vec![(pair[0], pair[0] + len), (pair[1], pair[1] + len)]);
        }
    }
    None
}

/// 1-based line number containing byte `offset`.
fn line_at(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, SafeRoot) {
        let temp = tempfile::tempdir().expect("tempdir");
        let safe = SafeRoot::new(temp.path()).expect("safe root");
        (temp, safe)
    }

    fn request(path: &str, contents: &str, mode: EditMode) -> EditRequest {
        EditRequest {
            path: path.to_string(),
            mode,
            expected_sha256: sha256_hex(contents.as_bytes()),
            anchor: None,
            anchor_after: None,
            content: String::new(),
            expected_occurrences: 1,
            search_offset: 0,
        }
    }

    #[test]
    fn append_adds_at_eof() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "a\nb\n").expect("seed");
        let mut req = request("f", "a\nb\n", EditMode::Append);
        req.content = "c\n".to_string();
        let outcome = apply_edit(&safe, &[], &req).expect("edit");
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "a\nb\nc\n"
        );
        assert_eq!(outcome.first_line, 3);
        assert_eq!(outcome.last_line, 3);
        assert_eq!(outcome.after_bytes, 6);
    }

    #[test]
    fn insert_after_anchor() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "fn main() {\n}\n").expect("seed");
        let mut req = request("f", "fn main() {\n}\n", EditMode::InsertAfter);
        req.anchor = Some("fn main() {\n".to_string());
        req.content = "    run();\n".to_string();
        let outcome = apply_edit(&safe, &[], &req).expect("edit");
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "fn main() {\n    run();\n}\n"
        );
        assert_eq!(outcome.first_line, 2);
        assert_eq!(outcome.last_line, 2);
    }

    #[test]
    fn anchor_replace_between_anchors() {
        let (temp, safe) = root();
        let before = "start\nold body\nend\n";
        fs::write(temp.path().join("f"), before).expect("seed");
        let mut req = request("f", before, EditMode::AnchorReplace);
        req.anchor = Some("start\n".to_string());
        req.anchor_after = Some("end\n".to_string());
        req.content = "new body\n".to_string();
        apply_edit(&safe, &[], &req).expect("edit");
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "start\nnew body\nend\n"
        );
    }

    #[test]
    fn anchor_replace_to_eof() {
        let (temp, safe) = root();
        let before = "keep\nrest goes\n";
        fs::write(temp.path().join("f"), before).expect("seed");
        let mut req = request("f", before, EditMode::AnchorReplace);
        req.anchor = Some("keep\n".to_string());
        req.content = "tail\n".to_string();
        apply_edit(&safe, &[], &req).expect("edit");
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "keep\ntail\n"
        );
    }

    #[test]
    fn stale_hash_fails_precondition_and_leaves_file_untouched() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "current\n").expect("seed");
        let mut req = request("f", "what the caller read earlier\n", EditMode::Append);
        req.content = "x".to_string();
        let err = apply_edit(&safe, &[], &req).expect_err("stale");
        assert_eq!(err.code(), "PRECONDITION_FAILED");
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "current\n"
        );
    }

    #[test]
    fn unexpected_occurrence_count_is_ambiguous() {
        let (temp, safe) = root();
        let before = "x marker\ny marker\n";
        fs::write(temp.path().join("f"), before).expect("seed");
        let mut req = request("f", before, EditMode::InsertAfter);
        req.anchor = Some("marker".to_string());
        req.content = "!".to_string();
        let err = apply_edit(&safe, &[], &req).expect_err("two matches");
        assert_eq!(err.code(), "AMBIGUOUS_MATCH");

        // With the count declared, the first match is edited.
        req.expected_occurrences = 2;
        apply_edit(&safe, &[], &req).expect("edit");
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "x marker!\ny marker\n"
        );
    }

    #[test]
    fn missing_anchor_is_reported() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "abc\n").expect("seed");
        let mut req = request("f", "abc\n", EditMode::InsertAfter);
        req.anchor = Some("nope".to_string());
        let err = apply_edit(&safe, &[], &req).expect_err("missing");
        assert_eq!(err.code(), "ANCHOR_NOT_FOUND");
    }

    #[test]
    fn overlapping_anchor_spans_are_rejected_with_ranges() {
        let (temp, safe) = root();
        fs::write(temp.path().join("f"), "aaaa\n").expect("seed");
        let mut req = request("f", "aaaa\n", EditMode::InsertAfter);
        req.anchor = Some("aa".to_string());
        req.expected_occurrences = 3;
        let err = apply_edit(&safe, &[], &req).expect_err("overlap");
        assert_eq!(err.code(), "OVERLAPPING_ANCHORS");
        let details = err.details();
        assert_eq!(details["ranges"][0]["start"], 0);
        assert_eq!(details["ranges"][1]["start"], 1);
    }

    #[test]
    fn search_offset_skips_earlier_matches() {
        let (temp, safe) = root();
        let before = "marker one\nmarker two\n";
        fs::write(temp.path().join("f"), before).expect("seed");
        let mut req = request("f", before, EditMode::InsertAfter);
        req.anchor = Some("marker".to_string());
        req.search_offset = 11;
        req.content = "!".to_string();
        apply_edit(&safe, &[], &req).expect("edit");
        assert_eq!(
            fs::read_to_string(temp.path().join("f")).expect("read"),
            "marker one\nmarker! two\n"
        );
    }
}
