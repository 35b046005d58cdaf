//! Closed error taxonomy shared by every kernel component.
//!
//! Handlers and engines report failures as [`KernelError`] variants rather
//! than free-form strings. Each variant maps to a stable wire code so both
//! the agent and any UI can render failures uniformly; the enum itself stays
//! typed so callers never match on strings.

use serde_json::{Value, json};
use thiserror::Error;

/// Result alias for operations whose failures are part of the taxonomy.
pub type KernelResult<T> = Result<T, KernelError>;

/// Every failure the kernel can report across the tool boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    // Path safety
    #[error("absolute paths are not allowed: {path}")]
    PathAbsolute { path: String },
    #[error("path traversal is not allowed: {path}")]
    PathTraversal { path: String },
    #[error("path resolves outside the allowed root: {path}")]
    PathOutsideRoot { path: String },
    #[error("symlinked ancestor escapes the allowed root: {path}")]
    PathSymlinkEscape { path: String },
    #[error("allowed root does not exist: {path}")]
    PathAncestorMissing { path: String },
    #[error("path is denylisted: {path}")]
    DenylistPath { path: String },

    // Patch application
    #[error("malformed diff: {reason}")]
    MalformedDiff { reason: String },
    #[error("malformed hunk header: {header}")]
    MalformedHunkHeader { header: String },
    #[error("malformed hunk line: {line}")]
    MalformedHunkLine { line: String },
    #[error("hunk did not match file content: {reason}")]
    HunkFailed { reason: String },
    #[error("hunk start is out of bounds: {reason}")]
    HunkOutOfBounds { reason: String },
    #[error("ambiguous match: {reason}")]
    AmbiguousMatch { reason: String },
    #[error("anchor matches overlap")]
    OverlappingAnchors { ranges: Vec<(usize, usize)> },
    #[error("anchor not found: {anchor}")]
    AnchorNotFound { anchor: String },
    #[error("file already exists: {path}")]
    CreateButExists { path: String },
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    #[error("deletions are not supported by this engine")]
    DeleteNotSupported,
    #[error("renames are not supported")]
    RenameNotSupported,
    #[error("binary patches are not supported")]
    BinaryPatchNotSupported,

    // Transactional
    #[error("patch apply failed: {stderr}")]
    PatchApplyFailed { stderr: String },
    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String },
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    // Generic
    #[error("io error: {reason}")]
    Io { reason: String },
    #[error("too large: {reason}")]
    TooLarge { reason: String },
    #[error("internal error: {reason}")]
    Internal { reason: String },
    #[error("invalid arguments: {reason}")]
    InvalidArgs { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },
    #[error("not allowed: {reason}")]
    NotAllowed { reason: String },
}

impl KernelError {
    /// Stable wire code for this error, serialized as a string for
    /// compatibility with the JSON tool-result shape.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathAbsolute { .. } => "PATH_ABSOLUTE",
            Self::PathTraversal { .. } => "PATH_TRAVERSAL",
            Self::PathOutsideRoot { .. } => "PATH_OUTSIDE_ROOT",
            Self::PathSymlinkEscape { .. } => "PATH_SYMLINK_ESCAPE",
            Self::PathAncestorMissing { .. } => "PATH_ANCESTOR_MISSING",
            Self::DenylistPath { .. } => "DENYLIST_PATH",
            Self::MalformedDiff { .. } => "MALFORMED_DIFF",
            Self::MalformedHunkHeader { .. } => "MALFORMED_HUNK_HEADER",
            Self::MalformedHunkLine { .. } => "MALFORMED_HUNK_LINE",
            Self::HunkFailed { .. } => "HUNK_FAILED",
            Self::HunkOutOfBounds { .. } => "HUNK_OUT_OF_BOUNDS",
            Self::AmbiguousMatch { .. } => "AMBIGUOUS_MATCH",
            Self::OverlappingAnchors { .. } => "OVERLAPPING_ANCHORS",
            Self::AnchorNotFound { .. } => "ANCHOR_NOT_FOUND",
            Self::CreateButExists { .. } => "CREATE_BUT_EXISTS",
            Self::FileNotFound { .. } => "FILE_NOT_FOUND",
            Self::DeleteNotSupported => "DELETE_NOT_SUPPORTED",
            Self::RenameNotSupported => "RENAME_NOT_SUPPORTED",
            Self::BinaryPatchNotSupported => "BINARY_PATCH_NOT_SUPPORTED",
            Self::PatchApplyFailed { .. } => "PATCH_APPLY_FAILED",
            Self::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            Self::Conflict { .. } => "CONFLICT",
            Self::Io { .. } => "IO_ERROR",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::Internal { .. } => "INTERNAL",
            Self::InvalidArgs { .. } => "INVALID_ARGS",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::NotAllowed { .. } => "NOT_ALLOWED",
        }
    }

    /// Structured details for diagnosis, beyond the human-readable message.
    pub fn details(&self) -> Value {
        match self {
            Self::OverlappingAnchors { ranges } => {
                let ranges: Vec<Value> = ranges
                    .iter()
                    .map(|(start, end)| json!({ "start": start, "end": end }))
                    .collect();
                json!({ "ranges": ranges })
            }
            Self::PatchApplyFailed { stderr } => json!({ "stderr": stderr }),
            _ => Value::Null,
        }
    }

    /// Wire shape for the error half of a tool result.
    pub fn to_json(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
            "details": self.details(),
        })
    }

    /// Recover a typed error from an `anyhow` chain at a handler boundary.
    ///
    /// Anything that is not a `KernelError` is an unexpected condition and
    /// surfaces as `INTERNAL`.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<KernelError>() {
            Ok(kernel) => kernel,
            Err(other) => Self::Internal {
                reason: format!("{other:#}"),
            },
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_screaming_snake() {
        let err = KernelError::PathTraversal {
            path: "../x".to_string(),
        };
        assert_eq!(err.code(), "PATH_TRAVERSAL");
    }

    #[test]
    fn to_json_has_code_message_details() {
        let err = KernelError::OverlappingAnchors {
            ranges: vec![(3, 9), (7, 12)],
        };
        let value = err.to_json();
        assert_eq!(value["code"], "OVERLAPPING_ANCHORS");
        assert_eq!(value["details"]["ranges"][1]["start"], 7);
        assert!(value["message"].as_str().expect("message").contains("overlap"));
    }

    #[test]
    fn from_anyhow_preserves_kernel_errors() {
        let err = anyhow::Error::new(KernelError::DeleteNotSupported);
        assert_eq!(KernelError::from_anyhow(err), KernelError::DeleteNotSupported);

        let err = anyhow::anyhow!("disk fell off");
        let recovered = KernelError::from_anyhow(err);
        assert_eq!(recovered.code(), "INTERNAL");
    }
}
