//! Mutating tools: batch patch application and anchored single edits.

use anyhow::Result;
use serde_json::{Value, json};

use crate::diff::anchor::{EditRequest, apply_edit};
use crate::diff::headerless::{FileOperation, apply};
use crate::error::KernelError;
use crate::tools::{ToolRegistry, ToolSpec, object_schema};

pub(super) fn register_apply_patch(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolSpec {
            name: "apply_patch".to_string(),
            description: "Apply a batch of create/update/delete operations atomically. \
                          Update hunks are located by unique context, not line numbers."
                .to_string(),
            args_schema: object_schema(
                json!({
                    "operations": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "op": {
                                    "enum": ["create_file", "update_file", "delete_file"]
                                },
                                "path": { "type": "string" },
                                "diff": { "type": "string" },
                            },
                            "required": ["op", "path"],
                            "additionalProperties": false,
                        },
                    },
                }),
                &["operations"],
            ),
            returns_schema: object_schema(
                json!({
                    "stats": { "type": "object" },
                    "files": { "type": "array" },
                }),
                &["stats", "files"],
            ),
            examples: vec![json!({
                "operations": [{
                    "op": "update_file",
                    "path": "src/lib.rs",
                    "diff": "@@\n fn answer() -> u32 {\n-    41\n+    42\n }",
                }],
            })],
            tags: vec!["mutate".to_string()],
        },
        Box::new(|context, args| {
            let operations: Vec<FileOperation> =
                serde_json::from_value(args["operations"].clone()).map_err(|err| {
                    KernelError::InvalidArgs {
                        reason: format!("operations: {err}"),
                    }
                })?;
            let report = apply(context.root(), context.denylist_extra(), &operations)?;
            serde_json::to_value(&report).map_err(|err| KernelError::Internal {
                reason: format!("serialize apply report: {err}"),
            })
        }),
    )
}

pub(super) fn register_edit_file(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolSpec {
            name: "edit_file".to_string(),
            description: "Edit one file at a literal anchor. Requires the sha256 of the \
                          file as last read; a mismatch means re-read and retry."
                .to_string(),
            args_schema: object_schema(
                json!({
                    "path": { "type": "string" },
                    "mode": { "enum": ["anchor_replace", "insert_after", "append"] },
                    "expected_sha256": {
                        "type": "string",
                        "pattern": "^[0-9a-f]{64}$",
                    },
                    "anchor": { "type": "string" },
                    "anchor_after": { "type": "string" },
                    "content": { "type": "string" },
                    "expected_occurrences": { "type": "integer", "minimum": 1 },
                    "search_offset": { "type": "integer", "minimum": 0 },
                }),
                &["path", "mode", "expected_sha256", "content"],
            ),
            returns_schema: object_schema(
                json!({
                    "path": { "type": "string" },
                    "before_sha256": { "type": "string" },
                    "after_sha256": { "type": "string" },
                    "first_line": { "type": "integer" },
                    "last_line": { "type": "integer" },
                }),
                &["path", "before_sha256", "after_sha256", "first_line", "last_line"],
            ),
            examples: vec![json!({
                "path": "src/lib.rs",
                "mode": "insert_after",
                "expected_sha256": "0".repeat(64),
                "anchor": "fn main() {\n",
                "content": "    init();\n",
            })],
            tags: vec!["mutate".to_string()],
        },
        Box::new(|context, args| {
            let request: EditRequest =
                serde_json::from_value(args).map_err(|err| KernelError::InvalidArgs {
                    reason: format!("edit_file: {err}"),
                })?;
            let outcome = apply_edit(context.root(), context.denylist_extra(), &request)?;
            serde_json::to_value(&outcome).map_err(|err| KernelError::Internal {
                reason: format!("serialize edit outcome: {err}"),
            })
        }),
    )
}
