//! Read-only inspection tools plus the build-fix session extras.

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};

use crate::error::{KernelError, KernelResult};
use crate::paths::{SafeRoot, check_denylist};
use crate::tools::{ToolContext, ToolRegistry, ToolSpec, object_schema};

fn require_str<'a>(args: &'a Value, key: &str) -> KernelResult<&'a str> {
    args[key].as_str().ok_or_else(|| KernelError::InvalidArgs {
        reason: format!("'{key}' must be a string"),
    })
}

fn optional_usize(args: &Value, key: &str) -> Option<usize> {
    args[key].as_u64().map(|v| v as usize)
}

pub(super) fn register_read_file(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read a UTF-8 file inside the project root, optionally a line range."
                .to_string(),
            args_schema: object_schema(
                json!({
                    "path": { "type": "string" },
                    "offset": { "type": "integer", "minimum": 0 },
                    "limit": { "type": "integer", "minimum": 1 },
                }),
                &["path"],
            ),
            returns_schema: object_schema(
                json!({
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                    "total_lines": { "type": "integer" },
                }),
                &["path", "content", "total_lines"],
            ),
            examples: vec![json!({"path": "src/main.rs", "offset": 0, "limit": 100})],
            tags: vec!["inspect".to_string()],
        },
        Box::new(|context, args| {
            let path = require_str(&args, "path")?;
            check_denylist(path, context.denylist_extra())?;
            let target = context.root().resolve(path)?;
            if !target.is_file() {
                return Err(KernelError::FileNotFound {
                    path: path.to_string(),
                });
            }
            let size = target
                .metadata()
                .map(|m| m.len() as usize)
                .unwrap_or(usize::MAX);
            if size > context.max_read_bytes() {
                return Err(KernelError::TooLarge {
                    reason: format!(
                        "{path} is {size} bytes, limit {}",
                        context.max_read_bytes()
                    ),
                });
            }
            let text = fs::read_to_string(&target).map_err(|err| KernelError::Io {
                reason: format!("read {path}: {err}"),
            })?;

            let lines: Vec<&str> = text.lines().collect();
            let total_lines = lines.len();
            let offset = optional_usize(&args, "offset").unwrap_or(0);
            let limit = optional_usize(&args, "limit").unwrap_or(usize::MAX);
            let window: Vec<&str> =
                lines.into_iter().skip(offset).take(limit).collect();

            Ok(json!({
                "path": path,
                "content": window.join("\n"),
                "total_lines": total_lines,
            }))
        }),
    )
}

pub(super) fn register_list_dir(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolSpec {
            name: "list_dir".to_string(),
            description: "List a directory inside the project root, sorted by name.".to_string(),
            args_schema: object_schema(
                json!({ "path": { "type": "string" } }),
                &[],
            ),
            returns_schema: object_schema(
                json!({
                    "path": { "type": "string" },
                    "entries": { "type": "array" },
                }),
                &["path", "entries"],
            ),
            examples: vec![json!({"path": "src"})],
            tags: vec!["inspect".to_string()],
        },
        Box::new(|context, args| {
            let path = args["path"].as_str().unwrap_or("");
            check_denylist(path, context.denylist_extra())?;
            let target = context.root().resolve(path)?;
            if !target.is_dir() {
                return Err(KernelError::FileNotFound {
                    path: path.to_string(),
                });
            }
            let mut entries = Vec::new();
            let read = fs::read_dir(&target).map_err(|err| KernelError::Io {
                reason: format!("list {path}: {err}"),
            })?;
            for entry in read {
                let entry = entry.map_err(|err| KernelError::Io {
                    reason: format!("list {path}: {err}"),
                })?;
                let name = entry.file_name().to_string_lossy().to_string();
                // Denylisted names are invisible, not an error.
                if check_denylist(&name, context.denylist_extra()).is_err() {
                    continue;
                }
                let kind = match entry.file_type() {
                    Ok(t) if t.is_dir() => "dir",
                    Ok(t) if t.is_symlink() => "symlink",
                    Ok(t) if t.is_file() => "file",
                    _ => "other",
                };
                entries.push(json!({ "name": name, "kind": kind }));
            }
            entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
            Ok(json!({ "path": path, "entries": entries }))
        }),
    )
}

pub(super) fn register_search(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolSpec {
            name: "search".to_string(),
            description: "Search file contents under the project root with a regex.".to_string(),
            args_schema: object_schema(
                json!({
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "max_results": { "type": "integer", "minimum": 1 },
                }),
                &["pattern"],
            ),
            returns_schema: object_schema(
                json!({
                    "matches": { "type": "array" },
                    "truncated": { "type": "boolean" },
                }),
                &["matches", "truncated"],
            ),
            examples: vec![json!({"pattern": "fn main", "path": "src"})],
            tags: vec!["inspect".to_string()],
        },
        Box::new(|context, args| {
            let pattern = require_str(&args, "pattern")?;
            let regex = regex::Regex::new(pattern).map_err(|err| KernelError::InvalidArgs {
                reason: format!("bad pattern: {err}"),
            })?;
            let start = args["path"].as_str().unwrap_or("");
            check_denylist(start, context.denylist_extra())?;
            let start_dir = context.root().resolve(start)?;
            let cap = optional_usize(&args, "max_results")
                .unwrap_or(context.max_search_results())
                .min(context.max_search_results());

            let mut matches = Vec::new();
            let mut truncated = false;
            search_dir(
                &start_dir,
                context.root(),
                context.denylist_extra(),
                &regex,
                cap,
                &mut matches,
                &mut truncated,
            )?;
            Ok(json!({ "matches": matches, "truncated": truncated }))
        }),
    )
}

fn search_dir(
    dir: &Path,
    safe: &SafeRoot,
    denylist_extra: &[String],
    regex: &regex::Regex,
    cap: usize,
    matches: &mut Vec<Value>,
    truncated: &mut bool,
) -> KernelResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|err| KernelError::Io {
            reason: format!("search {}: {err}", dir.display()),
        })?
        .filter_map(std::result::Result::ok)
        .collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        if matches.len() >= cap {
            *truncated = true;
            return Ok(());
        }
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(safe.root()) else {
            continue;
        };
        let relative = relative.to_string_lossy().to_string();
        if check_denylist(&relative, denylist_extra).is_err() {
            continue;
        }
        // symlink_metadata semantics: never follows the link itself.
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            // Symlinked directories are never entered: a link out of the
            // root must not widen the search, and a link back in would make
            // the walk cycle. Symlinked files still go through the resolver.
            if !path.is_file() || safe.resolve(&relative).is_err() {
                continue;
            }
            scan_file(&path, &relative, regex, cap, matches, truncated);
        } else if file_type.is_dir() {
            search_dir(&path, safe, denylist_extra, regex, cap, matches, truncated)?;
        } else if file_type.is_file() {
            scan_file(&path, &relative, regex, cap, matches, truncated);
        }
    }
    Ok(())
}

fn scan_file(
    path: &Path,
    relative: &str,
    regex: &regex::Regex,
    cap: usize,
    matches: &mut Vec<Value>,
    truncated: &mut bool,
) {
    // Binary or non-UTF-8 files are skipped silently.
    let Ok(text) = fs::read_to_string(path) else {
        return;
    };
    for (idx, line) in text.lines().enumerate() {
        if regex.is_match(line) {
            matches.push(json!({
                "path": relative,
                "line": idx + 1,
                "text": line,
            }));
            if matches.len() >= cap {
                *truncated = true;
                return;
            }
        }
    }
}

pub(super) fn register_git_status(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolSpec {
            name: "git_status".to_string(),
            description: "Porcelain status of the project repository.".to_string(),
            args_schema: object_schema(json!({}), &[]),
            returns_schema: object_schema(
                json!({
                    "clean": { "type": "boolean" },
                    "entries": { "type": "array" },
                }),
                &["clean", "entries"],
            ),
            examples: vec![json!({})],
            tags: vec!["inspect".to_string()],
        },
        Box::new(|context, _args| {
            let Some(git) = context.git() else {
                return Err(KernelError::NotAllowed {
                    reason: "no repository attached to this session".to_string(),
                });
            };
            let entries = git
                .status_porcelain()
                .map_err(KernelError::from_anyhow)?;
            let clean = entries.is_empty();
            let entries: Vec<Value> = entries
                .into_iter()
                .map(|e| json!({ "code": e.code, "path": e.path }))
                .collect();
            Ok(json!({ "clean": clean, "entries": entries }))
        }),
    )
}

pub(super) fn register_loop_history(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolSpec {
            name: "loop_history".to_string(),
            description: "Prior iterations of the current build-fix loop.".to_string(),
            args_schema: object_schema(json!({}), &[]),
            returns_schema: object_schema(
                json!({ "iterations": { "type": "array" } }),
                &["iterations"],
            ),
            examples: vec![json!({})],
            tags: vec!["buildfix".to_string()],
        },
        Box::new(|context, _args| Ok(json!({ "iterations": context.history() }))),
    )
}

pub(super) fn register_stop(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ToolSpec {
            name: "stop".to_string(),
            description: "Halt the loop: the failure needs a human decision.".to_string(),
            args_schema: object_schema(
                json!({ "reason": { "type": "string", "minLength": 1 } }),
                &["reason"],
            ),
            returns_schema: object_schema(
                json!({ "stopped": { "type": "boolean" } }),
                &["stopped"],
            ),
            examples: vec![json!({"reason": "build needs a credential I cannot provide"})],
            tags: vec!["buildfix".to_string()],
        },
        Box::new(|context, args| {
            let reason = require_str(&args, "reason")?;
            context.set_stop_reason(reason.to_string());
            Ok(json!({ "stopped": true }))
        }),
    )
}
