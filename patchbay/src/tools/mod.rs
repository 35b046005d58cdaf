//! Tool catalog exposed to the model.
//!
//! The registry is closed: every tool is registered with a JSON Schema for
//! its arguments, dispatch validates against that schema (Draft 2020-12)
//! before the handler runs, and every result crosses the boundary as
//! `{"ok": true, ...payload}` or `{"ok": false, "error": {...}}`. Handler
//! failures are data, never panics.

mod defaults;
mod patch;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use jsonschema::Draft;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::paths::SafeRoot;
use crate::vcs::{Git, GitRunner};

/// Catalog entry sent to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub args_schema: Value,
    pub returns_schema: Value,
    pub examples: Vec<Value>,
    pub tags: Vec<String>,
}

type ToolHandler = Box<dyn Fn(&ToolContext, Value) -> KernelResult<Value> + Send + Sync>;

struct RegisteredTool {
    validator: jsonschema::Validator,
    handler: ToolHandler,
}

/// Everything a handler may touch. The safe root and denylist are the only
/// paths to the filesystem; there is no ambient workdir.
pub struct ToolContext {
    root: SafeRoot,
    denylist_extra: Vec<String>,
    max_read_bytes: usize,
    max_search_results: usize,
    git: Option<Git<Arc<dyn GitRunner + Send + Sync>>>,
    history: Vec<Value>,
    stop_reason: std::cell::RefCell<Option<String>>,
}

impl ToolContext {
    /// Context with default limits and no repository attached.
    pub fn for_root(root: impl Into<PathBuf>) -> KernelResult<Self> {
        Ok(Self::new(SafeRoot::new(root)?, &KernelConfig::default()))
    }

    pub fn new(root: SafeRoot, config: &KernelConfig) -> Self {
        Self {
            root,
            denylist_extra: config.denylist_extra.clone(),
            max_read_bytes: config.max_read_bytes,
            max_search_results: config.max_search_results,
            git: None,
            history: Vec::new(),
            stop_reason: std::cell::RefCell::new(None),
        }
    }

    /// Attach a repository so `git_status` works.
    pub fn with_git(mut self, runner: Arc<dyn GitRunner + Send + Sync>) -> Self {
        let workdir = self.root.root().to_path_buf();
        self.git = Some(Git::new(runner, workdir));
        self
    }

    /// Attach prior build-loop iterations for the `loop_history` tool.
    pub fn with_history(mut self, history: Vec<Value>) -> Self {
        self.history = history;
        self
    }

    pub fn root(&self) -> &SafeRoot {
        &self.root
    }

    pub fn denylist_extra(&self) -> &[String] {
        &self.denylist_extra
    }

    pub fn max_read_bytes(&self) -> usize {
        self.max_read_bytes
    }

    pub fn max_search_results(&self) -> usize {
        self.max_search_results
    }

    pub fn git(&self) -> Option<&Git<Arc<dyn GitRunner + Send + Sync>>> {
        self.git.as_ref()
    }

    pub fn history(&self) -> &[Value] {
        &self.history
    }

    pub(crate) fn set_stop_reason(&self, reason: String) {
        *self.stop_reason.borrow_mut() = Some(reason);
    }

    /// Consume a stop request raised during the current turn, if any.
    pub fn take_stop_reason(&self) -> Option<String> {
        self.stop_reason.borrow_mut().take()
    }
}

/// Closed name → handler map with schema-validated dispatch.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    entries: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, spec: ToolSpec, handler: ToolHandler) -> Result<()> {
        if self.entries.contains_key(&spec.name) {
            bail!("tool '{}' registered twice", spec.name);
        }
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&spec.args_schema)
            .with_context(|| format!("compile args schema for tool '{}'", spec.name))?;
        self.entries.insert(
            spec.name.clone(),
            RegisteredTool { validator, handler },
        );
        self.specs.push(spec);
        Ok(())
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// Run one tool call, returning the wire-shaped result in all cases.
    pub fn dispatch(&self, name: &str, args: Value, context: &ToolContext) -> Value {
        let Some(entry) = self.entries.get(name) else {
            return error_result(&KernelError::NotFound {
                reason: format!("unknown tool '{name}'"),
            });
        };

        let violations: Vec<String> = entry
            .validator
            .iter_errors(&args)
            .map(|err| err.to_string())
            .collect();
        if !violations.is_empty() {
            return error_result(&KernelError::InvalidArgs {
                reason: format!("{name}: {}", violations.join("; ")),
            });
        }

        debug!(tool = name, "dispatching");
        match (entry.handler)(context, args) {
            Ok(payload) => ok_result(payload),
            Err(err) => error_result(&err),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn ok_result(payload: Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut result = serde_json::Map::new();
            result.insert("ok".to_string(), Value::Bool(true));
            result.extend(map);
            Value::Object(result)
        }
        other => json!({ "ok": true, "result": other }),
    }
}

fn error_result(err: &KernelError) -> Value {
    json!({ "ok": false, "error": err.to_json() })
}

/// Argument schema for an object with `properties` and `required` keys.
fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Read-only inspection plus the in-process patch tools.
pub fn default_registry() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    defaults::register_read_file(&mut registry)?;
    defaults::register_list_dir(&mut registry)?;
    defaults::register_search(&mut registry)?;
    defaults::register_git_status(&mut registry)?;
    patch::register_apply_patch(&mut registry)?;
    patch::register_edit_file(&mut registry)?;
    Ok(registry)
}

/// The default toolset plus the build-fix session extras.
pub fn fix_registry() -> Result<ToolRegistry> {
    let mut registry = default_registry()?;
    defaults::register_loop_history(&mut registry)?;
    defaults::register_stop(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tool_is_a_structured_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let context = ToolContext::for_root(temp.path()).expect("context");
        let registry = default_registry().expect("registry");

        let result = registry.dispatch("frobnicate", json!({}), &context);
        assert_eq!(result["ok"], false);
        assert_eq!(result["error"]["code"], "NOT_FOUND");
    }

    #[test]
    fn schema_violations_fail_before_the_handler_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let context = ToolContext::for_root(temp.path()).expect("context");
        let registry = default_registry().expect("registry");

        let result = registry.dispatch("read_file", json!({"paht": "x"}), &context);
        assert_eq!(result["ok"], false);
        assert_eq!(result["error"]["code"], "INVALID_ARGS");
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let mut registry = default_registry().expect("registry");
        let err = registry.register(
            ToolSpec {
                name: "read_file".to_string(),
                description: String::new(),
                args_schema: json!({"type": "object"}),
                returns_schema: json!({"type": "object"}),
                examples: Vec::new(),
                tags: Vec::new(),
            },
            Box::new(|_, _| Ok(json!({}))),
        );
        assert!(err.is_err());
    }

    #[test]
    fn object_payloads_are_flattened_under_ok() {
        let flattened = ok_result(json!({"content": "x"}));
        assert_eq!(flattened["ok"], true);
        assert_eq!(flattened["content"], "x");

        let wrapped = ok_result(json!(7));
        assert_eq!(wrapped["result"], 7);
    }
}
