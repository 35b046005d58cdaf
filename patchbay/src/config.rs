//! Kernel configuration stored as a TOML file next to the embedding system.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Kernel configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Extra denylist entries on top of the built-in set (directory names,
    /// file names, or `.ext` extensions).
    pub denylist_extra: Vec<String>,

    /// Wall-clock budget in seconds for a single build or git subprocess.
    pub subprocess_timeout_secs: u64,

    /// Truncate captured subprocess stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Iteration budget for a tool-calling session.
    pub session_max_iterations: u32,

    /// Iteration budget for a build-fix loop.
    pub buildfix_max_iterations: u32,

    /// Model name passed through to the chat provider.
    pub model: String,

    /// Refuse `read_file` beyond this many bytes.
    pub max_read_bytes: usize,

    /// Cap on `search` tool results per call.
    pub max_search_results: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            denylist_extra: Vec::new(),
            subprocess_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            session_max_iterations: 100,
            buildfix_max_iterations: 5,
            model: "gpt-4.1".to_string(),
            max_read_bytes: 256 * 1024,
            max_search_results: 200,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.subprocess_timeout_secs == 0 {
            return Err(anyhow!("subprocess_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.session_max_iterations == 0 {
            return Err(anyhow!("session_max_iterations must be > 0"));
        }
        if self.buildfix_max_iterations == 0 {
            return Err(anyhow!("buildfix_max_iterations must be > 0"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KernelConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
