//! Git adapter for kernel operations.
//!
//! The kernel enforces clean-tree preconditions and shelves changesets
//! deterministically, so we keep a small, explicit wrapper around `git`
//! subprocess calls. Every invocation goes through the narrow [`GitRunner`]
//! seam (`run(args, cwd)`) so the transactional logic can be tested against a
//! scripted implementation without a real repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::proc::{RunSpec, run};

/// Captured output of one git invocation.
#[derive(Debug, Clone)]
pub struct VcsOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl VcsOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Narrow subprocess seam for git.
pub trait GitRunner {
    fn run(&self, args: &[&str], cwd: &Path) -> Result<VcsOutput>;
}

impl GitRunner for Arc<dyn GitRunner + Send + Sync> {
    fn run(&self, args: &[&str], cwd: &Path) -> Result<VcsOutput> {
        (**self).run(args, cwd)
    }
}

/// Production runner: spawns `git` with captured stdio, never interactive.
#[derive(Debug, Clone)]
pub struct SystemGit {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Default for SystemGit {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            output_limit_bytes: 10_000_000,
        }
    }
}

impl GitRunner for SystemGit {
    fn run(&self, args: &[&str], cwd: &Path) -> Result<VcsOutput> {
        let mut spec = RunSpec::new(cwd, "git");
        spec.args = args.iter().map(|a| (*a).to_string()).collect();
        let result = run(&spec, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if result.timed_out {
            return Err(anyhow!("git {} timed out", args.join(" ")));
        }
        Ok(VcsOutput {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git<R: GitRunner> {
    runner: R,
    workdir: PathBuf,
}

impl<R: GitRunner> Git<R> {
    pub fn new(runner: R, workdir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current HEAD revision id.
    pub fn head_revision(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True when the worktree has no tracked or untracked changes.
    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// Ensure the worktree is fully clean (including untracked files).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(entries = entries.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Diff of the working tree against HEAD.
    pub fn diff_working_tree(&self) -> Result<String> {
        self.run_capture(&["diff", "HEAD"])
    }

    /// Shelve all working-tree changes (including untracked files) under a
    /// message, returning the stash commit id.
    ///
    /// The commit id is resolved immediately so the reference stays valid even
    /// after unrelated stash pushes reorder `stash@{n}`.
    #[instrument(skip_all)]
    pub fn stash_push(&self, message: &str) -> Result<String> {
        self.run_checked(&["stash", "push", "-u", "-m", message])?;
        let id = self.run_capture(&["rev-parse", "refs/stash"])?;
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(anyhow!("stash push produced no stash entry"));
        }
        debug!(stash = %id, "shelved working tree");
        Ok(id)
    }

    /// Restore a shelved change into the working tree.
    ///
    /// Returns the raw output so callers can treat a conflict as a state
    /// transition instead of a hard error.
    pub fn stash_apply(&self, stash_id: &str) -> Result<VcsOutput> {
        self.run(&["stash", "apply", stash_id])
    }

    /// Drop the shelf entry matching `stash_id`, if it still exists.
    pub fn stash_drop(&self, stash_id: &str) -> Result<()> {
        let list = self.run_capture(&["stash", "list", "--format=%H"])?;
        let index = list.lines().position(|line| line.trim() == stash_id);
        match index {
            Some(i) => {
                let slot = format!("stash@{{{i}}}");
                self.run_checked(&["stash", "drop", &slot])?;
                Ok(())
            }
            None => {
                warn!(stash = %stash_id, "stash entry already gone");
                Ok(())
            }
        }
    }

    /// Patch text a shelf entry would apply.
    pub fn stash_show_patch(&self, stash_id: &str) -> Result<String> {
        self.run_capture(&["stash", "show", "-p", stash_id])
    }

    /// Strict apply dry-run; `recount` retries with fuzzy line recounting.
    pub fn apply_check(&self, patch: &Path, recount: bool) -> Result<VcsOutput> {
        let patch = patch.display().to_string();
        if recount {
            self.run(&["apply", "--check", "--recount", &patch])
        } else {
            self.run(&["apply", "--check", &patch])
        }
    }

    /// Apply a patch file, preferring git's own 3-way merge when the patch
    /// carries index information, falling back to a plain apply.
    pub fn apply_patch(&self, patch: &Path) -> Result<VcsOutput> {
        let path = patch.display().to_string();
        let three_way = self.run(&["apply", "--3way", &path])?;
        if three_way.success() {
            return Ok(three_way);
        }
        self.run(&["apply", "--recount", &path])
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Reset the working tree to clean: discard tracked edits and remove
    /// untracked files.
    pub fn reset_hard(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard"])?;
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout)
    }

    fn run_checked(&self, args: &[&str]) -> Result<VcsOutput> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<VcsOutput> {
        self.runner.run(args, &self.workdir)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
