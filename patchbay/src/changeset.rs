//! Changeset transactions over git stash shelving.
//!
//! A changeset is proposed (validated, applied once to prove it lands, then
//! shelved as a stash commit while the tree returns to clean), later applied
//! for real, tested non-destructively, rebuilt with a new diff, or closed.
//! The working tree is only ever in one of two states between operations:
//! clean, or carrying exactly the changes the caller asked to inspect.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::diff::ChangeKind;
use crate::error::KernelError;
use crate::events::{EventBus, KernelEvent};
use crate::paths::check_denylist;
use crate::store::{
    Changeset, ChangesetFile, ChangesetStatus, NewChangeset, Project, Store,
};
use crate::vcs::{Git, GitRunner};

/// How `rebuild` treats the existing changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildMode {
    /// Re-shelve a new diff under the same changeset id.
    Replace,
    /// Shelve the new diff as a child changeset; the original stays pending.
    Branch,
}

/// Outcome of a non-destructive `test`.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub changeset_id: i64,
    /// The working tree already carried exactly this changeset's diff.
    pub already_present: bool,
    /// The shelved changes were applied into the tree for inspection.
    pub applied: bool,
    pub conflict: Option<String>,
}

/// One per-file slice of a proposed diff.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DiffEntry {
    path: String,
    kind: ChangeKind,
    text: String,
}

pub struct ChangesetManager<S: Store, R: GitRunner + Clone> {
    store: Arc<S>,
    bus: EventBus,
    runner: R,
    project: Project,
    denylist_extra: Vec<String>,
}

impl<S: Store, R: GitRunner + Clone> ChangesetManager<S, R> {
    pub fn new(
        store: Arc<S>,
        bus: EventBus,
        runner: R,
        project: Project,
        denylist_extra: Vec<String>,
    ) -> Self {
        Self {
            store,
            bus,
            runner,
            project,
            denylist_extra,
        }
    }

    fn git(&self) -> Git<R> {
        Git::new(self.runner.clone(), &self.project.root)
    }

    fn emit(&self, event: KernelEvent) {
        self.bus.emit(self.project.id, &event);
    }

    /// Validate and shelve a diff as a new pending changeset.
    ///
    /// The diff is applied once against a clean tree to prove it lands, then
    /// stashed; the tree is clean again when this returns. Any apply failure
    /// aborts before anything is shelved.
    #[instrument(skip_all, fields(project = self.project.id))]
    pub fn propose(&self, summary: &str, diff: &str) -> Result<Changeset> {
        let entries = split_diff_files(diff)?;
        if entries.is_empty() {
            return Err(KernelError::MalformedDiff {
                reason: "diff touches no files".to_string(),
            }
            .into());
        }
        for entry in &entries {
            check_denylist(&entry.path, &self.denylist_extra)?;
        }

        let git = self.git();
        git.ensure_clean()?;
        let base_revision = git.head_revision()?;
        let stash_ref = self.shelve(&git, summary, diff)?;

        let changeset = self.store.create_changeset(NewChangeset {
            project_id: self.project.id,
            summary: summary.to_string(),
            base_revision,
            stash_ref: Some(stash_ref),
            parent_id: None,
        })?;
        self.store.replace_changeset_files(
            changeset.id,
            entries
                .iter()
                .map(|e| ChangesetFile {
                    changeset_id: changeset.id,
                    path: e.path.clone(),
                    kind: e.kind,
                    diff: e.text.clone(),
                })
                .collect(),
        )?;
        self.emit(KernelEvent::ChangesetProposed {
            changeset_id: changeset.id,
            summary: summary.to_string(),
            files: entries.len(),
        });
        debug!(changeset = changeset.id, files = entries.len(), "proposed");
        Ok(changeset)
    }

    /// Apply a pending changeset and commit it.
    ///
    /// A stash conflict transitions the changeset to `blocked` (keeping the
    /// stash and the recorded diff for a later rebuild) rather than erroring.
    #[instrument(skip_all, fields(changeset = id))]
    pub fn apply(&self, id: i64) -> Result<Changeset> {
        let mut changeset = self.store.get_changeset(id)?;
        self.require_status(&changeset, ChangesetStatus::Pending)?;
        let stash_ref = self.stash_ref(&changeset)?;

        let git = self.git();
        git.ensure_clean()?;

        let applied = git.stash_apply(&stash_ref)?;
        if !applied.success() {
            git.reset_hard()?;
            changeset.status = ChangesetStatus::Blocked;
            self.store.update_changeset(&changeset)?;
            let reason = applied.stderr.trim().to_string();
            warn!(changeset = id, %reason, "stash apply conflicted");
            self.emit(KernelEvent::ChangesetBlocked {
                changeset_id: id,
                reason,
            });
            return Ok(changeset);
        }

        git.add_all()?;
        git.commit_staged(&changeset.summary)?;

        // Workspace commit is the authoritative record; a failed nested
        // commit leaves the changeset applied and is reported on the event.
        let nested_commit_error = match self.commit_nested_repos(&changeset) {
            Ok(()) => None,
            Err(err) => {
                warn!(changeset = id, error = %format!("{err:#}"), "nested commit failed");
                Some(format!("{err:#}"))
            }
        };

        git.stash_drop(&stash_ref)?;
        changeset.status = ChangesetStatus::Applied;
        self.store.update_changeset(&changeset)?;
        self.emit(KernelEvent::ChangesetApplied {
            changeset_id: id,
            nested_commit_error,
        });
        Ok(changeset)
    }

    /// Bring a changeset's diff into the working tree for inspection without
    /// consuming the stash entry.
    ///
    /// A dirty tree is tolerated only when it already carries exactly this
    /// changeset's diff; anything else requires `force`, which discards it.
    #[instrument(skip_all, fields(changeset = id))]
    pub fn test(&self, id: i64, force: bool) -> Result<TestReport> {
        let changeset = self.store.get_changeset(id)?;
        let stash_ref = self.stash_ref(&changeset)?;
        let git = self.git();

        if !git.is_clean()? {
            let working = git.diff_working_tree()?;
            let shelved = git.stash_show_patch(&stash_ref)?;
            if working.trim() == shelved.trim() {
                return Ok(TestReport {
                    changeset_id: id,
                    already_present: true,
                    applied: false,
                    conflict: None,
                });
            }
            if !force {
                return Err(KernelError::Conflict {
                    reason: "working tree has unrelated changes; pass force to discard them"
                        .to_string(),
                }
                .into());
            }
            git.reset_hard()?;
        }

        let applied = git.stash_apply(&stash_ref)?;
        if applied.success() {
            Ok(TestReport {
                changeset_id: id,
                already_present: false,
                applied: true,
                conflict: None,
            })
        } else {
            git.reset_hard()?;
            Ok(TestReport {
                changeset_id: id,
                already_present: false,
                applied: false,
                conflict: Some(applied.stderr.trim().to_string()),
            })
        }
    }

    /// Shelve a new diff for an existing changeset.
    #[instrument(skip_all, fields(changeset = id, ?mode))]
    pub fn rebuild(&self, id: i64, diff: &str, mode: RebuildMode) -> Result<Changeset> {
        let mut changeset = self.store.get_changeset(id)?;
        if changeset.status == ChangesetStatus::Rebuilding {
            return Err(KernelError::NotAllowed {
                reason: format!("changeset {id} is already rebuilding"),
            }
            .into());
        }
        if changeset.status.is_terminal() {
            return Err(KernelError::NotAllowed {
                reason: format!(
                    "changeset {id} is {}; rebuild requires a live changeset",
                    status_name(changeset.status)
                ),
            }
            .into());
        }

        let entries = split_diff_files(diff)?;
        for entry in &entries {
            check_denylist(&entry.path, &self.denylist_extra)?;
        }

        match mode {
            RebuildMode::Replace => {
                let previous_status = changeset.status;
                changeset.status = ChangesetStatus::Rebuilding;
                self.store.update_changeset(&changeset)?;

                let git = self.git();
                let shelved = (|| -> Result<(String, String)> {
                    git.ensure_clean()?;
                    let base = git.head_revision()?;
                    let stash = self.shelve(&git, &changeset.summary, diff)?;
                    Ok((stash, base))
                })();
                let (new_stash, base_revision) = match shelved {
                    Ok(pair) => pair,
                    Err(err) => {
                        changeset.status = previous_status;
                        self.store.update_changeset(&changeset)?;
                        return Err(err);
                    }
                };

                // Old stash is dropped only after the replacement landed.
                if let Some(old) = changeset.stash_ref.clone() {
                    git.stash_drop(&old)?;
                }
                changeset.stash_ref = Some(new_stash);
                changeset.base_revision = base_revision;
                changeset.status = ChangesetStatus::Pending;
                changeset.close_reason = None;
                self.store.update_changeset(&changeset)?;
                self.store.replace_changeset_files(
                    id,
                    entries
                        .iter()
                        .map(|e| ChangesetFile {
                            changeset_id: id,
                            path: e.path.clone(),
                            kind: e.kind,
                            diff: e.text.clone(),
                        })
                        .collect(),
                )?;
                self.emit(KernelEvent::ChangesetRebuilt {
                    changeset_id: id,
                    branched_to: None,
                    status: ChangesetStatus::Pending,
                });
                Ok(changeset)
            }
            RebuildMode::Branch => {
                let git = self.git();
                git.ensure_clean()?;
                let base_revision = git.head_revision()?;
                let stash_ref = self.shelve(&git, &changeset.summary, diff)?;

                let child = self.store.create_changeset(NewChangeset {
                    project_id: self.project.id,
                    summary: changeset.summary.clone(),
                    base_revision,
                    stash_ref: Some(stash_ref),
                    parent_id: Some(id),
                })?;
                self.store.replace_changeset_files(
                    child.id,
                    entries
                        .iter()
                        .map(|e| ChangesetFile {
                            changeset_id: child.id,
                            path: e.path.clone(),
                            kind: e.kind,
                            diff: e.text.clone(),
                        })
                        .collect(),
                )?;
                self.emit(KernelEvent::ChangesetRebuilt {
                    changeset_id: id,
                    branched_to: Some(child.id),
                    status: changeset.status,
                });
                Ok(child)
            }
        }
    }

    /// Close any non-terminal changeset as rejected.
    ///
    /// Rows and stash history are kept; only the status changes.
    pub fn close(&self, id: i64, reason: &str) -> Result<Changeset> {
        let mut changeset = self.store.get_changeset(id)?;
        if changeset.status.is_terminal() {
            return Err(KernelError::NotAllowed {
                reason: format!(
                    "changeset {id} is already {}",
                    status_name(changeset.status)
                ),
            }
            .into());
        }
        changeset.status = ChangesetStatus::Rejected;
        changeset.close_reason = Some(reason.to_string());
        self.store.update_changeset(&changeset)?;
        self.emit(KernelEvent::ChangesetRejected {
            changeset_id: id,
            reason: reason.to_string(),
        });
        Ok(changeset)
    }

    /// Apply `diff` to the clean tree, stash the result, and return the
    /// stash commit id with the tree clean again.
    fn shelve(&self, git: &Git<R>, summary: &str, diff: &str) -> Result<String> {
        let patch_file = write_patch_file(diff)?;
        let patch_path = patch_file.path();

        let strict = git.apply_check(patch_path, false)?;
        if !strict.success() {
            let recount = git.apply_check(patch_path, true)?;
            if !recount.success() {
                return Err(KernelError::PatchApplyFailed {
                    stderr: recount.stderr.trim().to_string(),
                }
                .into());
            }
        }

        let applied = git.apply_patch(patch_path)?;
        if !applied.success() {
            git.reset_hard()?;
            return Err(KernelError::PatchApplyFailed {
                stderr: applied.stderr.trim().to_string(),
            }
            .into());
        }

        let stash_ref = git.stash_push(&format!("changeset: {summary}"))?;
        git.reset_hard()?;
        Ok(stash_ref)
    }

    /// Commit in every nested sub-repository the changeset touched.
    fn commit_nested_repos(&self, changeset: &Changeset) -> Result<()> {
        let files = self.store.changeset_files(changeset.id)?;
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        for dir in nested_repo_dirs(&self.project.root, &paths) {
            let nested = Git::new(self.runner.clone(), &dir);
            nested.add_all()?;
            nested
                .commit_staged(&changeset.summary)
                .with_context(|| format!("commit nested repository {}", dir.display()))?;
        }
        Ok(())
    }

    fn require_status(&self, changeset: &Changeset, wanted: ChangesetStatus) -> Result<()> {
        if changeset.status == wanted {
            return Ok(());
        }
        Err(KernelError::NotAllowed {
            reason: format!(
                "changeset {} is {}, expected {}",
                changeset.id,
                status_name(changeset.status),
                status_name(wanted)
            ),
        }
        .into())
    }

    fn stash_ref(&self, changeset: &Changeset) -> Result<String> {
        changeset.stash_ref.clone().ok_or_else(|| {
            KernelError::Internal {
                reason: format!("changeset {} has no shelved changes", changeset.id),
            }
            .into()
        })
    }
}

fn status_name(status: ChangesetStatus) -> &'static str {
    match status {
        ChangesetStatus::Pending => "pending",
        ChangesetStatus::Applied => "applied",
        ChangesetStatus::Blocked => "blocked",
        ChangesetStatus::Rejected => "rejected",
        ChangesetStatus::Rebuilding => "rebuilding",
    }
}

/// Patch text must live outside the working tree so shelving never captures
/// the patch file itself.
fn write_patch_file(diff: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("patchbay-")
        .suffix(".patch")
        .tempfile()
        .context("create patch temp file")?;
    file.write_all(diff.as_bytes()).context("write patch temp file")?;
    if !diff.ends_with('\n') {
        file.write_all(b"\n").context("write patch temp file")?;
    }
    file.flush().context("flush patch temp file")?;
    Ok(file)
}

/// Split a git-style diff into per-file slices with their change kind.
fn split_diff_files(diff: &str) -> Result<Vec<DiffEntry>, KernelError> {
    let mut entries: Vec<DiffEntry> = Vec::new();
    let mut current: Option<(String, String, Vec<&str>)> = None;

    let flush = |current: &mut Option<(String, String, Vec<&str>)>,
                 entries: &mut Vec<DiffEntry>| {
        if let Some((a_path, b_path, lines)) = current.take() {
            let body = lines.join("\n");
            let kind = if lines.iter().any(|l| l.starts_with("new file mode")) {
                ChangeKind::Create
            } else if lines.iter().any(|l| l.starts_with("deleted file mode")) {
                ChangeKind::Delete
            } else {
                ChangeKind::Update
            };
            let path = if kind == ChangeKind::Delete { a_path } else { b_path };
            entries.push(DiffEntry {
                path,
                kind,
                text: format!("{body}\n"),
            });
        }
    };

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            flush(&mut current, &mut entries);
            let (a_path, b_path) = parse_git_header(rest)?;
            current = Some((a_path, b_path, vec![line]));
        } else if let Some((_, _, lines)) = current.as_mut() {
            lines.push(line);
        } else if !line.trim().is_empty() {
            // Headerless unified diff: fall back to ---/+++ pairs.
            return split_bare_unified(diff);
        }
    }
    flush(&mut current, &mut entries);
    Ok(entries)
}

fn parse_git_header(rest: &str) -> Result<(String, String), KernelError> {
    let malformed = || KernelError::MalformedDiff {
        reason: format!("unparseable diff --git header: {rest}"),
    };
    let split = rest.find(" b/").ok_or_else(malformed)?;
    let a_path = rest[..split].strip_prefix("a/").ok_or_else(malformed)?;
    let b_path = &rest[split + 3..];
    if a_path.is_empty() || b_path.is_empty() {
        return Err(malformed());
    }
    Ok((a_path.to_string(), b_path.to_string()))
}

fn split_bare_unified(diff: &str) -> Result<Vec<DiffEntry>, KernelError> {
    let mut entries: Vec<DiffEntry> = Vec::new();
    let mut current: Option<(String, ChangeKind, Vec<&str>)> = None;

    let lines: Vec<&str> = diff.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some(old) = line.strip_prefix("--- ") {
            let Some(new) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ ")) else {
                return Err(KernelError::MalformedDiff {
                    reason: format!("'{line}' not followed by a +++ header"),
                });
            };
            if let Some((path, kind, body)) = current.take() {
                entries.push(DiffEntry {
                    path,
                    kind,
                    text: format!("{}\n", body.join("\n")),
                });
            }
            let (path, kind) = match (strip_diff_path(old), strip_diff_path(new)) {
                (None, Some(created)) => (created, ChangeKind::Create),
                (Some(deleted), None) => (deleted, ChangeKind::Delete),
                (Some(_), Some(updated)) => (updated, ChangeKind::Update),
                (None, None) => {
                    return Err(KernelError::MalformedDiff {
                        reason: "both sides of a file header are /dev/null".to_string(),
                    });
                }
            };
            current = Some((path, kind, vec![lines[i], lines[i + 1]]));
            i += 2;
            continue;
        }
        match current.as_mut() {
            Some((_, _, body)) => body.push(line),
            None if line.trim().is_empty() => {}
            None => {
                return Err(KernelError::MalformedDiff {
                    reason: format!("content before first file header: {line}"),
                });
            }
        }
        i += 1;
    }
    if let Some((path, kind, body)) = current.take() {
        entries.push(DiffEntry {
            path,
            kind,
            text: format!("{}\n", body.join("\n")),
        });
    }
    Ok(entries)
}

fn strip_diff_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw == "/dev/null" {
        return None;
    }
    let trimmed = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(trimmed.to_string())
}

/// Directories under `root` that are themselves git repositories and contain
/// at least one of the touched paths.
fn nested_repo_dirs(root: &str, paths: &[&str]) -> Vec<PathBuf> {
    let root = PathBuf::from(root);
    let mut dirs: Vec<PathBuf> = Vec::new();
    for path in paths {
        let mut ancestor = std::path::Path::new(path).parent();
        while let Some(dir) = ancestor {
            if dir.as_os_str().is_empty() {
                break;
            }
            let candidate = root.join(dir);
            if candidate.join(".git").exists() {
                if !dirs.contains(&candidate) {
                    dirs.push(candidate);
                }
                break;
            }
            ancestor = dir.parent();
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::MemoryStore;
    use crate::vcs::VcsOutput;
    use std::path::Path;

    /// Runner for tests that must not reach git at all.
    #[derive(Clone)]
    struct NoGit;

    impl GitRunner for NoGit {
        fn run(&self, args: &[&str], _cwd: &Path) -> Result<VcsOutput> {
            Err(anyhow::anyhow!("unexpected git call: {}", args.join(" ")))
        }
    }

    fn manager(store: Arc<MemoryStore>) -> (ChangesetManager<MemoryStore, NoGit>, Project) {
        let project = store.create_project("demo", "/tmp/demo").expect("project");
        let manager = ChangesetManager::new(
            store,
            EventBus::new(),
            NoGit,
            project.clone(),
            Vec::new(),
        );
        (manager, project)
    }

    fn seeded_changeset(store: &MemoryStore, project_id: i64) -> Changeset {
        store
            .create_changeset(NewChangeset {
                project_id,
                summary: "seed".to_string(),
                base_revision: "r0".to_string(),
                stash_ref: Some("stash0".to_string()),
                parent_id: None,
            })
            .expect("changeset")
    }

    #[test]
    fn splits_git_style_diff_per_file() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n\
                    --- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-a\n+b\n\
                    diff --git a/new.txt b/new.txt\n\
                    new file mode 100644\n\
                    --- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hello\n";
        let entries = split_diff_files(diff).expect("split");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "src/lib.rs");
        assert_eq!(entries[0].kind, ChangeKind::Update);
        assert_eq!(entries[1].path, "new.txt");
        assert_eq!(entries[1].kind, ChangeKind::Create);
        assert!(entries[1].text.starts_with("diff --git a/new.txt"));
    }

    #[test]
    fn splits_bare_unified_diff() {
        let diff = "--- a/x.txt\n+++ b/x.txt\n@@ -1 +1 @@\n-a\n+b\n\
                    --- a/gone.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n";
        let entries = split_diff_files(diff).expect("split");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ChangeKind::Update);
        assert_eq!(entries[1].path, "gone.txt");
        assert_eq!(entries[1].kind, ChangeKind::Delete);
    }

    #[test]
    fn propose_rejects_denylisted_paths_before_touching_git() {
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = manager(store);
        let diff = "diff --git a/.env b/.env\n--- a/.env\n+++ b/.env\n@@ -1 +1 @@\n-a\n+b\n";
        let err = manager.propose("leak", diff).expect_err("denied");
        assert_eq!(
            KernelError::from_anyhow(err).code(),
            "DENYLIST_PATH"
        );
    }

    #[test]
    fn close_rejects_terminal_changesets_without_git() {
        let store = Arc::new(MemoryStore::new());
        let (manager, project) = manager(Arc::clone(&store));
        let changeset = seeded_changeset(&store, project.id);

        let closed = manager.close(changeset.id, "superseded").expect("close");
        assert_eq!(closed.status, ChangesetStatus::Rejected);
        assert_eq!(closed.close_reason.as_deref(), Some("superseded"));

        let err = manager.close(changeset.id, "again").expect_err("terminal");
        assert_eq!(KernelError::from_anyhow(err).code(), "NOT_ALLOWED");
    }

    #[test]
    fn apply_requires_pending_status() {
        let store = Arc::new(MemoryStore::new());
        let (manager, project) = manager(Arc::clone(&store));
        let mut changeset = seeded_changeset(&store, project.id);
        changeset.status = ChangesetStatus::Applied;
        store.update_changeset(&changeset).expect("update");

        let err = manager.apply(changeset.id).expect_err("not pending");
        assert_eq!(KernelError::from_anyhow(err).code(), "NOT_ALLOWED");
    }

    #[test]
    fn rebuild_rejects_in_flight_rebuild() {
        let store = Arc::new(MemoryStore::new());
        let (manager, project) = manager(Arc::clone(&store));
        let mut changeset = seeded_changeset(&store, project.id);
        changeset.status = ChangesetStatus::Rebuilding;
        store.update_changeset(&changeset).expect("update");

        let err = manager
            .rebuild(changeset.id, "", RebuildMode::Replace)
            .expect_err("in flight");
        assert_eq!(KernelError::from_anyhow(err).code(), "NOT_ALLOWED");
    }

    #[test]
    fn nested_repo_detection_picks_deepest_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("vendor-lib/.git")).expect("mkdir");
        std::fs::create_dir_all(temp.path().join("vendor-lib/src")).expect("mkdir");

        let root = temp.path().to_string_lossy().to_string();
        let dirs = nested_repo_dirs(&root, &["vendor-lib/src/lib.rs", "README.md"]);
        assert_eq!(dirs, vec![temp.path().join("vendor-lib")]);
    }
}
