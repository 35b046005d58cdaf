//! Persisted records for changesets and build loops.
//!
//! The kernel does not own a database; it defines the [`Store`] trait and
//! ships a thread-safe in-memory implementation used by tests and embedders
//! without a database of their own. A hosting service can back the same trait
//! with whatever persistence it already has.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::diff::ChangeKind;

fn now() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangesetStatus {
    Pending,
    Applied,
    Blocked,
    Rejected,
    Rebuilding,
}

impl ChangesetStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Running,
    Success,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    /// Absolute path of the project root on the host.
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: i64,
    pub project_id: i64,
    pub status: ChangesetStatus,
    pub summary: String,
    /// `HEAD` at propose time; staleness is detected against this.
    pub base_revision: String,
    /// Stash commit id holding the shelved changes (stable across other
    /// stash operations, unlike `stash@{n}` positions).
    pub stash_ref: Option<String>,
    /// Set on changesets created by a `branch` rebuild.
    pub parent_id: Option<i64>,
    pub close_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetFile {
    pub changeset_id: i64,
    pub path: String,
    pub kind: ChangeKind,
    /// The per-file slice of the proposed diff.
    pub diff: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLoop {
    pub id: i64,
    pub project_id: i64,
    pub status: LoopStatus,
    pub max_iterations: usize,
    pub stop_reason: Option<String>,
    pub model: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIteration {
    pub loop_id: i64,
    /// 1-based iteration number, append-only.
    pub iteration: usize,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Final assistant text from the fix session, if one ran.
    pub assistant_summary: Option<String>,
    pub created_at: String,
}

/// Persistence seam for changesets and build loops.
///
/// Iterations are append-only: a store must refuse gaps and duplicates so the
/// loop history stays an honest record.
pub trait Store: Send + Sync {
    fn create_project(&self, name: &str, root: &str) -> Result<Project>;
    fn get_project(&self, id: i64) -> Result<Project>;

    fn create_changeset(&self, changeset: NewChangeset) -> Result<Changeset>;
    fn get_changeset(&self, id: i64) -> Result<Changeset>;
    fn list_changesets(&self, project_id: i64) -> Result<Vec<Changeset>>;
    fn update_changeset(&self, changeset: &Changeset) -> Result<()>;
    fn changeset_files(&self, changeset_id: i64) -> Result<Vec<ChangesetFile>>;
    fn replace_changeset_files(&self, changeset_id: i64, files: Vec<ChangesetFile>)
    -> Result<()>;

    fn create_loop(&self, project_id: i64, max_iterations: usize, model: &str)
    -> Result<BuildLoop>;
    fn get_loop(&self, id: i64) -> Result<BuildLoop>;
    fn update_loop(&self, build_loop: &BuildLoop) -> Result<()>;
    fn append_iteration(&self, iteration: BuildIteration) -> Result<()>;
    fn loop_iterations(&self, loop_id: i64) -> Result<Vec<BuildIteration>>;
}

/// Fields the caller supplies when proposing; ids and timestamps are the
/// store's business.
#[derive(Debug, Clone)]
pub struct NewChangeset {
    pub project_id: i64,
    pub summary: String,
    pub base_revision: String,
    pub stash_ref: Option<String>,
    pub parent_id: Option<i64>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    projects: HashMap<i64, Project>,
    changesets: HashMap<i64, Changeset>,
    changeset_files: HashMap<i64, Vec<ChangesetFile>>,
    loops: HashMap<i64, BuildLoop>,
    iterations: HashMap<i64, Vec<BuildIteration>>,
}

impl MemoryInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory [`Store`], suitable for tests and single-process CLI use.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned store means a panic mid-mutation elsewhere; the data is
        // still the best record we have.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn create_project(&self, name: &str, root: &str) -> Result<Project> {
        let mut inner = self.lock();
        let project = Project {
            id: inner.next_id(),
            name: name.to_string(),
            root: root.to_string(),
        };
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    fn get_project(&self, id: i64) -> Result<Project> {
        self.lock()
            .projects
            .get(&id)
            .cloned()
            .with_context(|| format!("project {id} not found"))
    }

    fn create_changeset(&self, changeset: NewChangeset) -> Result<Changeset> {
        let mut inner = self.lock();
        if !inner.projects.contains_key(&changeset.project_id) {
            bail!("project {} not found", changeset.project_id);
        }
        let timestamp = now();
        let record = Changeset {
            id: inner.next_id(),
            project_id: changeset.project_id,
            status: ChangesetStatus::Pending,
            summary: changeset.summary,
            base_revision: changeset.base_revision,
            stash_ref: changeset.stash_ref,
            parent_id: changeset.parent_id,
            close_reason: None,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        };
        inner.changesets.insert(record.id, record.clone());
        inner.changeset_files.insert(record.id, Vec::new());
        Ok(record)
    }

    fn get_changeset(&self, id: i64) -> Result<Changeset> {
        self.lock()
            .changesets
            .get(&id)
            .cloned()
            .with_context(|| format!("changeset {id} not found"))
    }

    fn list_changesets(&self, project_id: i64) -> Result<Vec<Changeset>> {
        let inner = self.lock();
        let mut changesets: Vec<Changeset> = inner
            .changesets
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        changesets.sort_by_key(|c| c.id);
        Ok(changesets)
    }

    fn update_changeset(&self, changeset: &Changeset) -> Result<()> {
        let mut inner = self.lock();
        if !inner.changesets.contains_key(&changeset.id) {
            bail!("changeset {} not found", changeset.id);
        }
        let mut updated = changeset.clone();
        updated.updated_at = now();
        inner.changesets.insert(updated.id, updated);
        Ok(())
    }

    fn changeset_files(&self, changeset_id: i64) -> Result<Vec<ChangesetFile>> {
        self.lock()
            .changeset_files
            .get(&changeset_id)
            .cloned()
            .with_context(|| format!("changeset {changeset_id} not found"))
    }

    fn replace_changeset_files(
        &self,
        changeset_id: i64,
        files: Vec<ChangesetFile>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if !inner.changesets.contains_key(&changeset_id) {
            bail!("changeset {changeset_id} not found");
        }
        inner.changeset_files.insert(changeset_id, files);
        Ok(())
    }

    fn create_loop(
        &self,
        project_id: i64,
        max_iterations: usize,
        model: &str,
    ) -> Result<BuildLoop> {
        let mut inner = self.lock();
        if !inner.projects.contains_key(&project_id) {
            bail!("project {project_id} not found");
        }
        let timestamp = now();
        let build_loop = BuildLoop {
            id: inner.next_id(),
            project_id,
            status: LoopStatus::Running,
            max_iterations,
            stop_reason: None,
            model: model.to_string(),
            created_at: timestamp.clone(),
            updated_at: timestamp,
        };
        inner.loops.insert(build_loop.id, build_loop.clone());
        inner.iterations.insert(build_loop.id, Vec::new());
        Ok(build_loop)
    }

    fn get_loop(&self, id: i64) -> Result<BuildLoop> {
        self.lock()
            .loops
            .get(&id)
            .cloned()
            .with_context(|| format!("loop {id} not found"))
    }

    fn update_loop(&self, build_loop: &BuildLoop) -> Result<()> {
        let mut inner = self.lock();
        if !inner.loops.contains_key(&build_loop.id) {
            bail!("loop {} not found", build_loop.id);
        }
        let mut updated = build_loop.clone();
        updated.updated_at = now();
        inner.loops.insert(updated.id, updated);
        Ok(())
    }

    fn append_iteration(&self, iteration: BuildIteration) -> Result<()> {
        let mut inner = self.lock();
        let Some(existing) = inner.iterations.get_mut(&iteration.loop_id) else {
            bail!("loop {} not found", iteration.loop_id);
        };
        let expected = existing.len() + 1;
        if iteration.iteration != expected {
            bail!(
                "iteration {} out of order for loop {} (expected {expected})",
                iteration.iteration,
                iteration.loop_id
            );
        }
        existing.push(iteration);
        Ok(())
    }

    fn loop_iterations(&self, loop_id: i64) -> Result<Vec<BuildIteration>> {
        self.lock()
            .iterations
            .get(&loop_id)
            .cloned()
            .with_context(|| format!("loop {loop_id} not found"))
    }
}
