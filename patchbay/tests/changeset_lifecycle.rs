//! Changeset lifecycle against a real git repository.

use std::sync::Arc;

use patchbay::changeset::{ChangesetManager, RebuildMode};
use patchbay::error::KernelError;
use patchbay::events::{EventBus, KernelEvent};
use patchbay::store::{ChangesetStatus, MemoryStore, Project, Store};
use patchbay::test_support::TestRepo;
use patchbay::vcs::SystemGit;

fn update_diff(path: &str, old: &str, new: &str) -> String {
    format!(
        "diff --git a/{path} b/{path}\n\
         --- a/{path}\n\
         +++ b/{path}\n\
         @@ -1 +1 @@\n\
         -{old}\n\
         +{new}\n"
    )
}

struct Harness {
    repo: TestRepo,
    store: Arc<MemoryStore>,
    bus: EventBus,
    project: Project,
}

impl Harness {
    fn new() -> Self {
        let repo = TestRepo::new();
        repo.write("a.txt", "one\n");
        repo.commit_all("add a.txt");
        let store = Arc::new(MemoryStore::new());
        let project = store
            .create_project("demo", &repo.root_string())
            .expect("project");
        Self {
            repo,
            store,
            bus: EventBus::new(),
            project,
        }
    }

    fn manager(&self) -> ChangesetManager<MemoryStore, SystemGit> {
        ChangesetManager::new(
            Arc::clone(&self.store),
            self.bus.clone(),
            SystemGit::default(),
            self.project.clone(),
            Vec::new(),
        )
    }

    fn stash_count(&self) -> usize {
        self.repo
            .git(&["stash", "list"])
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count()
    }
}

#[test]
fn propose_shelves_and_leaves_the_tree_clean() {
    let harness = Harness::new();
    let manager = harness.manager();
    let subscription = harness.bus.subscribe(harness.project.id);

    let changeset = manager
        .propose("flip a.txt", &update_diff("a.txt", "one", "two"))
        .expect("propose");

    assert_eq!(changeset.status, ChangesetStatus::Pending);
    assert!(changeset.stash_ref.is_some());
    assert_eq!(harness.repo.read("a.txt"), "one\n", "tree rolled back");
    assert_eq!(harness.repo.git(&["status", "--porcelain"]).trim(), "");
    assert_eq!(harness.stash_count(), 1);

    let files = harness
        .store
        .changeset_files(changeset.id)
        .expect("files");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "a.txt");

    let events = subscription.drain();
    assert!(matches!(
        events.as_slice(),
        [KernelEvent::ChangesetProposed { files: 1, .. }]
    ));
}

#[test]
fn propose_rejects_unappliable_diffs_without_shelving() {
    let harness = Harness::new();
    let manager = harness.manager();

    let err = manager
        .propose("bogus", &update_diff("a.txt", "not the content", "two"))
        .expect_err("bad context");
    assert_eq!(KernelError::from_anyhow(err).code(), "PATCH_APPLY_FAILED");
    assert_eq!(harness.stash_count(), 0);
    assert_eq!(harness.repo.git(&["status", "--porcelain"]).trim(), "");
}

#[test]
fn apply_commits_and_drops_the_stash() {
    let harness = Harness::new();
    let manager = harness.manager();

    let changeset = manager
        .propose("flip a.txt", &update_diff("a.txt", "one", "two"))
        .expect("propose");
    let applied = manager.apply(changeset.id).expect("apply");

    assert_eq!(applied.status, ChangesetStatus::Applied);
    assert_eq!(harness.repo.read("a.txt"), "two\n");
    assert_eq!(harness.stash_count(), 0);
    assert_eq!(harness.repo.git(&["status", "--porcelain"]).trim(), "");
    let log = harness.repo.git(&["log", "-1", "--format=%s"]);
    assert_eq!(log.trim(), "flip a.txt");
}

#[test]
fn conflicting_apply_blocks_and_keeps_the_stash() {
    let harness = Harness::new();
    let manager = harness.manager();
    let subscription = harness.bus.subscribe(harness.project.id);

    let changeset = manager
        .propose("flip a.txt", &update_diff("a.txt", "one", "two"))
        .expect("propose");

    // Move the file out from under the shelved change.
    harness.repo.write("a.txt", "three\n");
    harness.repo.commit_all("diverge");

    let blocked = manager.apply(changeset.id).expect("apply returns status");
    assert_eq!(blocked.status, ChangesetStatus::Blocked);
    assert_eq!(harness.repo.read("a.txt"), "three\n", "tree reset");
    assert_eq!(harness.repo.git(&["status", "--porcelain"]).trim(), "");
    assert_eq!(harness.stash_count(), 1, "stash kept for rebuild");
    assert!(
        !harness
            .store
            .changeset_files(changeset.id)
            .expect("files")
            .is_empty(),
        "diff rows kept"
    );

    let events = subscription.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, KernelEvent::ChangesetBlocked { .. })));
}

#[test]
fn test_applies_non_destructively_and_detects_reapplication() {
    let harness = Harness::new();
    let manager = harness.manager();

    let changeset = manager
        .propose("flip a.txt", &update_diff("a.txt", "one", "two"))
        .expect("propose");

    let report = manager.test(changeset.id, false).expect("first test");
    assert!(report.applied);
    assert!(!report.already_present);
    assert_eq!(harness.repo.read("a.txt"), "two\n");
    assert_eq!(harness.stash_count(), 1, "stash not consumed");

    // The tree now carries exactly this changeset; a second test says so.
    let again = manager.test(changeset.id, false).expect("second test");
    assert!(again.already_present);

    // Unrelated tracked changes require force.
    harness.repo.write("README.md", "scribbles\n");
    let err = manager.test(changeset.id, false).expect_err("dirty");
    assert_eq!(KernelError::from_anyhow(err).code(), "CONFLICT");

    let forced = manager.test(changeset.id, true).expect("forced");
    assert!(forced.applied);
    assert_eq!(harness.repo.read("README.md"), "seed\n", "dirt discarded");
}

#[test]
fn rebuild_replace_swaps_the_shelved_diff() {
    let harness = Harness::new();
    let manager = harness.manager();

    let changeset = manager
        .propose("flip a.txt", &update_diff("a.txt", "one", "two"))
        .expect("propose");
    let old_stash = changeset.stash_ref.clone().expect("stash");

    let rebuilt = manager
        .rebuild(
            changeset.id,
            &update_diff("a.txt", "one", "zwei"),
            RebuildMode::Replace,
        )
        .expect("rebuild");

    assert_eq!(rebuilt.id, changeset.id);
    assert_eq!(rebuilt.status, ChangesetStatus::Pending);
    assert_ne!(rebuilt.stash_ref.as_deref(), Some(old_stash.as_str()));
    assert_eq!(harness.stash_count(), 1, "old stash dropped");

    manager.apply(changeset.id).expect("apply rebuilt");
    assert_eq!(harness.repo.read("a.txt"), "zwei\n");
}

#[test]
fn rebuild_branch_creates_a_child_and_keeps_the_original() {
    let harness = Harness::new();
    let manager = harness.manager();

    let changeset = manager
        .propose("flip a.txt", &update_diff("a.txt", "one", "two"))
        .expect("propose");
    let child = manager
        .rebuild(
            changeset.id,
            &update_diff("a.txt", "one", "deux"),
            RebuildMode::Branch,
        )
        .expect("branch");

    assert_ne!(child.id, changeset.id);
    assert_eq!(child.parent_id, Some(changeset.id));
    assert_eq!(child.status, ChangesetStatus::Pending);
    assert_eq!(
        harness
            .store
            .get_changeset(changeset.id)
            .expect("original")
            .status,
        ChangesetStatus::Pending
    );
    assert_eq!(harness.stash_count(), 2);
}

#[test]
fn close_rejects_but_never_deletes() {
    let harness = Harness::new();
    let manager = harness.manager();

    let changeset = manager
        .propose("flip a.txt", &update_diff("a.txt", "one", "two"))
        .expect("propose");
    let closed = manager.close(changeset.id, "superseded").expect("close");

    assert_eq!(closed.status, ChangesetStatus::Rejected);
    assert_eq!(closed.close_reason.as_deref(), Some("superseded"));
    assert_eq!(harness.stash_count(), 1, "stash history kept");
    assert!(!harness
        .store
        .changeset_files(changeset.id)
        .expect("files")
        .is_empty());
}
