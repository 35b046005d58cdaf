//! Cross-engine integration: every engine against a real directory tree.

use std::fs;

use patchbay::diff::anchor::{EditMode, EditRequest, apply_edit};
use patchbay::diff::headerless::{self, FileOperation};
use patchbay::diff::{sha256_hex, unified};
use patchbay::paths::SafeRoot;

fn workspace(files: &[(&str, &str)]) -> (tempfile::TempDir, SafeRoot) {
    let temp = tempfile::tempdir().expect("tempdir");
    for (path, contents) in files {
        let full = temp.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(full, contents).expect("seed");
    }
    let safe = SafeRoot::new(temp.path()).expect("safe root");
    (temp, safe)
}

#[test]
fn unified_patch_creates_and_updates_in_one_batch() {
    let (temp, safe) = workspace(&[("src/lib.rs", "pub fn one() {}\n")]);
    let patch = unified::parse(
        "--- a/src/lib.rs\n\
         +++ b/src/lib.rs\n\
         @@ -1 +1,2 @@\n \
         pub fn one() {}\n\
         +pub fn two() {}\n\
         --- /dev/null\n\
         +++ b/src/extra.rs\n\
         @@ -0,0 +1 @@\n\
         +pub fn three() {}\n",
    )
    .expect("parse");

    let report = unified::apply(&safe, &[], &patch).expect("apply");
    assert_eq!(report.stats.insertions, 2);
    assert_eq!(report.stats.deletions, 0);
    assert_eq!(report.files.len(), 2);
    assert_eq!(
        fs::read_to_string(temp.path().join("src/lib.rs")).expect("read"),
        "pub fn one() {}\npub fn two() {}\n"
    );
    assert_eq!(
        fs::read_to_string(temp.path().join("src/extra.rs")).expect("read"),
        "pub fn three() {}\n"
    );
}

#[test]
fn failing_second_file_leaves_first_untouched() {
    let (temp, safe) = workspace(&[("a.txt", "alpha\n"), ("b.txt", "beta\n")]);
    let patch = unified::parse(
        "--- a/a.txt\n\
         +++ b/a.txt\n\
         @@ -1 +1 @@\n\
         -alpha\n\
         +ALPHA\n\
         --- a/b.txt\n\
         +++ b/b.txt\n\
         @@ -1 +1 @@\n\
         -wrong context\n\
         +BETA\n",
    )
    .expect("parse");

    let err = unified::apply(&safe, &[], &patch).expect_err("second file mismatches");
    assert_eq!(err.code(), "HUNK_FAILED");
    assert_eq!(
        fs::read_to_string(temp.path().join("a.txt")).expect("read"),
        "alpha\n"
    );
    assert_eq!(
        fs::read_to_string(temp.path().join("b.txt")).expect("read"),
        "beta\n"
    );
    let stray: Vec<_> = fs::read_dir(temp.path())
        .expect("read dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
        .filter(|name| name.contains("tmp"))
        .collect();
    assert!(stray.is_empty(), "staged temp files leaked: {stray:?}");
}

#[test]
fn reversing_an_update_patch_restores_the_original() {
    let original = "one\ntwo\nthree\n";
    let (temp, safe) = workspace(&[("notes.txt", original)]);
    let patch = unified::parse(
        "--- a/notes.txt\n\
         +++ b/notes.txt\n\
         @@ -1,3 +1,3 @@\n \
         one\n\
         -two\n\
         +TWO\n \
         three\n",
    )
    .expect("parse");

    unified::apply(&safe, &[], &patch).expect("forward");
    assert_eq!(
        fs::read_to_string(temp.path().join("notes.txt")).expect("read"),
        "one\nTWO\nthree\n"
    );

    let reversed = unified::reverse(&patch).expect("reverse");
    unified::apply(&safe, &[], &reversed).expect("backward");
    assert_eq!(
        fs::read_to_string(temp.path().join("notes.txt")).expect("read"),
        original
    );
}

#[test]
fn headerless_batch_mixes_all_three_operations() {
    let (temp, safe) = workspace(&[
        ("keep.rs", "fn keep() {\n    old();\n}\n"),
        ("gone.rs", "x\n"),
    ]);
    let operations = vec![
        FileOperation::UpdateFile {
            path: "keep.rs".to_string(),
            diff: "@@\n fn keep() {\n-    old();\n+    new();\n }".to_string(),
        },
        FileOperation::CreateFile {
            path: "fresh.rs".to_string(),
            diff: "@@\n+fn fresh() {}".to_string(),
        },
        FileOperation::DeleteFile {
            path: "gone.rs".to_string(),
        },
    ];

    let report = headerless::apply(&safe, &[], &operations).expect("apply");
    assert_eq!(report.files.len(), 3);
    assert_eq!(
        fs::read_to_string(temp.path().join("keep.rs")).expect("read"),
        "fn keep() {\n    new();\n}\n"
    );
    assert!(temp.path().join("fresh.rs").exists());
    assert!(!temp.path().join("gone.rs").exists());
}

#[test]
fn anchored_edits_chain_through_returned_hashes() {
    let first = "fn main() {\n}\n";
    let (temp, safe) = workspace(&[("main.rs", first)]);

    let outcome = apply_edit(
        &safe,
        &[],
        &EditRequest {
            path: "main.rs".to_string(),
            mode: EditMode::InsertAfter,
            expected_sha256: sha256_hex(first.as_bytes()),
            anchor: Some("fn main() {\n".to_string()),
            anchor_after: None,
            content: "    setup();\n".to_string(),
            expected_occurrences: 1,
            search_offset: 0,
        },
    )
    .expect("first edit");

    // The returned hash is the precondition for the next edit; no re-read.
    apply_edit(
        &safe,
        &[],
        &EditRequest {
            path: "main.rs".to_string(),
            mode: EditMode::Append,
            expected_sha256: outcome.after_sha256,
            anchor: None,
            anchor_after: None,
            content: "fn teardown() {}\n".to_string(),
            expected_occurrences: 1,
            search_offset: 0,
        },
    )
    .expect("second edit");

    assert_eq!(
        fs::read_to_string(temp.path().join("main.rs")).expect("read"),
        "fn main() {\n    setup();\n}\nfn teardown() {}\n"
    );
}

#[test]
fn every_engine_refuses_escaping_paths() {
    let (_temp, safe) = workspace(&[]);

    let patch = unified::parse(
        "--- /dev/null\n+++ b/../escape.txt\n@@ -0,0 +1 @@\n+x\n",
    )
    .expect("parse");
    let err = unified::apply(&safe, &[], &patch).expect_err("unified");
    assert_eq!(err.code(), "PATH_TRAVERSAL");

    let err = headerless::apply(
        &safe,
        &[],
        &[FileOperation::CreateFile {
            path: "../escape.txt".to_string(),
            diff: "@@\n+x".to_string(),
        }],
    )
    .expect_err("headerless");
    assert_eq!(err.code(), "PATH_TRAVERSAL");

    let err = apply_edit(
        &safe,
        &[],
        &EditRequest {
            path: "/etc/passwd".to_string(),
            mode: EditMode::Append,
            expected_sha256: sha256_hex(b""),
            anchor: None,
            anchor_after: None,
            content: "x".to_string(),
            expected_occurrences: 1,
            search_offset: 0,
        },
    )
    .expect_err("anchor");
    assert_eq!(err.code(), "PATH_ABSOLUTE");
}
