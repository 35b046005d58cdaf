//! Shared fixtures for unit and integration tests.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow};

use crate::proc::{ExecResult, RunSpec};
use crate::session::{ChatProvider, ChatRequest, ProviderReply};

/// Disposable real git repository with one initial commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q", "-b", "main"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.git(&["config", "user.name", "test"]);
        repo.write("README.md", "seed\n");
        repo.git(&["add", "-A"]);
        repo.git(&["commit", "-q", "-m", "initial"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn root_string(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let full = self.dir.path().join(relative);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(full, contents).expect("write fixture file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.dir.path().join(relative)).expect("read fixture file")
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.dir.path().join(relative).exists()
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }

    /// Run git in the repo, panicking on failure. Test-only convenience.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).to_string()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider that replays canned replies in order.
pub struct ScriptedProvider {
    replies: VecDeque<ProviderReply>,
    /// Transcript lengths observed per completion, for assertions.
    pub seen_message_counts: Vec<usize>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ProviderReply>) -> Self {
        Self {
            replies: replies.into(),
            seen_message_counts: Vec::new(),
        }
    }
}

impl ChatProvider for ScriptedProvider {
    fn complete(&mut self, request: &ChatRequest<'_>) -> Result<ProviderReply> {
        self.seen_message_counts.push(request.messages.len());
        self.replies
            .pop_front()
            .ok_or_else(|| anyhow!("scripted provider ran out of replies"))
    }
}

/// Build runner that replays canned results in order.
pub struct ScriptedBuild {
    results: VecDeque<ExecResult>,
    pub invocations: Vec<PathBuf>,
}

impl ScriptedBuild {
    pub fn new(results: Vec<ExecResult>) -> Self {
        Self {
            results: results.into(),
            invocations: Vec::new(),
        }
    }

    pub fn success() -> ExecResult {
        ExecResult {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
        }
    }

    pub fn failure(code: i32, stderr: &str) -> ExecResult {
        ExecResult {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: false,
        }
    }
}

impl crate::buildfix::BuildRunner for ScriptedBuild {
    fn run_build(&mut self, spec: &RunSpec) -> Result<ExecResult> {
        self.invocations.push(spec.cwd.clone());
        self.results
            .pop_front()
            .ok_or_else(|| anyhow!("scripted build ran out of results"))
    }
}
