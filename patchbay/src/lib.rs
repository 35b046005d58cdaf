//! Sandboxed mutation kernel for an AI coding-agent harness.
//!
//! `patchbay` lets an LLM-driven agent read, patch, and build a project
//! directory it does not fully trust, while a human keeps veto power over the
//! result. One invariant runs through every module: no agent-issued mutation
//! may escape its declared root or touch a denylisted path, and every mutation
//! is atomic or fails cleanly. The architecture keeps a strict separation:
//!
//! - **[`paths`], [`diff`]**: pure validation and patch application. No
//!   subprocesses, fully testable against plain directories.
//! - **[`proc`], [`vcs`]**: side-effecting operations (child processes, git).
//!   Wrapped behind narrow seams to enable scripted fakes in tests.
//! - **[`changeset`], [`session`], [`buildfix`]**: orchestration of the above
//!   into transactional changesets, tool-calling sessions, and the bounded
//!   build-fix retry loop.

pub mod buildfix;
pub mod changeset;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod logging;
pub mod paths;
pub mod proc;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
pub mod vcs;
