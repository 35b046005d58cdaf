//! Bounded build-fix loop.
//!
//! Run the build; while it fails, hand the failure to a tool-calling fix
//! session and try again, up to a fixed number of iterations. Every
//! iteration is persisted before the loop proceeds, so a crash mid-loop
//! still leaves an honest history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use minijinja::{Environment, context};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::config::KernelConfig;
use crate::events::{EventBus, KernelEvent};
use crate::paths::SafeRoot;
use crate::proc::{ExecResult, RunSpec, run};
use crate::session::{ChatProvider, Message, SessionOutcome, ToolSession};
use crate::store::{BuildIteration, BuildLoop, LoopStatus, Project, Store};
use crate::tools::{ToolContext, fix_registry};
use crate::vcs::GitRunner;

const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");

/// Seam for executing the project's build command.
pub trait BuildRunner {
    fn run_build(&mut self, spec: &RunSpec) -> Result<ExecResult>;
}

/// Production runner: bounded subprocess with captured, size-capped output.
pub struct SystemBuild {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl SystemBuild {
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.subprocess_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl BuildRunner for SystemBuild {
    fn run_build(&mut self, spec: &RunSpec) -> Result<ExecResult> {
        run(spec, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("spawn build command {}", spec.program))
    }
}

/// One build-fix run over a project.
pub struct BuildFixLoop<S: Store, B: BuildRunner, P: ChatProvider> {
    store: Arc<S>,
    bus: EventBus,
    project: Project,
    build_spec: RunSpec,
    runner: B,
    provider: P,
    config: KernelConfig,
    git: Option<Arc<dyn GitRunner + Send + Sync>>,
    guidance: Option<String>,
}

impl<S: Store, B: BuildRunner, P: ChatProvider> BuildFixLoop<S, B, P> {
    pub fn new(
        store: Arc<S>,
        bus: EventBus,
        project: Project,
        build_spec: RunSpec,
        runner: B,
        provider: P,
        config: KernelConfig,
    ) -> Self {
        Self {
            store,
            bus,
            project,
            build_spec,
            runner,
            provider,
            config,
            git: None,
            guidance: None,
        }
    }

    /// Attach a repository so fix sessions can use `git_status`.
    pub fn with_git(mut self, runner: Arc<dyn GitRunner + Send + Sync>) -> Self {
        self.git = Some(runner);
        self
    }

    /// Extra project-specific instructions appended to the fix prompt.
    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = Some(guidance.into());
        self
    }

    /// Drive the loop to a terminal status.
    #[instrument(skip_all, fields(project = self.project.id))]
    pub fn run(&mut self) -> Result<BuildLoop> {
        let max_iterations = self.config.buildfix_max_iterations as usize;
        let mut build_loop = self.store.create_loop(
            self.project.id,
            max_iterations,
            &self.config.model,
        )?;
        self.bus.emit(
            self.project.id,
            &KernelEvent::LoopStarted {
                loop_id: build_loop.id,
                max_iterations,
            },
        );

        let mut previous_summary: Option<String> = None;
        for iteration in 1..=max_iterations {
            let result = self.runner.run_build(&self.build_spec)?;
            let exit_code = if result.timed_out { None } else { result.exit_code };
            debug!(iteration, ?exit_code, "build finished");

            if result.success() {
                self.record_iteration(&build_loop, iteration, &result, None)?;
                self.bus.emit(
                    self.project.id,
                    &KernelEvent::LoopIteration {
                        loop_id: build_loop.id,
                        iteration,
                        exit_code,
                    },
                );
                build_loop.status = LoopStatus::Success;
                self.store.update_loop(&build_loop)?;
                self.bus.emit(
                    self.project.id,
                    &KernelEvent::LoopSucceeded {
                        loop_id: build_loop.id,
                        iterations: iteration,
                    },
                );
                return Ok(build_loop);
            }

            let outcome =
                self.run_fix_session(iteration, max_iterations, &result, &previous_summary,
                    &build_loop)?;

            match outcome {
                SessionOutcome::Stopped { reason } => {
                    self.record_iteration(&build_loop, iteration, &result, Some(&reason))?;
                    self.bus.emit(
                        self.project.id,
                        &KernelEvent::LoopIteration {
                            loop_id: build_loop.id,
                            iteration,
                            exit_code,
                        },
                    );
                    warn!(iteration, %reason, "loop stopped by fix session");
                    build_loop.status = LoopStatus::Blocked;
                    build_loop.stop_reason = Some(reason.clone());
                    self.store.update_loop(&build_loop)?;
                    self.bus.emit(
                        self.project.id,
                        &KernelEvent::LoopBlocked {
                            loop_id: build_loop.id,
                            reason,
                        },
                    );
                    return Ok(build_loop);
                }
                SessionOutcome::Final(summary) => {
                    self.record_iteration(&build_loop, iteration, &result, Some(&summary))?;
                    previous_summary = Some(summary);
                }
                SessionOutcome::DidNotConverge => {
                    let note = "fix session exhausted its tool-call budget";
                    self.record_iteration(&build_loop, iteration, &result, Some(note))?;
                    previous_summary = Some(note.to_string());
                }
            }
            self.bus.emit(
                self.project.id,
                &KernelEvent::LoopIteration {
                    loop_id: build_loop.id,
                    iteration,
                    exit_code,
                },
            );
        }

        build_loop.status = LoopStatus::Failed;
        self.store.update_loop(&build_loop)?;
        self.bus.emit(
            self.project.id,
            &KernelEvent::LoopFailed {
                loop_id: build_loop.id,
                iterations: max_iterations,
            },
        );
        Ok(build_loop)
    }

    fn run_fix_session(
        &mut self,
        iteration: usize,
        max_iterations: usize,
        result: &ExecResult,
        previous_summary: &Option<String>,
        build_loop: &BuildLoop,
    ) -> Result<SessionOutcome> {
        let prompt = render_fix_prompt(&FixPromptInputs {
            command: self.build_spec.command_line(),
            iteration,
            max_iterations,
            exit_code: result.exit_code,
            stdout: &result.stdout,
            stderr: &result.stderr,
            stdout_truncated: result.stdout_truncated > 0,
            stderr_truncated: result.stderr_truncated > 0,
            previous_summary: previous_summary.as_deref(),
            guidance: self.guidance.as_deref(),
        })?;

        let registry = fix_registry()?;
        let root = SafeRoot::new(&self.project.root)?;
        let mut context = ToolContext::new(root, &self.config)
            .with_history(self.history_json(build_loop.id)?);
        if let Some(git) = &self.git {
            context = context.with_git(Arc::clone(git));
        }

        let mut session = ToolSession::new(
            &mut self.provider,
            &registry,
            self.config.model.clone(),
            self.config.session_max_iterations as usize,
        );
        session.push(Message::user(prompt));
        session.run(&context)
    }

    fn history_json(&self, loop_id: i64) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .store
            .loop_iterations(loop_id)?
            .into_iter()
            .map(|it| {
                json!({
                    "iteration": it.iteration,
                    "exit_code": it.exit_code,
                    "summary": it.assistant_summary,
                })
            })
            .collect())
    }

    fn record_iteration(
        &self,
        build_loop: &BuildLoop,
        iteration: usize,
        result: &ExecResult,
        summary: Option<&str>,
    ) -> Result<()> {
        self.store.append_iteration(BuildIteration {
            loop_id: build_loop.id,
            iteration,
            exit_code: if result.timed_out { None } else { result.exit_code },
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            assistant_summary: summary.map(str::to_string),
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}

struct FixPromptInputs<'a> {
    command: String,
    iteration: usize,
    max_iterations: usize,
    exit_code: Option<i32>,
    stdout: &'a str,
    stderr: &'a str,
    stdout_truncated: bool,
    stderr_truncated: bool,
    previous_summary: Option<&'a str>,
    guidance: Option<&'a str>,
}

fn render_fix_prompt(inputs: &FixPromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("fix", FIX_TEMPLATE)
        .context("fix template should be valid")?;
    let template = env.get_template("fix").context("fix template missing")?;
    let exit_code = inputs
        .exit_code
        .map_or_else(|| "killed (timeout)".to_string(), |c| c.to_string());
    template
        .render(context! {
            command => inputs.command,
            iteration => inputs.iteration,
            max_iterations => inputs.max_iterations,
            exit_code => exit_code,
            stdout => inputs.stdout,
            stderr => inputs.stderr,
            stdout_truncated => inputs.stdout_truncated,
            stderr_truncated => inputs.stderr_truncated,
            previous_summary => inputs.previous_summary,
            guidance => inputs.guidance,
        })
        .context("render fix prompt")
}
