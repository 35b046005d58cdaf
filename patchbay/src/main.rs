//! Thin CLI over the mutation kernel.

use std::fs;
use std::io::Read as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use patchbay::config::{KernelConfig, load_config};
use patchbay::diff::anchor::{EditRequest, apply_edit};
use patchbay::diff::headerless::{self, FileOperation};
use patchbay::diff::unified;
use patchbay::paths::SafeRoot;
use patchbay::vcs::{Git, SystemGit};

#[derive(Parser)]
#[command(
    name = "patchbay",
    version,
    about = "Patch engines and changeset plumbing for agent-driven edits"
)]
struct Cli {
    /// Kernel config file (TOML). Missing file means defaults.
    #[arg(long, default_value = "patchbay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a relative path against a root and print the absolute result.
    Resolve {
        #[arg(long)]
        root: PathBuf,
        path: String,
    },
    /// Apply a unified diff (from a file, or stdin when omitted) to a root.
    Apply {
        #[arg(long)]
        root: PathBuf,
        patch: Option<PathBuf>,
    },
    /// Apply headerless operations given as a JSON array.
    Ops {
        #[arg(long)]
        root: PathBuf,
        operations: Option<PathBuf>,
    },
    /// Apply a single anchored edit given as a JSON object.
    Edit {
        #[arg(long)]
        root: PathBuf,
        request: Option<PathBuf>,
    },
    /// Porcelain status of the repository at a root.
    Status {
        #[arg(long)]
        root: PathBuf,
    },
}

fn main() {
    patchbay::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Resolve { root, path } => cmd_resolve(&root, &path),
        Command::Apply { root, patch } => cmd_apply(&config, &root, patch.as_deref()),
        Command::Ops { root, operations } => cmd_ops(&config, &root, operations.as_deref()),
        Command::Edit { root, request } => cmd_edit(&config, &root, request.as_deref()),
        Command::Status { root } => cmd_status(&root),
    }
}

fn cmd_resolve(root: &std::path::Path, path: &str) -> Result<()> {
    let safe = SafeRoot::new(root)?;
    let resolved = safe.resolve(path)?;
    println!("{}", resolved.display());
    Ok(())
}

fn cmd_apply(config: &KernelConfig, root: &std::path::Path, patch: Option<&std::path::Path>) -> Result<()> {
    let text = read_input(patch)?;
    let safe = SafeRoot::new(root)?;
    let parsed = unified::parse(&text)?;
    let report = unified::apply(&safe, &config.denylist_extra, &parsed)?;
    print_json(&report)
}

fn cmd_ops(config: &KernelConfig, root: &std::path::Path, file: Option<&std::path::Path>) -> Result<()> {
    let text = read_input(file)?;
    let operations: Vec<FileOperation> =
        serde_json::from_str(&text).context("parse operations json")?;
    let safe = SafeRoot::new(root)?;
    let report = headerless::apply(&safe, &config.denylist_extra, &operations)?;
    print_json(&report)
}

fn cmd_edit(config: &KernelConfig, root: &std::path::Path, file: Option<&std::path::Path>) -> Result<()> {
    let text = read_input(file)?;
    let request: EditRequest = serde_json::from_str(&text).context("parse edit json")?;
    let safe = SafeRoot::new(root)?;
    let outcome = apply_edit(&safe, &config.denylist_extra, &request)?;
    print_json(&outcome)
}

fn cmd_status(root: &std::path::Path) -> Result<()> {
    let git = Git::new(SystemGit::default(), root);
    let entries = git.status_porcelain()?;
    let entries: Vec<_> = entries
        .iter()
        .map(|e| json!({ "code": e.code, "path": e.path }))
        .collect();
    print_json(&json!({ "clean": entries.is_empty(), "entries": entries }))
}

/// Read from a file when given, stdin otherwise.
fn read_input(path: Option<&std::path::Path>) -> Result<String> {
    match path {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            Ok(buf)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    print!("{payload}");
    Ok(())
}
