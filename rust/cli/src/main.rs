//! `sable`: run, disassemble and verify Sable bytecode.

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use sable_bytecode::Listing;
use sable_cli::{read_input, InputError};
use sable_verifier::{verify_tree, VerifyError};
use sable_vm_runtime::{ConfigError, Machine, MachineConfig, VmError};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sable", version)]
#[command(about = "Run and inspect Sable bytecode modules")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a module, optionally calling one of its functions afterwards
    Run {
        /// A .sblc cache file or a .json assembly listing
        path: PathBuf,

        /// Directory searched for imported modules (repeatable)
        #[arg(long = "root", value_name = "DIR")]
        roots: Vec<PathBuf>,

        /// Function to call once the module body has run
        #[arg(long, value_name = "FN")]
        entry: Option<String>,

        /// Print an execution profile as JSON on stderr
        #[arg(long)]
        profile: bool,

        /// Do not write .sblc caches for imported modules
        #[arg(long)]
        no_cache: bool,
    },
    /// Print the instructions of every chunk in the tree
    Disasm { path: PathBuf },
    /// Run the static verifier over every chunk in the tree
    Verify { path: PathBuf },
    /// List the natives a machine starts with, as JSON
    Natives,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("cannot encode JSON output: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    match execute(cli.command) {
        Ok(status) => process::exit(status),
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            process::exit(2);
        }
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` for the sable crates when
/// `SABLE_VERBOSE=1`.
fn init_logging() {
    let verbose = env::var("SABLE_VERBOSE").is_ok_and(|value| value == "1");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,sable_vm_runtime=debug,sable_verifier=debug,sable_cli=debug")
        } else {
            EnvFilter::new("info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn execute(command: Command) -> Result<i32, CliError> {
    match command {
        Command::Run {
            path,
            roots,
            entry,
            profile,
            no_cache,
        } => run(&path, roots, entry, profile, no_cache),
        Command::Disasm { path } => {
            let input = read_input(&path)?;
            print!("{}", Listing(&input.chunk));
            Ok(0)
        }
        Command::Verify { path } => verify(&path),
        Command::Natives => {
            let machine = Machine::new(MachineConfig::from_env()?);
            let descriptors = machine.natives().descriptors();
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
            Ok(0)
        }
    }
}

fn run(
    path: &Path,
    roots: Vec<PathBuf>,
    entry: Option<String>,
    profile: bool,
    no_cache: bool,
) -> Result<i32, CliError> {
    let input = read_input(path)?;

    let mut config = MachineConfig::from_env()?;
    if !roots.is_empty() {
        config.search_roots = roots;
    }
    // Imports next to the entry file resolve without an explicit root.
    let home = match input.path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !config.search_roots.contains(&home) {
        config.search_roots.push(home);
    }
    config.profile |= profile;
    if no_cache {
        config.cache_enabled = false;
    }
    info!(module = %input.name, roots = ?config.search_roots, "starting machine");

    let mut machine = Machine::new(config);
    machine.register_module(&input.name, &input.chunk)?;
    match entry {
        Some(entry) => {
            if let Some(value) = machine.call(&input.name, &entry, Vec::new()) {
                if !value.is_none() {
                    println!("{value}");
                }
            }
        }
        None => match machine.load_module(&input.name) {
            // Halts were already reported with their trace.
            Ok(_) | Err(VmError::Halted { .. }) => {}
            Err(other) => return Err(other.into()),
        },
    }

    if let Some(report) = machine.profile_report() {
        eprintln!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(machine.status())
}

fn verify(path: &Path) -> Result<i32, CliError> {
    let input = read_input(path)?;
    let reports = verify_tree(&input.chunk)?;
    let mut failed = 0;
    for chunk in &reports {
        let indent = "  ".repeat(chunk.depth);
        println!("{indent}{}: {}", chunk.name, chunk.report.summary());
        for violation in &chunk.report.violations {
            println!("{indent}  {violation}");
        }
        if !chunk.report.ok() {
            failed += 1;
        }
    }
    if failed > 0 {
        error!(failed, "verification failed");
        return Ok(1);
    }
    Ok(0)
}
