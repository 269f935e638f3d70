use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;

use crate::error::AlthreadError;
use crate::frontend::VirtualFs;
use crate::simulator::{SelectionPolicy, SimulatorConfig};

/// Althread - a small concurrent language with a model checker
#[derive(Parser, Debug)]
#[command(name = "althread", version, about)]
pub struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a source file and print its bytecode
    Compile {
        /// Entry source file
        file: PathBuf,
    },
    /// Simulate one execution
    Run {
        /// Entry source file
        file: PathBuf,
        /// RNG seed for the random scheduling policy
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Use deterministic round-robin scheduling instead of random
        #[arg(long)]
        round_robin: bool,
        /// Transition budget
        #[arg(long, default_value_t = 10_000)]
        max_steps: usize,
        /// Emit the full trace as JSON
        #[arg(long)]
        json: bool,
    },
    /// Model-check all reachable states
    Check {
        /// Entry source file
        file: PathBuf,
        /// Cap on explored states
        #[arg(long)]
        max_states: Option<usize>,
        /// Emit the result as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Run the CLI to completion.
pub fn execute(cli: Cli) -> Result<()> {
    if cli.no_color {
        colored::control::set_override(false);
    }
    match cli.command {
        Command::Compile { file } => compile_command(&file),
        Command::Run {
            file,
            seed,
            round_robin,
            max_steps,
            json,
        } => run_command(&file, seed, round_robin, max_steps, json),
        Command::Check {
            file,
            max_states,
            json,
        } => check_command(&file, max_states, json),
    }
}

fn compile_command(file: &Path) -> Result<()> {
    let (source, entry, vfs) = load_sources(file)?;
    match crate::compile(&source, &entry, &vfs) {
        Ok(program) => {
            print!("{}", program);
            Ok(())
        }
        Err(diagnostics) => {
            report_diagnostics(&diagnostics);
            Err(anyhow!("compilation failed"))
        }
    }
}

fn run_command(
    file: &Path,
    seed: u64,
    round_robin: bool,
    max_steps: usize,
    json: bool,
) -> Result<()> {
    let (source, entry, vfs) = load_sources(file)?;
    let config = SimulatorConfig {
        policy: if round_robin {
            SelectionPolicy::RoundRobin
        } else {
            SelectionPolicy::Random { seed }
        },
        max_steps,
    };
    match crate::run(&source, &entry, &vfs, config) {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            for line in &result.stdout {
                println!("{}", line);
            }
            if let Some(diagnostic) = &result.diagnostic {
                eprintln!("{} {}", "error:".bright_red().bold(), diagnostic);
                return Err(anyhow!("simulation ended with a diagnostic"));
            }
            Ok(())
        }
        Err(diagnostics) => {
            report_diagnostics(&diagnostics);
            Err(anyhow!("compilation failed"))
        }
    }
}

fn check_command(file: &Path, max_states: Option<usize>, json: bool) -> Result<()> {
    let (source, entry, vfs) = load_sources(file)?;
    match crate::check(&source, &entry, &vfs, max_states) {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            println!(
                "{} state(s) explored, {} violation(s)",
                result.graph.len(),
                result.violations.len()
            );
            for violation in &result.violations {
                eprintln!("{} {}", "violation:".bright_red().bold(), violation.error);
                for step in &violation.path {
                    eprintln!(
                        "  {} {} (lines {:?})",
                        step.pid.to_string().cyan(),
                        step.name,
                        step.lines
                    );
                }
            }
            if let Some(diagnostic) = &result.diagnostic {
                eprintln!("{} {}", "warning:".yellow().bold(), diagnostic);
            }
            if result.violations.is_empty() {
                Ok(())
            } else {
                Err(anyhow!("check found violations"))
            }
        }
        Err(diagnostics) => {
            report_diagnostics(&diagnostics);
            Err(anyhow!("compilation failed"))
        }
    }
}

fn report_diagnostics(diagnostics: &[AlthreadError]) {
    for diagnostic in diagnostics {
        eprintln!("{} {}", "error:".bright_red().bold(), diagnostic);
        for note in &diagnostic.notes {
            eprintln!("  {} {} at {}", "note:".cyan(), note.message, note.pos);
        }
    }
}

/// Read the entry file and build the virtual file system from every `.alt`
/// file under its directory. The core itself performs no I/O; this adapter
/// is the only place the real filesystem appears.
fn load_sources(file: &Path) -> Result<(String, String, VirtualFs)> {
    let source = fs::read_to_string(file)
        .with_context(|| format!("cannot read '{}'", file.display()))?;
    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    let entry = file
        .file_name()
        .ok_or_else(|| anyhow!("'{}' is not a file", file.display()))?
        .to_string_lossy()
        .to_string();
    let mut vfs: VirtualFs = HashMap::new();
    collect_alt_files(dir, dir, &mut vfs)?;
    Ok((source, entry, vfs))
}

fn collect_alt_files(base: &Path, dir: &Path, vfs: &mut VirtualFs) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_alt_files(base, &path, vfs)?;
        } else if path.extension().is_some_and(|ext| ext == "alt") {
            let key = path
                .strip_prefix(base)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let content = fs::read_to_string(&path)
                .with_context(|| format!("cannot read '{}'", path.display()))?;
            vfs.insert(key, content);
        }
    }
    Ok(())
}
