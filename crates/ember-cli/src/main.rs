//! Ember driver: run a script file, or start a REPL with no arguments
//!
//! Exit codes follow the usual sysexits convention: 0 on success, 65 for
//! compile errors, 70 for runtime errors.

mod repl;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use ember_runtime::{Diagnostic, InterpretError, Vm};
use tracing_subscriber::EnvFilter;

const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;

#[derive(Parser)]
#[command(name = "ember")]
#[command(version = ember_runtime::VERSION)]
#[command(about = "The Ember programming language", long_about = None)]
struct Cli {
    /// Script to execute; starts an interactive REPL when omitted
    script: Option<PathBuf>,

    /// Print the compiled bytecode before running
    #[arg(long)]
    disasm: bool,

    /// Report compile diagnostics as JSON on stdout
    #[arg(long)]
    json: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("EMBER_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match &cli.script {
        Some(path) => run_file(path, cli.disasm, cli.json),
        None => repl::run(),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("Error: {:#}", error);
            std::process::exit(1);
        }
    }
}

/// Execute a script file, returning the process exit code
fn run_file(path: &Path, disasm: bool, json: bool) -> Result<i32> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read script: {}", path.display()))?;

    let mut vm = Vm::new();

    if disasm {
        match vm.disassemble(&source) {
            Ok(listing) => println!("{}", listing),
            Err(diagnostics) => {
                report_diagnostics(&diagnostics, json);
                return Ok(EXIT_COMPILE_ERROR);
            }
        }
    }

    match vm.interpret(&source) {
        Ok(()) => Ok(0),
        Err(InterpretError::Compile(diagnostics)) => {
            report_diagnostics(&diagnostics, json);
            Ok(EXIT_COMPILE_ERROR)
        }
        Err(InterpretError::Runtime(error)) => {
            eprintln!("{}", error);
            Ok(EXIT_RUNTIME_ERROR)
        }
    }
}

fn report_diagnostics(diagnostics: &[Diagnostic], json: bool) {
    for diagnostic in diagnostics {
        if json {
            match diagnostic.to_json_string() {
                Ok(line) => println!("{}", line),
                Err(_) => eprintln!("{}", diagnostic),
            }
        } else {
            eprintln!("{}", diagnostic);
        }
    }
}
