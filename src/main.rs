use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use umka::bytecode::format;
use umka::jit::JitManager;
use umka::vm::{Machine, RuntimeOptions};

/// Execute a compiled `.umka` bytecode program.
#[derive(Parser, Debug)]
#[command(name = "umka_vm", about = "UMKA bytecode virtual machine")]
struct Args {
    /// Path to the bytecode file.
    bytecode_path: PathBuf,

    /// Print the program listing instead of executing it.
    #[arg(long = "disasm")]
    disasm: bool,

    /// Disable the background optimizer.
    #[arg(long = "no-jit")]
    no_jit: bool,

    /// Entry count after which a function is queued for optimization.
    #[arg(long = "jit-threshold")]
    jit_threshold: Option<u64>,

    /// Garbage-collection byte budget (default: 1% of physical RAM).
    #[arg(long = "gc-threshold")]
    gc_threshold: Option<usize>,

    /// Print a hot-function report after the run.
    #[arg(long = "profile")]
    profile: bool,

    /// Print the profiler snapshot as JSON after the run.
    #[arg(long = "profile-json")]
    profile_json: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let file = File::open(&args.bytecode_path)
        .with_context(|| format!("cannot open {}", args.bytecode_path.display()))?;
    let program = format::read_program(BufReader::new(file))
        .with_context(|| format!("cannot load {}", args.bytecode_path.display()))?;

    if args.disasm {
        print!("{}", program.disassemble());
        return Ok(());
    }

    let mut options = RuntimeOptions::default();
    if let Some(threshold) = args.jit_threshold {
        options = options.with_jit_threshold(threshold);
    }
    if let Some(bytes) = args.gc_threshold {
        options = options.with_gc_threshold(bytes);
    }

    let mut machine = Machine::with_options(program.clone(), options);
    if !args.no_jit {
        machine = machine.with_jit(Arc::new(JitManager::new(&program)));
    }

    machine.run().context("execution failed")?;

    if args.profile || args.profile_json {
        let snapshot = machine.profiler().snapshot();
        if args.profile_json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        } else {
            eprintln!("hot threshold: {}", snapshot.threshold);
            for function in &snapshot.functions {
                eprintln!(
                    "fn #{}: entries={} backward_branches={}{}",
                    function.function_id,
                    function.entries,
                    function.backward_branches,
                    if function.hot { " [hot]" } else { "" }
                );
            }
        }
    }
    Ok(())
}
