use std::io::{self, Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use pyfix::{EngineConfig, ExecutionSandbox, HybridFixOrchestrator};

/// Fix and execute Python code, emitting JSON results.
#[derive(Parser, Debug)]
#[command(name = "pyfix", about = "Automatic Python error fixing with a sandboxed debugger")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Read Python source from a file instead of stdin
    #[arg(long, global = true)]
    file: Option<std::path::PathBuf>,

    /// Sandbox timeout in seconds (clamped to 1-30)
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Repair the source and print the fix artifact
    Fix {
        /// The error message already observed, if any
        #[arg(long)]
        error: Option<String>,
    },
    /// Execute the source in the sandbox (simple mode)
    Run,
    /// Execute with stack context on failure
    Trace,
    /// Execute line by line with variable tracking
    Track,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let code = read_source(&args)?;

    // Errors are encoded in the JSON, not the exit code.
    let json = match args.command {
        Command::Fix { error } => {
            let orchestrator = HybridFixOrchestrator::from_config(EngineConfig::from_env());
            let artifact = orchestrator.fix(&code, error.as_deref());
            serde_json::to_string_pretty(&artifact)?
        }
        Command::Run => {
            let sandbox = ExecutionSandbox::new();
            serde_json::to_string_pretty(&sandbox.execute(&code, args.timeout))?
        }
        Command::Trace => {
            let sandbox = ExecutionSandbox::new();
            serde_json::to_string_pretty(&sandbox.execute_with_trace(&code, args.timeout))?
        }
        Command::Track => {
            let sandbox = ExecutionSandbox::new();
            serde_json::to_string_pretty(&sandbox.execute_with_tracking(&code, args.timeout))?
        }
    };

    println!("{json}");
    Ok(())
}

fn read_source(args: &Args) -> anyhow::Result<String> {
    match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            Ok(buf)
        }
    }
}
