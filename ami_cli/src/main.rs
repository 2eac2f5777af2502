//! A-Mi command-line interface
//!
//! This is the entry point for the A-Mi toolchain: `ami run` interprets a
//! program, `ami opt` applies an ordered list of analysis and optimisation
//! passes and writes the transformed program back out.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod exit;

/// A-Mi middle-end driver
#[derive(Parser)]
#[command(name = "ami")]
#[command(about = "Interpreter and optimiser for A-Mi programs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a program with the reference interpreter
    Run {
        /// Source file; standard input if omitted
        file: Option<PathBuf>,

        /// Values fed to successive `read`s (prompts interactively if
        /// exhausted)
        #[arg(short, long, value_delimiter = ',')]
        input: Vec<i128>,

        /// Register width in bits (0 for unbounded)
        #[arg(long, default_value_t = 128)]
        bits: u32,

        /// Entrypoint label (defaults to the first block)
        #[arg(short, long)]
        entrypoint: Option<String>,

        /// Reject unlabelled basic blocks
        #[arg(short = 'A', long)]
        ban_anonymous_blocks: bool,
    },

    /// Apply passes to a program and print the result
    Opt {
        /// Source file; standard input if omitted
        file: Option<PathBuf>,

        /// Destination file; standard output if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Append a pass to run (order-sensitive, repeatable), e.g.
        /// "ssa", "gvn-rpo(expr)", "vdcm(gvn=scc)", "reg-realloc(4)"
        #[arg(short = 'p', long = "add-pass")]
        passes: Vec<String>,

        /// List all available passes and exit
        #[arg(short, long)]
        list_passes: bool,

        /// Do not write metadata comments to the output
        #[arg(short = 'M', long)]
        omit_metadata: bool,

        /// Left margin and code field widths as "L;W"; use '*' for
        /// automatic sizing
        #[arg(short, long)]
        frame: Option<String>,

        /// Entrypoint label (defaults to the first block)
        #[arg(short, long)]
        entrypoint: Option<String>,

        /// Reject unlabelled basic blocks
        #[arg(short = 'A', long)]
        ban_anonymous_blocks: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        log::LevelFilter::Debug
    } else if cli.quiet {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let outcome: Result<ExitCode> = match cli.command {
        Commands::Run { file, input, bits, entrypoint, ban_anonymous_blocks } => {
            commands::run::execute(file, input, bits, entrypoint, ban_anonymous_blocks)
        }
        Commands::Opt {
            file,
            output,
            passes,
            list_passes,
            omit_metadata,
            frame,
            entrypoint,
            ban_anonymous_blocks,
        } => commands::opt::execute(commands::opt::Options {
            file,
            output,
            passes,
            list_passes,
            omit_metadata,
            frame,
            entrypoint,
            ban_anonymous_blocks,
        }),
    };

    match outcome {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {:#}", error);
            ExitCode::from(exit::ARGUMENT_ERROR)
        }
    }
}

fn read_source(file: &Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display())),
        None => {
            use std::io::Read;
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("cannot read standard input")?;
            Ok(source)
        }
    }
}
