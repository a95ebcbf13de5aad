use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Compile a uprobe trace DSL into a self-contained BCC program.
#[derive(Debug, Parser)]
#[command(name = "urtrace", version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase output verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbosity: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile a trace program and execute the generated host program.
    Trace(Trace),
    /// Print the runtime location of a function parameter at an address.
    Resolve(Resolve),
}

#[derive(Debug, clap::Args)]
pub struct Trace {
    /// Binary to trace.
    #[arg(short = 't', long = "tracee")]
    pub tracee: PathBuf,

    /// Binary carrying debug info; defaults to the tracee.
    #[arg(short = 'd', long = "debug")]
    pub debug: Option<PathBuf>,

    /// Extra render variables, comma-separated K=V
    /// (sym_pid, real_target, dwarf_path_prefix).
    #[arg(short = 'e', long = "extra")]
    pub extras: Option<String>,

    /// Read the trace program from a file.
    #[arg(short = 'f', long = "program-file")]
    pub program_file: Option<PathBuf>,

    /// Where to write the generated program; '-' for stdout.
    #[arg(short = 'o', long = "output", default_value = "trace.bcc.py")]
    pub output: PathBuf,

    /// Python interpreter used to execute the generated program.
    #[arg(short = 'p', long = "python", default_value = "python3")]
    pub python: PathBuf,

    /// Render and write the program without executing it.
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Trace program text, or @FILE.
    pub program: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct Resolve {
    /// Binary carrying debug info.
    #[arg(short = 'd', long = "debug")]
    pub debug: PathBuf,

    /// Instruction address, 0xHEX.
    #[arg(short = 'a', long = "address")]
    pub address: String,

    /// Variable expression: NAME or NAME.member.path.
    #[arg(long = "var")]
    pub var: String,
}
