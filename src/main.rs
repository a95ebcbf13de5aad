use clap::Parser as _;
use tracing_subscriber::filter::LevelFilter;

use urtrace::args::{Args, Command, Resolve, Trace};
use urtrace::extras::Extras;
use urtrace::{elf, trace, Error, Result};

fn main() {
    let args = Args::parse();

    let level = match args.verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let result = match args.command {
        Command::Trace(trace_args) => run_trace(trace_args),
        Command::Resolve(resolve_args) => run_resolve(resolve_args),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run_trace(args: Trace) -> Result<()> {
    let mut program = String::new();
    if let Some(file) = &args.program_file {
        program.push_str(std::fs::read_to_string(file)?.trim());
    }
    match args.program.as_deref() {
        Some(text) if text.starts_with('@') => {
            program.push_str(std::fs::read_to_string(&text[1..])?.trim());
        }
        Some(text) => program.push_str(text),
        None => {}
    }
    if program.is_empty() {
        return Err(Error::InvalidProgram);
    }

    let extras = Extras::parse(args.extras.as_deref().unwrap_or_default())?;

    trace::run(&trace::TraceOptions {
        program,
        tracee: args.tracee,
        debug: args.debug,
        python: args.python,
        extras,
        output: args.output,
        dry_run: args.dry_run,
    })
}

fn run_resolve(args: Resolve) -> Result<()> {
    let digits = args
        .address
        .strip_prefix("0x")
        .ok_or_else(|| Error::InvalidAddress(args.address.clone()))?;
    let addr = u64::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidAddress(args.address.clone()))?;

    let interpreter = elf::Interpreter::open(&args.debug)?;
    let location = interpreter.resolve_var_expression(addr, &args.var)?;
    println!("{location}");
    Ok(())
}
