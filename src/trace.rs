use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::bcc::{self, AttachSpec, BccProcess, ContextBuilder, GlobalContext, RenderProbe, SymProcess};
use crate::elf::Interpreter;
use crate::extras::Extras;
use crate::program::{self, Address};
use crate::script;
use crate::Result;

pub struct TraceOptions {
    pub program: String,
    pub tracee: PathBuf,
    /// Debug-info binary; the tracee itself when not given.
    pub debug: Option<PathBuf>,
    pub python: PathBuf,
    pub extras: Extras,
    /// Output path for the rendered program; `-` writes to stdout.
    pub output: PathBuf,
    pub dry_run: bool,
}

impl TraceOptions {
    fn debug_binary(&self) -> &Path {
        self.debug.as_deref().unwrap_or(&self.tracee)
    }
}

/// Compile a trace program into the BCC host program text.
///
/// Parsing runs first, so malformed defines fail before any ELF work; the
/// interpreter is only opened when some probe actually needs resolution.
pub fn compile(
    program_text: &str,
    tracee: &Path,
    debug: &Path,
    extras: &Extras,
) -> Result<String> {
    let uprobes = program::parse(program_text)?;

    let needs_elf = uprobes.iter().any(|u| {
        matches!(
            u.address,
            Address::FileLine { .. } | Address::Function { regex: false, .. }
        )
    });
    let interpreter = if needs_elf {
        Some(Interpreter::open(debug)?)
    } else {
        None
    };

    let tracee_binary = extras
        .real_target
        .clone()
        .unwrap_or_else(|| tracee.display().to_string());

    let builder = ContextBuilder::new(extras);
    let mut globals = GlobalContext::default();
    let mut probes = Vec::new();

    for uprobe in &uprobes {
        let (target, address, regex) = match &uprobe.address {
            Address::Function { name, regex: true } => (name.clone(), String::new(), true),
            Address::Function { name, regex: false } => {
                let resolved = uprobe.address.interpret(interpreter.as_ref().unwrap())?;
                (name.clone(), resolved, false)
            }
            Address::FileLine { file, line } => {
                let effective = match &extras.dwarf_path_prefix {
                    Some(prefix) => Address::FileLine {
                        file: format!("{prefix}{file}"),
                        line: *line,
                    },
                    None => uprobe.address.clone(),
                };
                let resolved = effective.interpret(interpreter.as_ref().unwrap())?;
                (resolved.clone(), resolved, false)
            }
            Address::Literal(addr) => {
                // No interpreter needed: a literal renders to itself.
                let resolved = format!("{addr:#x}");
                (resolved.clone(), resolved, false)
            }
        };

        let known: HashSet<String> = uprobe
            .defines
            .iter()
            .map(|d| d.varname.clone())
            .collect();
        let intro = script::introspect(&uprobe.script, &known)?;

        let (ctx, probe_globals) = builder.build(uprobe, &address, &tracee_binary, &intro)?;
        globals.merge(probe_globals);
        probes.push(RenderProbe {
            ctx,
            attach: AttachSpec::for_target(&target, regex),
        });
    }

    Ok(bcc::render(&globals, &probes))
}

/// Compile and execute a trace program end to end.
///
/// Signal handling: everything is blocked up front, the forked children
/// unblock themselves, and the parent proxies whatever arrives to the BCC
/// child. The sym helper and its `/tmp` mirror are torn down on every exit
/// path; teardown errors never mask the run's own result.
pub fn run(opts: &TraceOptions) -> Result<()> {
    if opts.dry_run {
        let rendered = compile(
            &opts.program,
            &opts.tracee,
            opts.debug_binary(),
            &opts.extras,
        )?;
        return write_output(&opts.output, &rendered);
    }

    bcc::block_all();

    let mut sym = SymProcess::from_pathname(opts.debug_binary());
    sym.spawn()?;

    let result = match sym.setup_symfs(&opts.tracee) {
        Err(e) => Err(e),
        Ok(()) => run_with_sym(opts, &sym),
    };

    let _ = sym.kill(libc::SIGKILL);
    let _ = sym.wait();
    sym.wipeout();
    result
}

fn run_with_sym(opts: &TraceOptions, sym: &SymProcess) -> Result<()> {
    let mut extras = opts.extras.clone();
    if extras.sym_pid.is_none() {
        extras.sym_pid = Some(sym.pid()?);
    }

    let rendered = compile(&opts.program, &opts.tracee, opts.debug_binary(), &extras)?;
    write_output(&opts.output, &rendered)?;

    let mut bcc_process = BccProcess::new(&opts.python, rendered);
    bcc_process.spawn()?;
    tracing::info!("executing host program under {}", opts.python.display());
    bcc_process.proxy_signals()
}

fn write_output(output: &Path, rendered: &str) -> Result<()> {
    if output.as_os_str() == "-" {
        std::io::stdout().write_all(rendered.as_bytes())?;
    } else {
        std::fs::write(output, rendered)?;
        tracing::info!("wrote host program to {}", output.display());
    }
    Ok(())
}
