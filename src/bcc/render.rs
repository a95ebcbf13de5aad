use std::sync::OnceLock;

use regex::Regex;

use super::context::{GlobalContext, UprobeContext};

/// How a probe is handed to the kernel uprobe ABI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachSpec {
    Address(String),
    Symbol { name: String, regex: bool },
}

fn addr_pattern() -> &'static Regex {
    static PAT: OnceLock<Regex> = OnceLock::new();
    PAT.get_or_init(|| Regex::new(r"^0x[0-9a-f]+$").unwrap())
}

impl AttachSpec {
    /// Classify a resolved probe target: a lowercase hex address attaches
    /// by `addr=`, anything else is a symbol name (or symbol regex).
    pub fn for_target(target: &str, regex: bool) -> Self {
        if !regex && addr_pattern().is_match(target) {
            AttachSpec::Address(target.to_string())
        } else {
            AttachSpec::Symbol {
                name: target.to_string(),
                regex,
            }
        }
    }

    fn directive(&self) -> String {
        match self {
            AttachSpec::Address(addr) => format!("addr={addr}"),
            AttachSpec::Symbol { name, regex: false } => format!("sym='{name}'"),
            AttachSpec::Symbol { name, regex: true } => format!("sym_re=r'{name}'"),
        }
    }
}

/// One probe ready for template expansion.
#[derive(Debug, Clone)]
pub struct RenderProbe {
    pub ctx: UprobeContext,
    pub attach: AttachSpec,
}

/// Prefix every non-empty line of a fragment, preserving its internal
/// relative indentation; empty fragments collapse to `pass`-able bodies
/// at the call sites that need one.
fn indent(fragment: &str, prefix: &str) -> String {
    fragment
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{prefix}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn block(fragment: &str) -> String {
    if fragment.trim().is_empty() {
        String::new()
    } else {
        format!("{}\n", fragment.trim_end())
    }
}

/// Expand the host-program template: C probe text, loader, per-probe event
/// structs, callbacks and attachment calls.
pub fn render(globals: &GlobalContext, probes: &[RenderProbe]) -> String {
    let mut out = String::new();

    out.push_str("#!/usr/bin/env python3\n");
    out.push_str("import ctypes\n\n");
    out.push_str("from bcc import BPF\n");
    for import in &globals.py_imports {
        out.push_str(import);
        out.push('\n');
    }
    out.push('\n');

    // Kernel-side C program.
    out.push_str("bpf_text = r'''\n");
    out.push_str("#include <uapi/linux/ptrace.h>\n");
    for header in &globals.c_headers {
        out.push_str(header);
        out.push('\n');
    }
    out.push('\n');
    for probe in probes {
        let i = probe.ctx.idx;
        out.push_str(&block(&probe.ctx.c_global));
        out.push_str(&format!("struct data{i}_t {{\n"));
        out.push_str(&block(&indent(&probe.ctx.c_data, "    ")));
        out.push_str("};\n");
        out.push_str(&format!("BPF_PERF_OUTPUT(events{i});\n\n"));
        out.push_str(&format!("int trace_probe{i}(struct pt_regs *ctx) {{\n"));
        out.push_str(&format!("    struct data{i}_t data = {{}};\n"));
        out.push_str(&block(&indent(&probe.ctx.c_callback, "    ")));
        out.push_str(&format!(
            "    events{i}.perf_submit(ctx, &data, sizeof(data));\n"
        ));
        out.push_str("    return 0;\n");
        out.push_str("}\n\n");
    }
    out.push_str("'''\n\n");

    out.push_str("b = BPF(text=bpf_text)\n");
    for probe in probes {
        let i = probe.ctx.idx;
        out.push_str(&format!(
            "b.attach_uprobe(name='{}', {}, fn_name='trace_probe{}')\n",
            probe.ctx.tracee_binary,
            probe.attach.directive(),
            i
        ));
    }
    out.push('\n');

    for global in &globals.py_global {
        out.push_str(global);
        out.push_str("\n\n");
    }

    for probe in probes {
        let i = probe.ctx.idx;
        out.push_str(&format!("class Data{i}(ctypes.Structure):\n"));
        out.push_str("    _fields_ = [\n");
        out.push_str(&block(&indent(&probe.ctx.py_data, "        ")));
        out.push_str("    ]\n\n\n");
        out.push_str(&format!("def on_event{i}(cpu, data, size):\n"));
        out.push_str(&format!(
            "    event = ctypes.cast(data, ctypes.POINTER(Data{i})).contents\n"
        ));
        let body = indent(&probe.ctx.py_callback, "    ");
        if body.trim().is_empty() {
            out.push_str("    pass\n");
        } else {
            out.push_str(&block(&body));
        }
        out.push('\n');
        out.push_str(&format!(
            "b['events{i}'].open_perf_buffer(on_event{i})\n\n"
        ));
    }

    out.push_str("while True:\n");
    out.push_str("    try:\n");
    out.push_str("        b.perf_buffer_poll()\n");
    out.push_str("    except KeyboardInterrupt:\n");
    out.push_str("        break\n");

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_heuristic_address() {
        assert_eq!(
            AttachSpec::for_target("0xdeadbeef", false),
            AttachSpec::Address("0xdeadbeef".to_string())
        );
    }

    #[test]
    fn test_attach_heuristic_rejects_non_hex() {
        // "excess" contains only [x0-9a-z] but is not an address.
        assert_eq!(
            AttachSpec::for_target("excess", false),
            AttachSpec::Symbol {
                name: "excess".to_string(),
                regex: false
            }
        );
        assert!(matches!(
            AttachSpec::for_target("main.main", false),
            AttachSpec::Symbol { .. }
        ));
    }

    #[test]
    fn test_attach_directive_forms() {
        assert_eq!(
            AttachSpec::for_target("0x400abc", false).directive(),
            "addr=0x400abc"
        );
        assert_eq!(
            AttachSpec::for_target("pkg.Func", false).directive(),
            "sym='pkg.Func'"
        );
        assert_eq!(
            AttachSpec::for_target("main\\..*", true).directive(),
            "sym_re=r'main\\..*'"
        );
    }

    #[test]
    fn test_render_single_probe() {
        let probe = RenderProbe {
            ctx: UprobeContext {
                idx: 0,
                tracee_binary: "/bin/app".to_string(),
                address: "0xdeadbeef".to_string(),
                c_data: "u32 pid;".to_string(),
                c_callback: "data.pid = bpf_get_current_pid_tgid() >> 32;".to_string(),
                py_data: "(\"pid\", ctypes.c_uint32),".to_string(),
                py_callback: "pid = event.pid\n\nprint(pid)".to_string(),
                ..Default::default()
            },
            attach: AttachSpec::for_target("0xdeadbeef", false),
        };
        let out = render(&GlobalContext::default(), &[probe]);

        assert!(out.contains("struct data0_t {\n    u32 pid;\n};"));
        assert!(out.contains("b.attach_uprobe(name='/bin/app', addr=0xdeadbeef, fn_name='trace_probe0')"));
        assert!(out.contains("    pid = event.pid"));
        assert!(out.contains("    print(pid)"));
        assert!(out.contains("(\"pid\", ctypes.c_uint32),"));
    }

    #[test]
    fn test_render_empty_callback_gets_pass() {
        let probe = RenderProbe {
            ctx: UprobeContext {
                idx: 0,
                tracee_binary: "/bin/app".to_string(),
                ..Default::default()
            },
            attach: AttachSpec::for_target("0x1", false),
        };
        let out = render(&GlobalContext::default(), &[probe]);
        assert!(out.contains("def on_event0(cpu, data, size):"));
        assert!(out.contains("    pass\n"));
    }

    #[test]
    fn test_render_probe_naming_tracks_index() {
        let mk = |idx: usize| RenderProbe {
            ctx: UprobeContext {
                idx,
                tracee_binary: "/bin/app".to_string(),
                c_global: format!("BPF_STACK_TRACE(stack_trace{idx}, 128);"),
                ..Default::default()
            },
            attach: AttachSpec::for_target(&format!("{:#x}", idx + 1), false),
        };
        let out = render(&GlobalContext::default(), &[mk(0), mk(1)]);
        assert!(out.contains("BPF_STACK_TRACE(stack_trace0, 128);"));
        assert!(out.contains("BPF_STACK_TRACE(stack_trace1, 128);"));
        assert!(out.contains("trace_probe0"));
        assert!(out.contains("trace_probe1"));
        assert!(out.contains("events0"));
        assert!(out.contains("events1"));
    }
}
