use std::collections::BTreeSet;

use crate::extras::Extras;
use crate::program::{Define, DefineKind, PeekExpr, PeekOp, Uprobe};
use crate::script::Introspection;
use crate::{Error, Result};

/// Python helper injected once when a script calls `peek(...)` directly:
/// successive calls hand back the captured fields in call order.
const PEEK_HELPER: &str = "\
def make_peek(values):
    it = iter(values)
    return lambda *args: next(it)";

/// Generated code fragments for one probe, merged define by define.
#[derive(Debug, Clone, Default)]
pub struct UprobeContext {
    pub idx: usize,
    pub tracee_binary: String,
    pub address: String,

    pub c_global: String,
    pub c_data: String,
    pub c_callback: String,

    pub py_data: String,
    pub py_callback: String,
}

impl UprobeContext {
    pub fn merge(&mut self, other: &UprobeContext) {
        merge_fragment(&mut self.c_global, &other.c_global);
        merge_fragment(&mut self.c_data, &other.c_data);
        merge_fragment(&mut self.c_callback, &other.c_callback);
        merge_fragment(&mut self.py_data, &other.py_data);
        merge_fragment(&mut self.py_callback, &other.py_callback);
    }
}

fn merge_fragment(dst: &mut String, src: &str) {
    let src = src.trim();
    if src.is_empty() {
        return;
    }
    if !dst.is_empty() {
        dst.push('\n');
    }
    dst.push_str(src);
}

/// Program-wide sections, deduplicated across probes.
#[derive(Debug, Clone, Default)]
pub struct GlobalContext {
    pub py_imports: BTreeSet<String>,
    pub c_headers: BTreeSet<String>,
    pub py_global: BTreeSet<String>,
}

impl GlobalContext {
    pub fn merge(&mut self, other: GlobalContext) {
        self.py_imports.extend(other.py_imports);
        self.c_headers.extend(other.c_headers);
        self.py_global.extend(other.py_global);
    }
}

/// Union the probe's explicit defines with the ones its script
/// introspection implies: referenced magics become trailing defines, and
/// recorded `peek(...)` calls become capture defines in call order.
pub fn effective_defines(uprobe: &Uprobe, intro: &Introspection) -> Result<Vec<Define>> {
    let mut defines = uprobe.defines.clone();
    for var in &intro.vars {
        if defines.iter().any(|d| &d.varname == var) {
            continue;
        }
        defines.push(Define::parse(
            defines.len(),
            uprobe.idx,
            var,
            &format!("${var}"),
        )?);
    }
    for peek in &intro.peeks {
        let idx = defines.len();
        let expr = PeekExpr::from_call(&peek.offsets, &peek.cast)?;
        defines.push(Define {
            idx,
            uprobe_idx: uprobe.idx,
            varname: format!("peek{idx}"),
            kind: DefineKind::Peek(expr),
        });
    }
    Ok(defines)
}

/// Converts a probe's defines into merged code fragments.
pub struct ContextBuilder<'a> {
    extras: &'a Extras,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(extras: &'a Extras) -> Self {
        Self { extras }
    }

    pub fn build(
        &self,
        uprobe: &Uprobe,
        address: &str,
        tracee_binary: &str,
        intro: &Introspection,
    ) -> Result<(UprobeContext, GlobalContext)> {
        let mut ctx = UprobeContext {
            idx: uprobe.idx,
            tracee_binary: tracee_binary.to_string(),
            address: address.to_string(),
            ..Default::default()
        };
        let mut globals = GlobalContext::default();

        let defines = effective_defines(uprobe, intro)?;
        for define in &defines {
            let fragment = self.convert(define, &mut globals)?;
            ctx.merge(&fragment);
        }

        if !intro.peeks.is_empty() {
            globals.py_global.insert(PEEK_HELPER.to_string());
            // Script-form peeks are always the trailing defines.
            let script_peeks: Vec<String> = defines[defines.len() - intro.peeks.len()..]
                .iter()
                .map(|d| format!("event.peek{}", d.idx))
                .collect();
            merge_fragment(
                &mut ctx.py_callback,
                &format!("peek = make_peek([{}])", script_peeks.join(", ")),
            );
        }

        if !uprobe.script.is_empty() {
            ctx.py_callback.push_str("\n\n");
            ctx.py_callback.push_str(&uprobe.script);
        }

        Ok((ctx, globals))
    }

    fn convert(&self, define: &Define, globals: &mut GlobalContext) -> Result<UprobeContext> {
        let var = &define.varname;
        Ok(match &define.kind {
            DefineKind::Pid => UprobeContext {
                c_data: "u32 pid;".to_string(),
                c_callback: "data.pid = bpf_get_current_pid_tgid() >> 32;".to_string(),
                py_data: "(\"pid\", ctypes.c_uint32),".to_string(),
                py_callback: format!("{var} = event.pid"),
                ..Default::default()
            },
            DefineKind::Tid => UprobeContext {
                c_data: "u32 tid;".to_string(),
                c_callback: "data.tid = bpf_get_current_pid_tgid() & 0xffffffff;".to_string(),
                py_data: "(\"tid\", ctypes.c_uint32),".to_string(),
                py_callback: format!("{var} = event.tid"),
                ..Default::default()
            },
            DefineKind::Comm => {
                globals.c_headers.insert("#include <linux/sched.h>".to_string());
                UprobeContext {
                    c_data: "char comm[16];".to_string(),
                    c_callback: "bpf_get_current_comm(&data.comm, sizeof(data.comm));"
                        .to_string(),
                    py_data: "(\"comm\", ctypes.c_char * 16),".to_string(),
                    py_callback: format!("{var} = event.comm.decode()"),
                    ..Default::default()
                }
            }
            DefineKind::Stack => {
                let sym_pid = self
                    .extras
                    .sym_pid
                    .ok_or(Error::MissingExtra("sym_pid"))?;
                let probe = define.uprobe_idx;
                UprobeContext {
                    c_data: "int stack_id;".to_string(),
                    c_global: format!("BPF_STACK_TRACE(stack_trace{probe}, 128);"),
                    c_callback: format!(
                        "data.stack_id = stack_trace{probe}.get_stackid(ctx, BPF_F_USER_STACK);"
                    ),
                    py_data: "(\"stack_id\", ctypes.c_int),".to_string(),
                    py_callback: format!(
                        "syms = []\n\
                         for addr in b.get_table('stack_trace{probe}').walk(event.stack_id):\n\
                         \x20   sym = b.sym(addr, {sym_pid}, show_module=True, show_offset=True)\n\
                         \x20   syms.append(sym.decode())\n\
                         {var} = '\\n'.join(syms)"
                    ),
                    ..Default::default()
                }
            }
            DefineKind::Peek(peek) => UprobeContext {
                c_data: peek.cast.c_data_field(define.idx),
                c_callback: gen_peek_c_callback(peek, define.idx),
                py_data: format!("(\"peek{}\", {}),", define.idx, peek.cast.ctypes_type()),
                py_callback: format!("{var} = event.peek{}", define.idx),
                ..Default::default()
            },
        })
    }
}

/// Emit the pointer walk for one peek capture. Non-terminal dereferences
/// go through `a{define}{n}` temporaries; offsets only move the pointer
/// expression; a terminal dereference reads into the data field, any other
/// terminal stores the pointer value itself.
fn gen_peek_c_callback(peek: &PeekExpr, idx: usize) -> String {
    let mut decl = String::from("void");
    let mut lines: Vec<String> = Vec::new();
    let mut pointer = format!("ctx->{}", peek.reg);
    let mut temporaries = 0;

    let (terminal, walk) = match peek.ops.split_last() {
        Some((terminal, walk)) => (Some(terminal), walk),
        None => (None, &[][..]),
    };

    for op in walk {
        match op {
            PeekOp::Deref => {
                let name = format!("a{idx}{temporaries}");
                temporaries += 1;
                decl.push_str(&format!(" *{name},"));
                lines.push(format!(
                    "bpf_probe_read(&{name}, sizeof({name}), (void*)({pointer}));"
                ));
                pointer = name;
            }
            PeekOp::Offset(offset) => apply_offset(&mut pointer, *offset),
        }
    }

    match terminal {
        Some(PeekOp::Deref) => lines.push(format!(
            "bpf_probe_read(&data.peek{idx}, sizeof(data.peek{idx}), (void*)({pointer}));"
        )),
        Some(PeekOp::Offset(offset)) => {
            apply_offset(&mut pointer, *offset);
            lines.push(format!("data.peek{idx} = {pointer};"));
        }
        None => lines.push(format!("data.peek{idx} = {pointer};")),
    }

    if temporaries > 0 {
        let decl = format!("{};", decl.trim_end_matches(','));
        lines.insert(0, decl);
    }
    lines.join("\n")
}

fn apply_offset(pointer: &mut String, offset: i64) {
    if offset >= 0 {
        pointer.push_str(&format!(" + {offset}"));
    } else {
        pointer.push_str(&format!(" - {}", -offset));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program;
    use crate::script::PeekCall;
    use std::collections::HashSet;

    fn uprobe(program_text: &str) -> Uprobe {
        program::parse(program_text).unwrap().remove(0)
    }

    fn build(
        program_text: &str,
        extras: &Extras,
    ) -> Result<(UprobeContext, GlobalContext)> {
        let uprobe = uprobe(program_text);
        let known: HashSet<String> =
            uprobe.defines.iter().map(|d| d.varname.clone()).collect();
        let intro = crate::script::introspect(&uprobe.script, &known)?;
        ContextBuilder::new(extras).build(&uprobe, "0x1000", "/bin/app", &intro)
    }

    #[test]
    fn test_pid_fragments() {
        let (ctx, _) = build("*0x1; pid=$pid; {print(pid)};", &Extras::default()).unwrap();
        assert_eq!(ctx.c_data, "u32 pid;");
        assert_eq!(ctx.c_callback, "data.pid = bpf_get_current_pid_tgid() >> 32;");
        assert_eq!(ctx.py_data, "(\"pid\", ctypes.c_uint32),");
        assert!(ctx.py_callback.starts_with("pid = event.pid"));
        assert!(ctx.py_callback.ends_with("print(pid)"));
    }

    #[test]
    fn test_field_count_matches_define_count() {
        let (ctx, _) = build(
            "*0x1; a=$pid,b=$tid,c=$comm,n=$peek(($sp+8*)int64); {print(a, b, c, n)};",
            &Extras::default(),
        )
        .unwrap();
        assert_eq!(ctx.c_data.lines().count(), 4);
        assert_eq!(ctx.py_data.lines().count(), 4);
        // C and ctypes field orders line up position for position.
        let c_fields: Vec<&str> = ctx.c_data.lines().collect();
        let py_fields: Vec<&str> = ctx.py_data.lines().collect();
        assert!(c_fields[0].contains("pid") && py_fields[0].contains("pid"));
        assert!(c_fields[3].contains("peek3") && py_fields[3].contains("peek3"));
    }

    #[test]
    fn test_stack_requires_sym_pid() {
        let err = build("*0x1; s=$stack; {print(s)};", &Extras::default()).unwrap_err();
        assert!(matches!(err, Error::MissingExtra("sym_pid")));
    }

    #[test]
    fn test_stack_table_is_scoped_by_probe_index() {
        let extras = Extras {
            sym_pid: Some(77),
            ..Default::default()
        };
        let mut uprobe = uprobe("*0x1; s=$stack; {print(s)};");
        uprobe.idx = 3;
        for define in &mut uprobe.defines {
            define.uprobe_idx = 3;
        }
        let intro = Introspection::default();
        let (ctx, _) = ContextBuilder::new(&extras)
            .build(&uprobe, "0x1", "/bin/app", &intro)
            .unwrap();
        assert!(ctx.c_global.contains("BPF_STACK_TRACE(stack_trace3, 128);"));
        assert!(ctx.c_callback.contains("stack_trace3.get_stackid"));
        assert!(ctx.py_callback.contains("b.sym(addr, 77"));
    }

    #[test]
    fn test_peek_deref_count_matches_probe_reads() {
        // K dereferences → exactly K bpf_probe_read calls.
        for (expr, derefs) in [
            ("$peek(($sp+8)int64)", 0),
            ("$peek(($rdi*)str)", 1),
            ("$peek(($sp+8**)int64)", 2),
            ("$peek(($sp*+8*-4*)int64)", 3),
        ] {
            let peek = PeekExpr::parse(expr).unwrap();
            let code = gen_peek_c_callback(&peek, 0);
            let reads = code.matches("bpf_probe_read").count();
            assert_eq!(reads, derefs, "expression {expr}");
        }
    }

    #[test]
    fn test_peek_non_deref_terminal_stores_pointer() {
        let peek = PeekExpr::parse("$peek(($sp+8)int64)").unwrap();
        let code = gen_peek_c_callback(&peek, 0);
        assert_eq!(code, "data.peek0 = ctx->sp + 8;");
    }

    #[test]
    fn test_peek_single_deref_reads_into_data() {
        let peek = PeekExpr::parse("$peek(($rdi*)str)").unwrap();
        let code = gen_peek_c_callback(&peek, 0);
        assert_eq!(
            code,
            "bpf_probe_read(&data.peek0, sizeof(data.peek0), (void*)(ctx->di));"
        );
    }

    #[test]
    fn test_peek_temporaries_declared_once() {
        let peek = PeekExpr::parse("$peek(($sp+8**+16*)int64)").unwrap();
        let code = gen_peek_c_callback(&peek, 2);
        let lines: Vec<&str> = code.lines().collect();
        assert_eq!(lines[0], "void *a20, *a21;");
        assert!(lines[1].contains("(void*)(ctx->sp + 8)"));
        assert!(lines[2].contains("(void*)(a20)"));
        assert!(lines[3].contains("(void*)(a21 + 16)"));
        assert!(lines[3].contains("&data.peek2"));
    }

    #[test]
    fn test_peek_without_temporaries_has_no_void_decl() {
        let peek = PeekExpr::parse("$peek(($rdi*)str)").unwrap();
        let code = gen_peek_c_callback(&peek, 0);
        assert!(!code.contains("void "));
    }

    #[test]
    fn test_script_peeks_become_trailing_defines() {
        let uprobe = uprobe("*0x1; pid=$pid; {print(pid, peek('$sp+8*', 'int64'))};");
        let intro = Introspection {
            vars: vec![],
            peeks: vec![PeekCall {
                offsets: "$sp+8*".to_string(),
                cast: "int64".to_string(),
            }],
        };
        let defines = effective_defines(&uprobe, &intro).unwrap();
        assert_eq!(defines.len(), 2);
        assert_eq!(defines[1].varname, "peek1");
        assert!(matches!(defines[1].kind, DefineKind::Peek(_)));
    }

    #[test]
    fn test_script_magics_become_implicit_defines() {
        let uprobe = uprobe("*0x1; ; {print(pid, comm)};");
        let intro = Introspection {
            vars: vec!["pid".to_string(), "comm".to_string()],
            peeks: vec![],
        };
        let defines = effective_defines(&uprobe, &intro).unwrap();
        assert_eq!(defines.len(), 2);
        assert_eq!(defines[0].varname, "pid");
        assert_eq!(defines[1].varname, "comm");
    }

    #[test]
    fn test_peek_helper_emitted_for_script_peeks() {
        let extras = Extras::default();
        let (ctx, globals) = build(
            "*0x1; ; {print(peek('$sp+8*', 'int64'))};",
            &extras,
        )
        .unwrap();
        assert!(globals.py_global.iter().any(|g| g.contains("def make_peek")));
        assert!(ctx.py_callback.contains("peek = make_peek([event.peek0])"));
    }

    #[test]
    fn test_merge_trims_and_joins_with_newlines() {
        let mut a = UprobeContext {
            c_data: "u32 pid;".to_string(),
            ..Default::default()
        };
        let b = UprobeContext {
            c_data: "  u32 tid;  ".to_string(),
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.c_data, "u32 pid;\nu32 tid;");
    }

    #[test]
    fn test_global_context_merge_dedups() {
        let mut a = GlobalContext::default();
        a.c_headers.insert("#include <linux/sched.h>".to_string());
        let mut b = GlobalContext::default();
        b.c_headers.insert("#include <linux/sched.h>".to_string());
        b.py_imports.insert("import os".to_string());
        a.merge(b);
        assert_eq!(a.c_headers.len(), 1);
        assert_eq!(a.py_imports.len(), 1);
    }
}
