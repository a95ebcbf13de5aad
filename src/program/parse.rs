use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use super::uprobe::{Address, Define, Uprobe};
use crate::{Error, Result};

fn program_pattern() -> &'static Regex {
    static PAT: OnceLock<Regex> = OnceLock::new();
    PAT.get_or_init(|| {
        Regex::new(
            r"(?sx)
            (?P<addr> [^;]+ ) ;        # e.g. *0x1103c02 or main.go:42
            \s*
            (?P<defines> [^;]* ) ;     # e.g. n=$peek(($sp+8*)int64),s=$stack
            \s*
            \{ (?P<script> .*? ) \};   # callback body, up to the first };
            ",
        )
        .unwrap()
    })
}

/// Parse a trace program into its ordered probe list.
pub fn parse(program: &str) -> Result<Vec<Uprobe>> {
    let pat = program_pattern();
    if !pat.is_match(program) {
        return Err(Error::InvalidProgram);
    }

    let mut uprobes = Vec::new();
    for (idx, caps) in pat.captures_iter(program).enumerate() {
        let address = Address::parse(caps["addr"].trim())?;
        let defines = parse_defines(idx, caps["defines"].trim())?;
        let script = caps["script"].trim().to_string();
        uprobes.push(Uprobe {
            idx,
            address,
            defines,
            script,
        });
    }
    Ok(uprobes)
}

fn parse_defines(uprobe_idx: usize, clause: &str) -> Result<Vec<Define>> {
    let mut defines = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for entry in clause.split(',') {
        // Entries without '=' are skipped, so a trailing comma or an empty
        // define clause is not an error.
        let Some((varname, express)) = entry.split_once('=') else {
            continue;
        };
        let varname = varname.trim();
        if !seen.insert(varname.to_string()) {
            return Err(Error::DuplicateVar {
                probe: uprobe_idx,
                varname: varname.to_string(),
            });
        }
        defines.push(Define::parse(
            defines.len(),
            uprobe_idx,
            varname,
            express.trim(),
        )?);
    }
    Ok(defines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::uprobe::DefineKind;

    #[test]
    fn test_single_probe() {
        let uprobes = parse("*0xdeadbeef; pid=$pid; {print(pid)};").unwrap();
        assert_eq!(uprobes.len(), 1);
        assert_eq!(uprobes[0].idx, 0);
        assert_eq!(uprobes[0].address, Address::Literal(0xdeadbeef));
        assert_eq!(uprobes[0].defines.len(), 1);
        assert_eq!(uprobes[0].defines[0].varname, "pid");
        assert_eq!(uprobes[0].script, "print(pid)");
    }

    #[test]
    fn test_probe_ordering_is_textual() {
        let program = "\
            *0x1; pid=$pid; {print(pid)};\n\
            main.go:42; n=$peek(($sp+8*)int64); {print(n)};\n\
            pkg.Func; c=$comm; {print(c)};\n";
        let uprobes = parse(program).unwrap();
        assert_eq!(uprobes.len(), 3);
        for (i, uprobe) in uprobes.iter().enumerate() {
            assert_eq!(uprobe.idx, i);
        }
        assert_eq!(uprobes[1].address, Address::FileLine {
            file: "main.go".to_string(),
            line: 42
        });
        assert_eq!(
            uprobes[2].address,
            Address::Function {
                name: "pkg.Func".to_string(),
                regex: false
            }
        );
    }

    #[test]
    fn test_multiline_script() {
        let uprobes =
            parse("*0x1; pid=$pid; {\nif pid > 0:\n    print(pid)\n};").unwrap();
        assert_eq!(uprobes[0].script, "if pid > 0:\n    print(pid)");
    }

    #[test]
    fn test_empty_program() {
        assert!(matches!(parse(""), Err(Error::InvalidProgram)));
        assert!(matches!(parse("no probes here"), Err(Error::InvalidProgram)));
    }

    #[test]
    fn test_define_ordering_preserved() {
        let uprobes =
            parse("*0x1; a=$pid,b=$tid,c=$comm; {print(a, b, c)};").unwrap();
        let kinds: Vec<_> = uprobes[0].defines.iter().map(|d| d.kind.clone()).collect();
        assert_eq!(kinds, vec![DefineKind::Pid, DefineKind::Tid, DefineKind::Comm]);
        let idxs: Vec<_> = uprobes[0].defines.iter().map(|d| d.idx).collect();
        assert_eq!(idxs, vec![0, 1, 2]);
    }

    #[test]
    fn test_entries_without_equals_are_skipped() {
        let uprobes = parse("*0x1; pid=$pid,, junk ,tid=$tid; {print(pid)};").unwrap();
        assert_eq!(uprobes[0].defines.len(), 2);
    }

    #[test]
    fn test_empty_define_clause() {
        let uprobes = parse("*0x1; ; {print('hit')};").unwrap();
        assert!(uprobes[0].defines.is_empty());
    }

    #[test]
    fn test_unknown_define_fails_before_elf_work() {
        assert!(matches!(
            parse("*0x1; foo=$foo; {print(foo)};"),
            Err(Error::InvalidDefine(_))
        ));
    }

    #[test]
    fn test_duplicate_varname() {
        assert!(matches!(
            parse("*0x1; pid=$pid,pid=$tid; {print(pid)};"),
            Err(Error::DuplicateVar { probe: 0, .. })
        ));
    }

    #[test]
    fn test_script_stops_at_first_closing_marker() {
        let uprobes = parse("*0x1; pid=$pid; {print(pid)};\n*0x2; tid=$tid; {print(tid)};").unwrap();
        assert_eq!(uprobes.len(), 2);
        assert_eq!(uprobes[0].script, "print(pid)");
        assert_eq!(uprobes[1].script, "print(tid)");
    }
}
