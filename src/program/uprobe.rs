use std::sync::OnceLock;

use regex::Regex;

use crate::elf::Interpreter;
use crate::{Error, Result};

/// x86-64 registers usable in peek expressions and location strings.
/// Each entry is `(dwarf name, pt_regs field name)`; users may write either
/// form, the generated C always uses the pt_regs field.
pub const REGISTERS: [(&str, &str); 17] = [
    ("rax", "ax"),
    ("rbx", "bx"),
    ("rcx", "cx"),
    ("rdx", "dx"),
    ("rsi", "si"),
    ("rdi", "di"),
    ("rbp", "bp"),
    ("rsp", "sp"),
    ("r8", "r8"),
    ("r9", "r9"),
    ("r10", "r10"),
    ("r11", "r11"),
    ("r12", "r12"),
    ("r13", "r13"),
    ("r14", "r14"),
    ("r15", "r15"),
    ("rip", "ip"),
];

/// Normalize a register token to its pt_regs field name.
pub fn normalize_register(token: &str) -> Option<&'static str> {
    REGISTERS
        .iter()
        .find(|(dwarf, ptregs)| *dwarf == token || *ptregs == token)
        .map(|(_, ptregs)| *ptregs)
}

/// One probe site parsed from the trace program.
#[derive(Debug, Clone)]
pub struct Uprobe {
    pub idx: usize,
    pub address: Address,
    pub defines: Vec<Define>,
    pub script: String,
}

/// A probe target in one of its three syntactic forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `*0xHEX`, a literal instruction address.
    Literal(u64),
    /// `path/suffix.go:NN`, resolved through `.debug_line`.
    FileLine { file: String, line: u32 },
    /// A fully-qualified function name; `/name/` marks a symbol regex.
    Function { name: String, regex: bool },
}

impl Address {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidAddress(raw.to_string()));
        }

        if let Some(literal) = raw.strip_prefix('*') {
            let digits = literal
                .strip_prefix("0x")
                .ok_or_else(|| Error::InvalidAddress(raw.to_string()))?;
            let addr = u64::from_str_radix(digits, 16)
                .map_err(|_| Error::InvalidAddress(raw.to_string()))?;
            return Ok(Address::Literal(addr));
        }

        if raw.len() > 2 && raw.starts_with('/') && raw.ends_with('/') {
            return Ok(Address::Function {
                name: raw[1..raw.len() - 1].to_string(),
                regex: true,
            });
        }

        if let Some((file, line)) = raw.rsplit_once(':') {
            if !file.is_empty() && !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()) {
                let line = line
                    .parse()
                    .map_err(|_| Error::InvalidAddress(raw.to_string()))?;
                return Ok(Address::FileLine {
                    file: file.to_string(),
                    line,
                });
            }
        }

        Ok(Address::Function {
            name: raw.to_string(),
            regex: false,
        })
    }

    /// Resolve this address to a lowercase `0xHEX` string.
    pub fn interpret(&self, interpreter: &Interpreter) -> Result<String> {
        match self {
            Address::Literal(addr) => Ok(format!("{addr:#x}")),
            Address::FileLine { file, line } => {
                interpreter.find_address_by_file_line(file, *line)
            }
            Address::Function { name, .. } => {
                interpreter.find_address_by_function_name(name)
            }
        }
    }
}

/// A single `name = expression` clause in a probe's define list.
#[derive(Debug, Clone)]
pub struct Define {
    pub idx: usize,
    pub uprobe_idx: usize,
    pub varname: String,
    pub kind: DefineKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefineKind {
    Pid,
    Tid,
    Comm,
    Stack,
    Peek(PeekExpr),
}

impl Define {
    pub fn parse(idx: usize, uprobe_idx: usize, varname: &str, express: &str) -> Result<Self> {
        let kind = match express {
            "$pid" => DefineKind::Pid,
            "$tid" => DefineKind::Tid,
            "$comm" => DefineKind::Comm,
            "$stack" => DefineKind::Stack,
            e if e.starts_with("$peek") => DefineKind::Peek(PeekExpr::parse(e)?),
            other => return Err(Error::InvalidDefine(other.to_string())),
        };
        Ok(Define {
            idx,
            uprobe_idx,
            varname: varname.to_string(),
            kind,
        })
    }
}

/// A parsed `$peek(($reg ops)cast)` expression: start at a register, walk
/// pointer dereferences and byte offsets, cast the final value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeekExpr {
    /// pt_regs field name, e.g. `sp` or `di`.
    pub reg: &'static str,
    pub ops: Vec<PeekOp>,
    pub cast: CastType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekOp {
    Deref,
    Offset(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastType {
    Str,
    Int64,
    Int32,
    Int8,
    Float64,
}

impl CastType {
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "str" => Ok(CastType::Str),
            "int64" => Ok(CastType::Int64),
            "int32" => Ok(CastType::Int32),
            "int8" => Ok(CastType::Int8),
            "float64" => Ok(CastType::Float64),
            other => Err(Error::InvalidPeek(format!("unknown cast type: {other}"))),
        }
    }

    /// The C struct field declaration for `data.peek{idx}`.
    pub fn c_data_field(&self, idx: usize) -> String {
        match self {
            CastType::Str => format!("char peek{idx}[128];"),
            CastType::Int64 => format!("u64 peek{idx};"),
            CastType::Int32 => format!("u32 peek{idx};"),
            CastType::Int8 => format!("u8 peek{idx};"),
            CastType::Float64 => format!("double peek{idx};"),
        }
    }

    /// The matching ctypes field type on the Python side.
    pub fn ctypes_type(&self) -> &'static str {
        match self {
            CastType::Str => "ctypes.c_char * 128",
            CastType::Int64 => "ctypes.c_int64",
            CastType::Int32 => "ctypes.c_int32",
            CastType::Int8 => "ctypes.c_int8",
            CastType::Float64 => "ctypes.c_double",
        }
    }
}

fn peek_pattern() -> &'static Regex {
    static PAT: OnceLock<Regex> = OnceLock::new();
    PAT.get_or_init(|| {
        Regex::new(r"^\$peek\(\((?P<body>[^)]+)\)(?P<cast>[a-z0-9]+)\)$").unwrap()
    })
}

fn op_pattern() -> &'static Regex {
    static PAT: OnceLock<Regex> = OnceLock::new();
    PAT.get_or_init(|| Regex::new(r"\*|[+-]\d+").unwrap())
}

impl PeekExpr {
    /// Parse the define-clause form, e.g. `$peek(($sp+8*)int64)`.
    pub fn parse(express: &str) -> Result<Self> {
        let caps = peek_pattern()
            .captures(express)
            .ok_or_else(|| Error::InvalidPeek(express.to_string()))?;
        let cast = CastType::parse(&caps["cast"])?;
        Self::from_parts(&caps["body"], cast, express)
    }

    /// Parse the introspected call form: `peek("<$reg ops>", "<cast>")`.
    pub fn from_call(offsets: &str, cast: &str) -> Result<Self> {
        let cast = CastType::parse(cast)?;
        Self::from_parts(offsets, cast, offsets)
    }

    fn from_parts(body: &str, cast: CastType, express: &str) -> Result<Self> {
        let body = body
            .strip_prefix('$')
            .ok_or_else(|| Error::InvalidPeek(express.to_string()))?;
        let reg_end = body
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(body.len());
        let reg = normalize_register(&body[..reg_end])
            .ok_or_else(|| Error::InvalidPeek(express.to_string()))?;

        let rest = &body[reg_end..];
        let mut ops = Vec::new();
        let mut consumed = 0;
        for m in op_pattern().find_iter(rest) {
            if m.start() != consumed {
                return Err(Error::InvalidPeek(express.to_string()));
            }
            consumed = m.end();
            ops.push(match m.as_str() {
                "*" => PeekOp::Deref,
                offset => PeekOp::Offset(
                    offset
                        .parse()
                        .map_err(|_| Error::InvalidPeek(express.to_string()))?,
                ),
            });
        }
        if consumed != rest.len() {
            return Err(Error::InvalidPeek(express.to_string()));
        }

        Ok(PeekExpr { reg, ops, cast })
    }
}
