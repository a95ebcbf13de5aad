use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid program: pattern does not match")]
    InvalidProgram,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("ambiguous filename: {0}")]
    AmbiguousFilename(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("ambiguous function name: {0}")]
    AmbiguousFunction(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("member not found: {0}")]
    MemberNotFound(String),

    #[error("invalid define expression: {0}")]
    InvalidDefine(String),

    #[error("invalid peek expression: {0}")]
    InvalidPeek(String),

    #[error("duplicate variable '{varname}' in probe {probe}")]
    DuplicateVar { probe: usize, varname: String },

    #[error("invalid var: {0}")]
    InvalidVar(String),

    #[error("invalid callback script: {0}")]
    InvalidScript(String),

    #[error("unknown dwarf op: {0}")]
    InvalidDwarfOp(String),

    #[error("cyclic type chain at offset {0:#x}")]
    CyclicType(usize),

    #[error("no location for variable '{varname}' at {addr:#x}")]
    VarNotFound { addr: u64, varname: String },

    #[error("no call frame information covers address {0:#x}")]
    CfaNotFound(u64),

    #[error("missing extra: {0}")]
    MissingExtra(&'static str),

    #[error("invalid extra: {0}")]
    InvalidExtra(String),

    #[error("debug file has no dwarf info: {0}")]
    NoDebugSymbols(String),

    #[error("subprocess failed: {0}")]
    Subprocess(String),

    #[error("process is not running")]
    ProcessNotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DWARF error: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("object parse error: {0}")]
    Object(#[from] object::read::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
