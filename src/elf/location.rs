use gimli::{EndianSlice, RunTimeEndian};

use crate::{Error, Result};

/// DWARF register number → runtime location name for x86-64.
/// The names line up with what peek expressions accept, so a rendered
/// location can be pasted straight into a `$peek(...)` clause.
const REGISTER_NAMES: [(u16, &str); 17] = [
    (0, "ax"),
    (1, "dx"),
    (2, "cx"),
    (3, "bx"),
    (4, "si"),
    (5, "di"),
    (6, "bp"),
    (7, "sp"),
    (8, "r8"),
    (9, "r9"),
    (10, "r10"),
    (11, "r11"),
    (12, "r12"),
    (13, "r13"),
    (14, "r14"),
    (15, "r15"),
    (16, "rip"),
];

pub fn register_name(regno: u16) -> Option<&'static str> {
    REGISTER_NAMES
        .iter()
        .find(|(no, _)| *no == regno)
        .map(|(_, name)| *name)
}

/// Render a DWARF location expression into a runtime location string.
///
/// `DW_OP_regN` becomes `$name`; `DW_OP_fbreg OFF` becomes the CFA
/// expression followed by the signed offset and a trailing dereference
/// marker `*`; `DW_OP_piece` becomes a `;` separator and
/// `DW_OP_call_frame_cfa` the CFA expression itself, dereferenced. Any
/// other op is unsupported. The CFA expression is computed lazily since
/// register locations never need it.
pub fn render_expression<F>(
    expression: gimli::Expression<EndianSlice<'_, RunTimeEndian>>,
    encoding: gimli::Encoding,
    mut cfa: F,
) -> Result<String>
where
    F: FnMut() -> Result<String>,
{
    let mut rendered = String::new();
    let mut ops = expression.operations(encoding);
    while let Some(op) = ops.next()? {
        match op {
            gimli::Operation::Register { register } => {
                let name = register_name(register.0)
                    .ok_or_else(|| Error::InvalidDwarfOp(format!("DW_OP_reg{}", register.0)))?;
                rendered.push('$');
                rendered.push_str(name);
            }
            gimli::Operation::FrameOffset { offset } => {
                rendered.push_str(&cfa()?);
                rendered.push_str(&format!("{offset:+}*"));
            }
            gimli::Operation::Piece { .. } => rendered.push(';'),
            gimli::Operation::CallFrameCFA => {
                rendered.push_str(&cfa()?);
                rendered.push('*');
            }
            other => return Err(Error::InvalidDwarfOp(format!("{other:?}"))),
        }
    }
    Ok(rendered)
}
