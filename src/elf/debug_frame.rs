use gimli::{EndianSlice, RunTimeEndian, UnwindSection};

use super::location;
use crate::{Error, Result};

/// Resolve the CFA expression for `addr` inside the frame whose FDE starts
/// at `low_pc`, e.g. `$sp+16`. Only register+offset CFA rules are
/// renderable; anything else is an unsupported op.
pub fn find_cfa(
    frame: &gimli::DebugFrame<EndianSlice<'_, RunTimeEndian>>,
    low_pc: u64,
    addr: u64,
) -> Result<String> {
    let bases = gimli::BaseAddresses::default();
    let mut entries = frame.entries(&bases);
    while let Some(entry) = entries.next()? {
        let partial = match entry {
            gimli::CieOrFde::Cie(_) => continue,
            gimli::CieOrFde::Fde(partial) => partial,
        };
        let fde = partial.parse(UnwindSection::cie_from_offset)?;
        if fde.initial_address() != low_pc {
            continue;
        }

        let mut ctx = gimli::UnwindContext::new();
        let mut table = fde.rows(frame, &bases, &mut ctx)?;
        while let Some(row) = table.next_row()? {
            if !row.contains(addr) {
                continue;
            }
            return match row.cfa() {
                gimli::CfaRule::RegisterAndOffset { register, offset } => {
                    let name = location::register_name(register.0).ok_or_else(|| {
                        Error::InvalidDwarfOp(format!("cfa register {}", register.0))
                    })?;
                    Ok(format!("${name}{offset:+}"))
                }
                rule => Err(Error::InvalidDwarfOp(format!("cfa rule {rule:?}"))),
            };
        }
    }
    Err(Error::CfaNotFound(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal `.debug_frame`: one CIE (`def_cfa r7, 8`) and one FDE for
    /// `[0x1000, 0x1100)` that bumps the CFA offset to 16 after 4 bytes.
    fn section() -> Vec<u8> {
        let mut bytes = Vec::new();
        // CIE: length, id=0xffffffff, version 1, empty augmentation,
        // code align 1, data align -8, RA 16, DW_CFA_def_cfa(7, 8)
        bytes.extend_from_slice(&12u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        bytes.extend_from_slice(&[0x01, 0x00, 0x01, 0x78, 0x10]);
        bytes.extend_from_slice(&[0x0c, 0x07, 0x08]);
        // FDE: length, cie offset 0, initial location, range,
        // DW_CFA_advance_loc(4), DW_CFA_def_cfa_offset(16)
        bytes.extend_from_slice(&23u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0x1000u64.to_le_bytes());
        bytes.extend_from_slice(&0x100u64.to_le_bytes());
        bytes.extend_from_slice(&[0x44, 0x0e, 0x10]);
        bytes
    }

    fn frame(bytes: &[u8]) -> gimli::DebugFrame<EndianSlice<'_, RunTimeEndian>> {
        let mut frame = gimli::DebugFrame::new(bytes, RunTimeEndian::Little);
        frame.set_address_size(8);
        frame
    }

    #[test]
    fn test_cfa_in_first_row() {
        let bytes = section();
        let cfa = find_cfa(&frame(&bytes), 0x1000, 0x1002).unwrap();
        assert_eq!(cfa, "$sp+8");
    }

    #[test]
    fn test_cfa_after_advance() {
        let bytes = section();
        let cfa = find_cfa(&frame(&bytes), 0x1000, 0x1008).unwrap();
        assert_eq!(cfa, "$sp+16");
    }

    #[test]
    fn test_cfa_requires_matching_fde() {
        let bytes = section();
        assert!(matches!(
            find_cfa(&frame(&bytes), 0x2000, 0x2002),
            Err(Error::CfaNotFound(_))
        ));
    }

    #[test]
    fn test_cfa_rendering_uses_runtime_register_names() {
        let bytes = section();
        let cfa = find_cfa(&frame(&bytes), 0x1000, 0x1002).unwrap();
        assert!(!cfa.contains("rsp"));
    }
}
