use std::fs::File;
use std::path::Path;

use gimli::{EndianSlice, RunTimeEndian, SectionId};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol};

use crate::{Error, Result};

/// A symbol table entry kept after the ELF is unmapped.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub name: String,
    pub address: u64,
}

/// Parsed DWARF sections with their associated endianness.
/// Owns all section data (copied from the mmap) so there are no lifetime
/// constraints on the interpreter that holds it.
pub struct LoadedDwarf {
    sections: gimli::DwarfSections<Vec<u8>>,
    debug_frame: Vec<u8>,
    endian: RunTimeEndian,
    pub symbols: Vec<SymbolEntry>,
}

/// Load DWARF sections and the symbol table from an ELF file. Section data
/// is copied into owned `Vec<u8>` so the returned value is self-contained.
pub fn load(path: &Path) -> Result<LoadedDwarf> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let object = object::File::parse(&*mmap)?;

    if object.section_by_name(".debug_info").is_none() {
        return Err(Error::NoDebugSymbols(path.display().to_string()));
    }

    let endian = if object.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let load_section = |id: SectionId| -> std::result::Result<Vec<u8>, gimli::Error> {
        let data = object
            .section_by_name(id.name())
            .and_then(|section| section.data().ok())
            .unwrap_or(&[]);
        Ok(data.to_vec())
    };
    let sections = gimli::DwarfSections::load(&load_section)
        .map_err(Error::Dwarf)?;

    let debug_frame = object
        .section_by_name(".debug_frame")
        .and_then(|section| section.data().ok())
        .map(|data| data.to_vec())
        .unwrap_or_default();

    let symbols = object
        .symbols()
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(SymbolEntry {
                name: name.to_string(),
                address: sym.address(),
            })
        })
        .collect();

    Ok(LoadedDwarf {
        sections,
        debug_frame,
        endian,
        symbols,
    })
}

impl LoadedDwarf {
    /// Borrow the owned sections as `EndianSlice` references for DWARF traversal.
    pub fn borrow(&self) -> gimli::Dwarf<EndianSlice<'_, RunTimeEndian>> {
        self.sections
            .borrow(|section| EndianSlice::new(section, self.endian))
    }

    /// Borrow `.debug_frame` as an unwind section.
    pub fn debug_frame(&self) -> gimli::DebugFrame<EndianSlice<'_, RunTimeEndian>> {
        let mut frame = gimli::DebugFrame::new(&self.debug_frame, self.endian);
        frame.set_address_size(8);
        frame
    }
}
