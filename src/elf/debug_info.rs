use gimli::{EndianSlice, RunTimeEndian};

use crate::{Error, Result};

type Dwarf<'a> = gimli::Dwarf<EndianSlice<'a, RunTimeEndian>>;
type Unit<'a> = gimli::Unit<EndianSlice<'a, RunTimeEndian>>;
type Entry<'abbrev, 'unit, 'a> =
    gimli::DebuggingInformationEntry<'abbrev, 'unit, EndianSlice<'a, RunTimeEndian>>;

/// A formal parameter of a subprogram. `die_offset` is the absolute
/// `.debug_info` offset of the parameter DIE, kept so the location
/// attribute can be re-read when a probe address is known.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub type_addr: Option<usize>,
    pub die_offset: usize,
}

/// A `DW_TAG_subprogram` DIE with its formal parameters.
#[derive(Debug, Clone)]
pub struct Subprogram {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
    pub params: Vec<Parameter>,
}

impl Subprogram {
    pub fn get_param(&self, varname: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == varname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Structure,
    Pointer,
    Base,
    /// typedef / const / volatile / restrict wrappers, followed through.
    Alias,
    Other,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub offset: u64,
    pub type_addr: Option<usize>,
}

/// A decoded DWARF type DIE, cached by its absolute offset.
#[derive(Debug, Clone)]
pub struct TypeRecord {
    pub tag: TypeTag,
    pub name: Option<String>,
    pub type_addr: Option<usize>,
    pub members: Vec<Member>,
}

fn attr_string(dwarf: &Dwarf<'_>, unit: &Unit<'_>, entry: &Entry<'_, '_, '_>, attr: gimli::DwAt) -> Option<String> {
    entry
        .attr_value(attr)
        .ok()
        .flatten()
        .and_then(|v| dwarf.attr_string(unit, v).ok())
        .map(|s| s.to_string_lossy().to_string())
}

/// Convert a `DW_AT_type` reference to an absolute `.debug_info` offset.
fn absolute_type_offset(unit: &Unit<'_>, entry: &Entry<'_, '_, '_>) -> Option<usize> {
    match entry.attr_value(gimli::DW_AT_type).ok().flatten() {
        Some(gimli::AttributeValue::UnitRef(offset)) => offset
            .to_debug_info_offset(&unit.header)
            .map(|o| o.0),
        Some(gimli::AttributeValue::DebugInfoRef(offset)) => Some(offset.0),
        _ => None,
    }
}

fn pc_range(dwarf: &Dwarf<'_>, unit: &Unit<'_>, entry: &Entry<'_, '_, '_>) -> Option<(u64, u64)> {
    let low_pc = match entry.attr_value(gimli::DW_AT_low_pc).ok().flatten() {
        Some(attr_val) => dwarf.attr_address(unit, attr_val).ok().flatten()?,
        None => return None,
    };
    let high_pc = match entry.attr_value(gimli::DW_AT_high_pc).ok().flatten() {
        Some(gimli::AttributeValue::Udata(offset)) => low_pc + offset,
        Some(attr_val) => dwarf.attr_address(unit, attr_val).ok().flatten()?,
        None => return None,
    };
    Some((low_pc, high_pc))
}

/// Find the outermost subprogram whose `[low_pc, high_pc)` contains `addr`
/// and collect its formal parameters.
pub fn find_subprogram(dwarf: &Dwarf<'_>, addr: u64) -> Result<Option<Subprogram>> {
    let mut units_iter = dwarf.units();
    while let Some(header) = units_iter.next()? {
        let unit = dwarf.unit(header)?;

        let mut entries = unit.entries();
        let mut in_subprogram = false;
        let mut subprogram_depth: isize = 0;
        let mut current_depth: isize = 0;

        while let Some((delta, entry)) = entries.next_dfs()? {
            current_depth += delta;

            if in_subprogram && current_depth <= subprogram_depth {
                in_subprogram = false;
            }
            // Nested subprograms (inlined closures) are not probe scopes.
            if entry.tag() != gimli::DW_TAG_subprogram || in_subprogram {
                continue;
            }
            in_subprogram = true;
            subprogram_depth = current_depth;

            let Some((low_pc, high_pc)) = pc_range(dwarf, &unit, entry) else {
                continue;
            };
            if !(low_pc <= addr && addr < high_pc) {
                continue;
            }

            let name = attr_string(dwarf, &unit, entry, gimli::DW_AT_name)
                .or_else(|| attr_string(dwarf, &unit, entry, gimli::DW_AT_linkage_name))
                .unwrap_or_default();
            let params = collect_params(dwarf, &unit, entry)?;
            return Ok(Some(Subprogram {
                name,
                low_pc,
                high_pc,
                params,
            }));
        }
    }
    Ok(None)
}

fn collect_params(
    dwarf: &Dwarf<'_>,
    unit: &Unit<'_>,
    subprogram: &Entry<'_, '_, '_>,
) -> Result<Vec<Parameter>> {
    let mut params = Vec::new();
    let mut tree = unit.entries_tree(Some(subprogram.offset()))?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != gimli::DW_TAG_formal_parameter {
            continue;
        }
        let Some(name) = attr_string(dwarf, unit, entry, gimli::DW_AT_name) else {
            continue;
        };
        let Some(die_offset) = entry
            .offset()
            .to_debug_info_offset(&unit.header)
            .map(|o| o.0)
        else {
            continue;
        };
        params.push(Parameter {
            name,
            type_addr: absolute_type_offset(unit, entry),
            die_offset,
        });
    }
    Ok(params)
}

/// Locate the unit containing an absolute `.debug_info` offset.
fn unit_containing<'a>(dwarf: &Dwarf<'a>, offset: usize) -> Result<Option<(Unit<'a>, usize)>> {
    let mut units_iter = dwarf.units();
    while let Some(header) = units_iter.next()? {
        let start = match header.offset() {
            gimli::UnitSectionOffset::DebugInfoOffset(o) => o.0,
            gimli::UnitSectionOffset::DebugTypesOffset(o) => o.0,
        };
        let end = start + header.length_including_self();
        if offset < start || offset >= end {
            continue;
        }
        let unit = dwarf.unit(header)?;
        return Ok(Some((unit, offset - start)));
    }
    Ok(None)
}

/// Re-read a parameter's `DW_AT_location`, resolving a location-list
/// reference to the entry covering `addr`.
pub fn resolve_param_location<'a>(
    dwarf: &Dwarf<'a>,
    die_offset: usize,
    addr: u64,
    varname: &str,
) -> Result<(gimli::Expression<EndianSlice<'a, RunTimeEndian>>, gimli::Encoding)> {
    let (unit, unit_offset) = unit_containing(dwarf, die_offset)?
        .ok_or_else(|| Error::VarNotFound {
            addr,
            varname: varname.to_string(),
        })?;
    let entry = unit.entry(gimli::UnitOffset(unit_offset))?;
    let encoding = unit.encoding();

    let attr = entry
        .attr_value(gimli::DW_AT_location)?
        .ok_or_else(|| Error::VarNotFound {
            addr,
            varname: varname.to_string(),
        })?;

    match attr {
        gimli::AttributeValue::Exprloc(expression) => Ok((expression, encoding)),
        other => {
            let mut locations =
                dwarf
                    .attr_locations(&unit, other)?
                    .ok_or_else(|| Error::VarNotFound {
                        addr,
                        varname: varname.to_string(),
                    })?;
            while let Some(entry) = locations.next()? {
                if entry.range.begin <= addr && addr < entry.range.end {
                    return Ok((entry.data, encoding));
                }
            }
            Err(Error::VarNotFound {
                addr,
                varname: varname.to_string(),
            })
        }
    }
}

/// Decode the type DIE at an absolute `.debug_info` offset.
pub fn decode_type(dwarf: &Dwarf<'_>, offset: usize) -> Result<TypeRecord> {
    let (unit, unit_offset) = unit_containing(dwarf, offset)?
        .ok_or_else(|| Error::MemberNotFound(format!("type at {offset:#x}")))?;

    let mut tree = unit.entries_tree(Some(gimli::UnitOffset(unit_offset)))?;
    let root = tree.root()?;
    let entry = root.entry();

    let tag = match entry.tag() {
        gimli::DW_TAG_structure_type => TypeTag::Structure,
        gimli::DW_TAG_pointer_type => TypeTag::Pointer,
        gimli::DW_TAG_base_type => TypeTag::Base,
        gimli::DW_TAG_typedef
        | gimli::DW_TAG_const_type
        | gimli::DW_TAG_volatile_type
        | gimli::DW_TAG_restrict_type => TypeTag::Alias,
        _ => TypeTag::Other,
    };
    let name = attr_string(dwarf, &unit, entry, gimli::DW_AT_name);
    let type_addr = absolute_type_offset(&unit, entry);

    let mut members = Vec::new();
    if tag == TypeTag::Structure {
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }
            let Some(name) = attr_string(dwarf, &unit, entry, gimli::DW_AT_name) else {
                continue;
            };
            let offset = match entry
                .attr_value(gimli::DW_AT_data_member_location)
                .ok()
                .flatten()
            {
                Some(gimli::AttributeValue::Udata(n)) => n,
                Some(gimli::AttributeValue::Sdata(n)) if n >= 0 => n as u64,
                _ => 0,
            };
            members.push(Member {
                name,
                offset,
                type_addr: absolute_type_offset(&unit, entry),
            });
        }
    }

    Ok(TypeRecord {
        tag,
        name,
        type_addr,
        members,
    })
}
