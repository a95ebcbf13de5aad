mod debug_frame;
mod debug_info;
mod debug_line;
mod loader;
mod location;
mod symtab;

pub use debug_info::{Member, Parameter, Subprogram, TypeRecord, TypeTag};
pub use debug_line::LineEntry;
pub use loader::SymbolEntry;
pub use location::register_name;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{Error, Result};

/// Answers address and location questions about one debug-info-bearing ELF.
///
/// Every section is decoded at most once: the line table, subprogram
/// lookups, type records, CFA rows and final variable locations are all
/// memoized for the lifetime of the interpreter.
pub struct Interpreter {
    path: PathBuf,
    loaded: loader::LoadedDwarf,
    line_table: Mutex<Option<Vec<LineEntry>>>,
    subprograms: Mutex<HashMap<u64, Option<Subprogram>>>,
    types: Mutex<HashMap<usize, TypeRecord>>,
    cfa_cache: Mutex<HashMap<(u64, u64), String>>,
    var_locations: Mutex<HashMap<(u64, String), String>>,
}

impl Interpreter {
    pub fn open(path: &Path) -> Result<Self> {
        let loaded = loader::load(path)?;
        tracing::debug!(
            "loaded dwarf sections from {} ({} symbols)",
            path.display(),
            loaded.symbols.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            loaded,
            line_table: Mutex::new(None),
            subprograms: Mutex::new(HashMap::new()),
            types: Mutex::new(HashMap::new()),
            cfa_cache: Mutex::new(HashMap::new()),
            var_locations: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address of a function, by exact-suffix symbol table match.
    pub fn find_address_by_function_name(&self, function_name: &str) -> Result<String> {
        let candidates = symtab::findall_addresses(&self.loaded.symbols, function_name);
        if candidates.is_empty() {
            return Err(Error::FunctionNotFound(function_name.to_string()));
        }
        if candidates.len() > 1 {
            let names: Vec<_> = candidates.iter().map(|s| s.name.as_str()).collect();
            return Err(Error::AmbiguousFunction(names.join(", ")));
        }
        let sym = candidates[0];
        tracing::info!("uprobe {} matches symbol {}", function_name, sym.name);
        Ok(format!("{:#x}", sym.address))
    }

    /// Address of the first executable statement at `file-suffix:line`.
    pub fn find_address_by_file_line(&self, suffix: &str, line: u32) -> Result<String> {
        self.with_line_table(|entries| {
            let filenames = debug_line::findall_filenames(entries, suffix);
            if filenames.len() > 1 {
                let names: Vec<_> = filenames.into_iter().collect();
                return Err(Error::AmbiguousFilename(names.join(", ")));
            }
            let Some(filename) = filenames.into_iter().next() else {
                return Err(Error::FileNotFound(suffix.to_string()));
            };

            let addr = debug_line::find_stmt_address(entries, suffix, line)
                .ok_or_else(|| {
                    Error::InvalidAddress(format!("no statement at {suffix}:{line}"))
                })?;
            tracing::info!("uprobe {}:{} matches {}", suffix, line, filename);
            Ok(format!("{addr:#x}"))
        })
    }

    /// Runtime location of a formal parameter at an instruction address:
    /// a register (`$di`) or a dereferenced CFA offset (`$sp+16-8*`).
    pub fn find_var_location(&self, addr: u64, varname: &str) -> Result<String> {
        let key = (addr, varname.to_string());
        if let Some(cached) = self.var_locations.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }

        let subprogram = self.subprogram_at(addr)?.ok_or_else(|| Error::VarNotFound {
            addr,
            varname: varname.to_string(),
        })?;
        let param = subprogram
            .get_param(varname)
            .ok_or_else(|| Error::VarNotFound {
                addr,
                varname: varname.to_string(),
            })?;

        let dwarf = self.loaded.borrow();
        let (expression, encoding) =
            debug_info::resolve_param_location(&dwarf, param.die_offset, addr, varname)?;
        let rendered = location::render_expression(expression, encoding, || {
            self.cfa(subprogram.low_pc, addr)
        })?;

        self.var_locations
            .lock()
            .unwrap()
            .insert(key, rendered.clone());
        Ok(rendered)
    }

    /// Resolve `name(.member)*`: the base parameter location with every
    /// struct member of the dotted path chased through the type graph.
    pub fn resolve_var_expression(&self, addr: u64, expr: &str) -> Result<String> {
        let mut parts = expr.split('.');
        let varname = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidVar(expr.to_string()))?;
        let path: Vec<&str> = parts.collect();

        let location = self.find_var_location(addr, varname)?;
        if path.is_empty() {
            return Ok(location);
        }

        let subprogram = self.subprogram_at(addr)?.ok_or_else(|| Error::VarNotFound {
            addr,
            varname: varname.to_string(),
        })?;
        let type_addr = subprogram
            .get_param(varname)
            .and_then(|p| p.type_addr)
            .ok_or_else(|| Error::MemberNotFound(path[0].to_string()))?;

        self.chase_members(location, type_addr, &path)
    }

    /// Walk a dotted member path: pointers append a dereference, structure
    /// members append their offset plus a dereference.
    pub fn chase_members(
        &self,
        mut location: String,
        mut type_addr: usize,
        path: &[&str],
    ) -> Result<String> {
        for member_name in path {
            // One visited set per path step: a list type may legitimately
            // be revisited by `next.next`, a cycle within one step cannot.
            let mut visited: HashSet<usize> = HashSet::new();
            loop {
                if !visited.insert(type_addr) {
                    return Err(Error::CyclicType(type_addr));
                }
                let record = self.type_record(type_addr)?;
                match record.tag {
                    TypeTag::Pointer => {
                        location.push('*');
                        type_addr = record
                            .type_addr
                            .ok_or_else(|| Error::MemberNotFound(member_name.to_string()))?;
                    }
                    TypeTag::Alias => {
                        type_addr = record
                            .type_addr
                            .ok_or_else(|| Error::MemberNotFound(member_name.to_string()))?;
                    }
                    TypeTag::Structure => break,
                    _ => return Err(Error::MemberNotFound(member_name.to_string())),
                }
            }

            let record = self.type_record(type_addr)?;
            let member = record
                .members
                .iter()
                .find(|m| m.name == *member_name)
                .ok_or_else(|| Error::MemberNotFound(member_name.to_string()))?;
            location.push_str(&format!("+{}*", member.offset));
            type_addr = member
                .type_addr
                .ok_or_else(|| Error::MemberNotFound(member_name.to_string()))?;
        }
        Ok(location)
    }

    fn with_line_table<T>(&self, f: impl FnOnce(&[LineEntry]) -> Result<T>) -> Result<T> {
        let mut guard = self.line_table.lock().unwrap();
        if guard.is_none() {
            let dwarf = self.loaded.borrow();
            let entries = debug_line::build_line_table(&dwarf)?;
            tracing::debug!("decoded {} line table entries", entries.len());
            *guard = Some(entries);
        }
        f(guard.as_ref().unwrap())
    }

    /// The outermost subprogram whose pc range contains `addr`, if any.
    pub fn subprogram_at(&self, addr: u64) -> Result<Option<Subprogram>> {
        if let Some(cached) = self.subprograms.lock().unwrap().get(&addr) {
            return Ok(cached.clone());
        }
        let dwarf = self.loaded.borrow();
        let subprogram = debug_info::find_subprogram(&dwarf, addr)?;
        if let Some(sub) = &subprogram {
            tracing::debug!(
                "address {:#x} is inside {} [{:#x}, {:#x})",
                addr,
                sub.name,
                sub.low_pc,
                sub.high_pc
            );
        }
        self.subprograms
            .lock()
            .unwrap()
            .insert(addr, subprogram.clone());
        Ok(subprogram)
    }

    fn type_record(&self, type_addr: usize) -> Result<TypeRecord> {
        if let Some(cached) = self.types.lock().unwrap().get(&type_addr) {
            return Ok(cached.clone());
        }
        let dwarf = self.loaded.borrow();
        let record = debug_info::decode_type(&dwarf, type_addr)?;
        self.types
            .lock()
            .unwrap()
            .insert(type_addr, record.clone());
        Ok(record)
    }

    fn cfa(&self, low_pc: u64, addr: u64) -> Result<String> {
        let key = (low_pc, addr);
        if let Some(cached) = self.cfa_cache.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }
        let frame = self.loaded.debug_frame();
        let cfa = debug_frame::find_cfa(&frame, low_pc, addr)?;
        self.cfa_cache.lock().unwrap().insert(key, cfa.clone());
        Ok(cfa)
    }
}
