use std::collections::BTreeSet;

use gimli::{EndianSlice, RunTimeEndian};
use rayon::prelude::*;

use crate::Result;

/// One row of the decoded `.debug_line` program.
#[derive(Debug, Clone)]
pub struct LineEntry {
    pub address: u64,
    pub file: String,
    pub line: u32,
    pub is_stmt: bool,
}

/// Decode every compilation unit's line program into a flat entry list.
/// Entries keep compilation-unit order and row order within a unit, so
/// "first matching row" semantics survive the flattening.
pub fn build_line_table(
    dwarf: &gimli::Dwarf<EndianSlice<'_, RunTimeEndian>>,
) -> Result<Vec<LineEntry>> {
    let mut headers = Vec::new();
    let mut units_iter = dwarf.units();
    while let Some(header) = units_iter.next()? {
        headers.push(header);
    }

    let per_unit: Vec<Vec<LineEntry>> = headers
        .into_par_iter()
        .map(|header| {
            let Ok(unit) = dwarf.unit(header) else {
                return Vec::new();
            };
            let Some(program) = unit.line_program.clone() else {
                return Vec::new();
            };

            let mut entries = Vec::new();
            let mut rows = program.rows();
            while let Ok(Some((header, row))) = rows.next_row() {
                if row.end_sequence() {
                    continue;
                }
                let Some(line) = row.line() else { continue };

                let file = match row.file(header) {
                    Some(file_entry) => {
                        let mut path = String::new();
                        let name = dwarf
                            .attr_string(&unit, file_entry.path_name())
                            .map(|s| s.to_string_lossy().to_string())
                            .unwrap_or_default();
                        if !name.starts_with('/') {
                            if let Some(dir) = file_entry.directory(header) {
                                if let Ok(s) = dwarf.attr_string(&unit, dir) {
                                    path.push_str(&s.to_string_lossy());
                                    path.push('/');
                                }
                            }
                        }
                        path.push_str(&name);
                        path
                    }
                    None => continue,
                };

                entries.push(LineEntry {
                    address: row.address(),
                    file,
                    line: line.get() as u32,
                    is_stmt: row.is_stmt(),
                });
            }
            entries
        })
        .collect();

    Ok(per_unit.into_iter().flatten().collect())
}

/// Distinct filenames in the line table ending with the given suffix.
pub fn findall_filenames(entries: &[LineEntry], suffix: &str) -> BTreeSet<String> {
    entries
        .iter()
        .filter(|e| e.file.ends_with(suffix))
        .map(|e| e.file.clone())
        .collect()
}

/// First statement row matching `suffix:line`, if any.
pub fn find_stmt_address(entries: &[LineEntry], suffix: &str, line: u32) -> Option<u64> {
    entries
        .iter()
        .find(|e| e.is_stmt && e.line == line && e.file.ends_with(suffix))
        .map(|e| e.address)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: u64, file: &str, line: u32, is_stmt: bool) -> LineEntry {
        LineEntry {
            address,
            file: file.to_string(),
            line,
            is_stmt,
        }
    }

    #[test]
    fn test_findall_filenames_dedups() {
        let entries = vec![
            entry(0x10, "/src/app/main.go", 3, true),
            entry(0x14, "/src/app/main.go", 4, true),
            entry(0x20, "/src/app/util.go", 9, true),
        ];
        let names = findall_filenames(&entries, "main.go");
        assert_eq!(names.len(), 1);
        assert!(names.contains("/src/app/main.go"));
    }

    #[test]
    fn test_findall_filenames_ambiguous() {
        let entries = vec![
            entry(0x10, "/src/app/main.go", 3, true),
            entry(0x20, "/src/vendor/main.go", 3, true),
        ];
        assert_eq!(findall_filenames(&entries, "main.go").len(), 2);
    }

    #[test]
    fn test_find_stmt_address_skips_non_statements() {
        let entries = vec![
            entry(0x10, "/src/app/main.go", 42, false),
            entry(0x18, "/src/app/main.go", 42, true),
            entry(0x20, "/src/app/main.go", 42, true),
        ];
        assert_eq!(find_stmt_address(&entries, "main.go", 42), Some(0x18));
    }

    #[test]
    fn test_find_stmt_address_missing_line() {
        let entries = vec![entry(0x10, "/src/app/main.go", 41, true)];
        assert_eq!(find_stmt_address(&entries, "main.go", 42), None);
    }
}
