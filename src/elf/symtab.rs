use super::loader::SymbolEntry;

/// All symbols whose name ends with the queried function name.
/// Suffix matching lets users write `pkg.Func` against fully-qualified
/// Go symbols like `github.com/org/repo/pkg.Func`.
pub fn findall_addresses<'a>(
    symbols: &'a [SymbolEntry],
    function_name: &str,
) -> Vec<&'a SymbolEntry> {
    symbols
        .iter()
        .filter(|sym| sym.name.ends_with(function_name))
        .collect()
}
