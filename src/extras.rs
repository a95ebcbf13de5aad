use crate::{Error, Result};

/// Extra render variables passed on the command line as `-e K=V,K=V`.
///
/// `sym_pid` feeds kernel stack symbolization; when absent it is filled in
/// from the spawned symbolization helper before rendering. `real_target`
/// overrides the pathname the generated program attaches to, and
/// `dwarf_path_prefix` is prepended to file suffixes before `.debug_line`
/// lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extras {
    pub sym_pid: Option<i32>,
    pub real_target: Option<String>,
    pub dwarf_path_prefix: Option<String>,
}

impl Extras {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut extras = Self::default();
        for pair in raw.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::InvalidExtra(pair.to_string()))?;
            match key.trim() {
                "sym_pid" => {
                    let pid = value
                        .trim()
                        .parse()
                        .map_err(|_| Error::InvalidExtra(pair.to_string()))?;
                    extras.sym_pid = Some(pid);
                }
                "real_target" => extras.real_target = Some(value.trim().to_string()),
                "dwarf_path_prefix" => {
                    extras.dwarf_path_prefix = Some(value.trim().to_string())
                }
                other => return Err(Error::InvalidExtra(other.to_string())),
            }
        }
        Ok(extras)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert_eq!(Extras::parse("").unwrap(), Extras::default());
    }

    #[test]
    fn test_parse_all_keys() {
        let extras =
            Extras::parse("sym_pid=1234,real_target=/usr/bin/app,dwarf_path_prefix=/src/")
                .unwrap();
        assert_eq!(extras.sym_pid, Some(1234));
        assert_eq!(extras.real_target.as_deref(), Some("/usr/bin/app"));
        assert_eq!(extras.dwarf_path_prefix.as_deref(), Some("/src/"));
    }

    #[test]
    fn test_parse_unknown_key() {
        assert!(matches!(
            Extras::parse("frobnicate=1"),
            Err(Error::InvalidExtra(_))
        ));
    }

    #[test]
    fn test_parse_bad_pid() {
        assert!(matches!(
            Extras::parse("sym_pid=abc"),
            Err(Error::InvalidExtra(_))
        ));
    }

    #[test]
    fn test_parse_missing_equals() {
        assert!(matches!(
            Extras::parse("sym_pid"),
            Err(Error::InvalidExtra(_))
        ));
    }
}
