#![allow(dead_code)]

use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;

/// Auto-build and return the C fixture binary, or `None` when no C
/// compiler is available. Builds on first call, caches via OnceLock.
pub fn c_fixture() -> Option<PathBuf> {
    static CACHED: OnceLock<Option<PathBuf>> = OnceLock::new();
    CACHED
        .get_or_init(|| {
            let fixture_dir =
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/c");
            let binary = fixture_dir.join("build/target");

            if !binary.exists() {
                let status = Command::new("make")
                    .arg("-C")
                    .arg(&fixture_dir)
                    .status()
                    .ok()?;
                if !status.success() {
                    return None;
                }
            }
            binary.exists().then_some(binary)
        })
        .clone()
}
