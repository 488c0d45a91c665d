//! PBF fixtures for the loader tests.
//!
//! Fixtures live in `tests/fixtures/<stem>.osm.pbf.b64` as wrapped Base64 so
//! the binary extracts stay reviewable in diffs.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::{fs, path::PathBuf};
use tempfile::{Builder, TempPath};

/// Directory containing the encoded fixtures.
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Write the decoded fixture `stem` to a temporary `.osm.pbf` file.
///
/// The file is removed when the returned path is dropped.
pub fn pbf_fixture(stem: &str) -> TempPath {
    let source = fixtures_dir().join(format!("{stem}.osm.pbf.b64"));
    let encoded: String = fs::read_to_string(&source)
        .unwrap_or_else(|err| panic!("read fixture {source:?}: {err}"))
        .split_ascii_whitespace()
        .collect();
    let bytes = STANDARD
        .decode(encoded)
        .unwrap_or_else(|err| panic!("fixture {source:?} is not Base64: {err}"));
    let target = Builder::new()
        .prefix(stem)
        .suffix(".osm.pbf")
        .tempfile()
        .unwrap_or_else(|err| panic!("create temporary file for {stem}: {err}"))
        .into_temp_path();
    fs::write(&target, bytes).unwrap_or_else(|err| panic!("write fixture {target:?}: {err}"));
    target
}
