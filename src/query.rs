//! Matching a raw descriptor supplied as JSON.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use crate::matcher::{self, MatchResult};
use crate::storage::FaceStore;

/// Parse a descriptor written as a JSON array of numbers.
pub fn parse_descriptor(raw: &str) -> Result<Vec<f32>> {
    serde_json::from_str(raw).context("query must be a JSON array of numbers")
}

/// Read a descriptor from `path`, or from `stdin` when `path` is `-`.
pub fn read_descriptor<R: Read>(path: &Path, mut stdin: R) -> Result<Vec<f32>> {
    let raw = if path == Path::new("-") {
        let mut raw = String::new();
        stdin
            .read_to_string(&mut raw)
            .context("reading query from stdin")?;
        raw
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading query {}", path.display()))?
    };
    parse_descriptor(&raw)
}

/// Match `descriptor` against everything in `store`.
pub fn match_stored(store: &FaceStore, descriptor: &[f32], threshold: f32) -> Result<MatchResult> {
    let known = store.list().context("Failed to load known faces")?;
    Ok(matcher::match_face(descriptor, &known, threshold)?)
}

/// Pretty JSON for a result. An infinite distance is written as `null`.
pub fn render(result: &MatchResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}
