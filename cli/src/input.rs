//! Recorded input files.

use std::path::Path;

use anyhow::{Context, Result};
use lngate_core::GateConfig;
use serde::de::DeserializeOwned;

/// Parse one JSON value per line. Blank lines and `#` comments are skipped.
pub fn parse_jsonl<T: DeserializeOwned>(contents: &str) -> Result<Vec<T>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}", index + 1))
        })
        .collect()
}

/// Read and parse a JSON-lines file
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_jsonl(&contents).with_context(|| format!("invalid record in {}", path.display()))
}

/// Configuration from `path`, or the defaults
pub fn load_config(path: Option<&Path>) -> Result<GateConfig> {
    match path {
        Some(path) => GateConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(GateConfig::default()),
    }
}
