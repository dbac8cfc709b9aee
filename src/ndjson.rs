//! Newline-delimited JSON helpers.
//!
//! Every artifact the pipeline exchanges with the outside world (ETL output,
//! instance input, prediction shards, exported labels) is NDJSON: one JSON
//! object per line, blank lines ignored.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Decode failure carrying the 1-based line it happened on.
#[derive(Debug, Error)]
#[error("line {line}: {source}")]
pub struct LineError {
    pub line: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Serialize `items` as one JSON object per line, newline-terminated.
pub fn to_lines<T: Serialize>(items: &[T]) -> serde_json::Result<String> {
    let mut out = String::new();
    for item in items {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decode every non-blank line of `text`.
pub fn from_lines<T: DeserializeOwned>(text: &str) -> Result<Vec<T>, LineError> {
    let mut items = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(line).map_err(|source| LineError {
            line: idx + 1,
            source,
        })?;
        items.push(item);
    }
    Ok(items)
}
