use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Reads and deserializes one JSON configuration file.
///
/// Both failure modes surface as `Error::Configuration` carrying the file
/// path, so a misconfigured deployment points straight at the offending
/// file instead of a bare I/O or syntax error.
pub fn parse_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();

    let data = fs::read_to_string(path).map_err(|e| Error::Configuration(format!("Cannot read '{}': {}", path.display(), e)))?;

    serde_json::from_str(&data).map_err(|e| Error::Configuration(format!("Malformed JSON in '{}': {}", path.display(), e)))
}
