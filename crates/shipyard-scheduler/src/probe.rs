//! Text probes over files of a checked out tree.

use std::path::Path;

/// Whether the file exists and contains `needle`.
pub fn file_contains(path: &Path, needle: &str) -> bool {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).contains(needle),
        Err(_) => false,
    }
}
