//! Output Gate Module
//!
//! Post-encode validation ensuring the output exists and is not implausibly small.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Result of the output gate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputGateResult {
    /// Output present and large enough
    Accept { bytes: u64 },
    /// Nothing was written at the destination
    Missing,
    /// Output is smaller than the configured minimum
    TooSmall { bytes: u64, min_bytes: u64 },
}

/// Check an output size against the minimum.
///
/// `None` means the output does not exist. Returns `TooSmall` if
/// `bytes < min_bytes`, otherwise `Accept`.
pub fn check_output_size(bytes: Option<u64>, min_bytes: u64) -> OutputGateResult {
    match bytes {
        None => OutputGateResult::Missing,
        Some(bytes) if bytes < min_bytes => OutputGateResult::TooSmall { bytes, min_bytes },
        Some(bytes) => OutputGateResult::Accept { bytes },
    }
}

/// Stat `path` and run the gate on its size
pub fn check_output(path: &Path, min_bytes: u64) -> OutputGateResult {
    let bytes = std::fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len());
    check_output_size(bytes, min_bytes)
}
