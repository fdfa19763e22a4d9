//! Source discovery for batch runs.
//!
//! Explicit file arguments are taken as given; directory arguments are walked
//! recursively for media files.

use crate::media::is_media_file;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Expand command-line inputs into a list of source files.
///
/// - A path that is not a directory is kept unchanged, even if it does not exist,
///   so the worker can report it
/// - Directories are walked recursively, skipping hidden directories
/// - Only files with a known audio or video extension are taken from directories
/// - Files found in one directory are sorted by path
pub fn collect_sources(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut sources = Vec::new();

    for input in inputs {
        if input.is_dir() {
            let mut found = scan_directory(input);
            found.sort();
            sources.extend(found);
        } else {
            sources.push(input.clone());
        }
    }

    sources
}

fn scan_directory(root: &Path) -> Vec<PathBuf> {
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        // Allow the root even if it starts with '.'
        if entry.file_type().is_dir() && entry.depth() > 0 {
            if let Some(name) = entry.file_name().to_str() {
                return !name.starts_with('.');
            }
        }
        true
    });

    walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && is_media_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}
