//! Destination resolution shared by all workers of one orchestrator
//!
//! A path is "taken" if it exists on disk or another live worker has reserved it.
//! Resolution and reservation happen under one lock, so two workers can never pick
//! the same rename candidate.

use super::WorkerError;
use handforge_config::DuplicatePolicy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-flight destination paths
#[derive(Debug, Clone, Default)]
pub struct DestinationRegistry {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Outcome of claiming a destination
#[derive(Debug)]
pub enum Claim {
    /// Destination is taken and the policy is `skip`
    Skip(PathBuf),
    /// The worker owns this path until the reservation is dropped
    Reserved(Reservation),
}

/// Exclusive hold on a destination path; released on drop
#[derive(Debug)]
pub struct Reservation {
    path: PathBuf,
    registry: DestinationRegistry,
}

impl Reservation {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.registry.inner.lock().remove(&self.path);
    }
}

/// `dir/stem (n).ext`
pub fn rename_candidate(path: &Path, n: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    path.with_file_name(name)
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the duplicate policy to `path` and reserve the result.
    ///
    /// Under `overwrite`, a path reserved by another live worker is refused with
    /// [`WorkerError::DestinationBusy`]; an existing file on disk is not.
    pub fn claim(&self, path: PathBuf, policy: DuplicatePolicy) -> Result<Claim, WorkerError> {
        let mut reserved = self.inner.lock();
        let taken = |p: &Path| p.exists() || reserved.contains(p);

        let chosen = if !taken(&path) {
            path
        } else {
            match policy {
                DuplicatePolicy::Skip => return Ok(Claim::Skip(path)),
                DuplicatePolicy::Rename => {
                    let mut n = 1;
                    let mut candidate = rename_candidate(&path, n);
                    while taken(&candidate) {
                        n += 1;
                        candidate = rename_candidate(&path, n);
                    }
                    candidate
                }
                DuplicatePolicy::Overwrite => {
                    if reserved.contains(&path) {
                        return Err(WorkerError::DestinationBusy(path));
                    }
                    path
                }
            }
        };

        reserved.insert(chosen.clone());
        Ok(Claim::Reserved(Reservation {
            path: chosen,
            registry: self.clone(),
        }))
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.inner.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
