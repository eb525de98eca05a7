//! Destination file name reservation
//!
//! Two transfers must never write to the same path. Every destination is
//! reserved here before use; a taken name gets a ` (N)` suffix placed before
//! its complete extension (`data.tar.gz` becomes `data (1).tar.gz`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use percent_encoding::percent_decode_str;
use url::Url;

/// Process-wide set of reserved destination paths
#[derive(Debug, Clone, Default)]
pub struct PathLocks {
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // A panic while holding the lock cannot leave the set half-updated
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `path`, or the first free ` (N)` variant of it
    ///
    /// A candidate is free when it is not reserved and does not exist on disk.
    pub fn lock(&self, path: &Path) -> PathBuf {
        let mut reserved = self.guard();
        let mut candidate = path.to_path_buf();
        let mut count = 0;
        while reserved.contains(&candidate) || candidate.exists() {
            count += 1;
            candidate = numbered_variant(path, count);
        }
        debug!("Reserved destination {}", candidate.display());
        reserved.insert(candidate.clone());
        candidate
    }

    /// Reserve exactly `path`, failing when another transfer holds it
    pub fn try_lock_exact(&self, path: &Path) -> bool {
        self.guard().insert(path.to_path_buf())
    }

    pub fn unlock(&self, path: &Path) {
        if self.guard().remove(path) {
            debug!("Released destination {}", path.display());
        }
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.guard().contains(path)
    }
}

/// `dir/base (N).complete.suffix`
fn numbered_variant(path: &Path, count: usize) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (base, suffix) = match file_name.find('.') {
        Some(index) if index > 0 => file_name.split_at(index),
        _ => (file_name.as_str(), ""),
    };
    path.with_file_name(format!("{} ({}){}", base, count, suffix))
}

/// File name taken from the last URL path segment
///
/// Returns `None` when the URL path ends in a slash or is empty.
pub fn url_file_name(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            percent_decode_str(segment)
                .decode_utf8_lossy()
                .replace(['/', '\\'], "_")
        })
}
