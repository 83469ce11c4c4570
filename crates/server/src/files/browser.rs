//! Directory listing.
//!
//! Entries whose real location is reserved or lies outside the root are
//! left out so the listing never links to something the resolver would
//! refuse.

use std::cmp::Ordering;
use std::fs;
use std::sync::Arc;
use std::time::SystemTime;

use guard::{PathResolver, ResolvedPath};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during directory browsing.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The requested path is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A listed entry.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Path relative to the root, usable as a `path` or `download` parameter.
    pub relative_path: String,
    /// Whether this is a directory (after following symlinks).
    pub is_dir: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modified timestamp.
    pub modified: SystemTime,
}

/// Lists directories inside the root.
pub struct DirectoryBrowser {
    resolver: Arc<PathResolver>,
}

impl DirectoryBrowser {
    /// Create a browser bound to `resolver`'s root and reserved set.
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    /// List `dir`, directories first, then files, each group by name
    /// ignoring case.
    pub fn list(&self, dir: &ResolvedPath) -> Result<Vec<DirectoryEntry>, BrowserError> {
        let metadata = fs::metadata(dir.as_path())?;
        if !metadata.is_dir() {
            return Err(BrowserError::NotADirectory(dir.relative().to_string()));
        }

        let root = self.resolver.root().as_path();
        let mut results = Vec::new();

        for entry in fs::read_dir(dir.as_path())? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();

            // Dangling links fail here and are skipped.
            let real = match fs::canonicalize(entry.path()) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if !real.starts_with(root) || self.resolver.is_reserved(&real) {
                debug!(name = %name, "Hiding entry from listing");
                continue;
            }

            let metadata = match fs::metadata(&real) {
                Ok(m) => m,
                Err(_) => continue,
            };

            results.push(DirectoryEntry {
                relative_path: dir.child_relative(&name),
                name,
                is_dir: metadata.is_dir(),
                size: if metadata.is_file() { metadata.len() } else { 0 },
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        results.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a
                .name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name)),
        });

        Ok(results)
    }
}

/// Folder and file counts for the listing footer.
pub fn count_entries(entries: &[DirectoryEntry]) -> (usize, usize) {
    let folders = entries.iter().filter(|e| e.is_dir).count();
    (folders, entries.len() - folders)
}
