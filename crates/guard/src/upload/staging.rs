//! Staging area for in-flight upload content.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors from the staging area.
#[derive(Debug, Error)]
pub enum StagingError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Lock poisoned during operation.
    #[error("lock poisoned: {context}")]
    LockPoisoned { context: String },
}

/// A freshly issued staging file, open for writing.
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    pub file: File,
}

/// Private directory whose files are the only valid upload sources.
///
/// Every issued path is remembered; [`is_genuine`](Self::is_genuine) answers
/// whether a path was issued here and still is a regular file, so a crafted
/// "temporary" path cannot smuggle an arbitrary file into the root.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    issued: Mutex<HashSet<PathBuf>>,
}

impl StagingArea {
    /// Open (creating if needed) the staging directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StagingError> {
        fs::create_dir_all(dir.as_ref())?;
        let dir = fs::canonicalize(dir.as_ref())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self {
            dir,
            issued: Mutex::new(HashSet::new()),
        })
    }

    /// Canonical staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Issue a new, empty staging file.
    pub fn stage(&self) -> Result<StagedFile, StagingError> {
        let path = self.dir.join(format!("upload-{}", Uuid::new_v4()));

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;

        self.issued
            .lock()
            .map_err(|_| StagingError::LockPoisoned {
                context: "issued set during stage".to_string(),
            })?
            .insert(path.clone());

        debug!(path = ?path, "Issued staging file");
        Ok(StagedFile { path, file })
    }

    /// Whether `path` was issued here and is still a regular file.
    pub fn is_genuine(&self, path: &Path) -> bool {
        let issued = match self.issued.lock() {
            Ok(issued) => issued.contains(path),
            Err(_) => false,
        };
        issued
            && fs::symlink_metadata(path)
                .map(|m| m.file_type().is_file())
                .unwrap_or(false)
    }

    /// Forget an issued file and delete it if still present.
    ///
    /// Paths that were never issued are left untouched. Returns whether the
    /// path had been issued.
    pub fn release(&self, path: &Path) -> bool {
        let was_issued = match self.issued.lock() {
            Ok(mut issued) => issued.remove(path),
            Err(_) => false,
        };
        if was_issued {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove staging file"),
            }
        }
        was_issued
    }

    /// Number of files currently issued.
    pub fn pending(&self) -> usize {
        self.issued.lock().map(|i| i.len()).unwrap_or(0)
    }

    /// Delete leftovers from a previous run.
    pub fn clear_stale(&self) -> Result<usize, StagingError> {
        let issued = self
            .issued
            .lock()
            .map_err(|_| StagingError::LockPoisoned {
                context: "issued set during clear_stale".to_string(),
            })?;

        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if issued.contains(&path) || !entry.file_type()?.is_file() {
                continue;
            }
            fs::remove_file(&path)?;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "Removed stale staging files");
        }
        Ok(removed)
    }
}
