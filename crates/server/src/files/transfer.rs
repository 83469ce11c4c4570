//! Downloads and bulk deletion.

use std::fs;
use std::io;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use guard::{PathResolver, ResolvedPath};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Errors that can occur while serving a file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The path vanished between resolution and opening.
    #[error("file not found")]
    NotFound,

    /// The path is a directory or special file.
    #[error("not a regular file")]
    NotAFile,

    /// The file exists but cannot be opened for reading.
    #[error("file is not readable")]
    Unreadable,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An opened file ready to stream.
pub struct Download {
    file: tokio::fs::File,
    /// Length sent in `Content-Length`.
    pub size: u64,
    /// Name offered to the browser, already made header-safe.
    pub file_name: String,
}

/// Open a resolved regular file for download.
pub async fn open_download(path: &ResolvedPath) -> Result<Download, TransferError> {
    let metadata = tokio::fs::metadata(path.as_path())
        .await
        .map_err(|_| TransferError::NotFound)?;
    if !metadata.is_file() {
        return Err(TransferError::NotAFile);
    }

    let file = tokio::fs::File::open(path.as_path())
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => TransferError::Unreadable,
            io::ErrorKind::NotFound => TransferError::NotFound,
            _ => TransferError::Io(e),
        })?;

    Ok(Download {
        file,
        size: metadata.len(),
        file_name: download_filename(&path.file_name().unwrap_or_default()),
    })
}

impl IntoResponse for Download {
    fn into_response(self) -> Response {
        let disposition = format!("attachment; filename=\"{}\"", self.file_name);
        let body = Body::from_stream(ReaderStream::new(self.file));

        (
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
                (header::CONTENT_LENGTH, self.size.to_string()),
                (
                    header::CACHE_CONTROL,
                    "no-cache, no-store, must-revalidate".to_string(),
                ),
                (header::PRAGMA, "no-cache".to_string()),
                (header::EXPIRES, "0".to_string()),
                (header::ACCEPT_RANGES, "none".to_string()),
            ],
            body,
        )
            .into_response()
    }
}

/// Header-safe download name.
///
/// Keeps ASCII letters, digits, underscore, space, dot, hyphen and
/// parentheses. Everything else, including quotes and control characters,
/// is dropped.
pub fn download_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '.' | '-' | '(' | ')'))
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Result of a bulk delete.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Delete every non-directory entry directly inside `dir`.
///
/// Subdirectories and reserved entries are left alone. Symlinks are removed
/// as links; their targets are untouched.
pub fn delete_all(dir: &ResolvedPath, resolver: &PathResolver) -> io::Result<DeleteReport> {
    let mut report = DeleteReport::default();

    for entry in fs::read_dir(dir.as_path())? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Failed to read directory entry");
                report.failed += 1;
                continue;
            }
        };

        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Failed to stat directory entry");
                report.failed += 1;
                continue;
            }
        };
        if file_type.is_dir() {
            continue;
        }

        let path = entry.path();
        if resolver.is_reserved(&path) {
            debug!(path = %path.display(), "Skipping reserved entry");
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => report.deleted += 1,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete file");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
