//! Multi-file upload validation.
//!
//! Uploads arrive in two steps. The HTTP layer streams each part into a file
//! issued by the [`StagingArea`], then hands the batch to the
//! [`UploadValidator`], which decides per item whether the staged content
//! may be moved into the target directory.

mod staging;
mod validator;

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use staging::{StagedFile, StagingArea, StagingError};
pub use validator::{UploadPolicy, UploadValidator};

/// Extensions accepted by default.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "pdf", "png", "jpg", "jpeg", "gif", "csv", "zip", "tar", "gz",
];

/// Default per-batch file limit.
pub const DEFAULT_MAX_FILES: usize = 10;

/// Default per-file size limit (10 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// File name reduced to `[A-Za-z0-9._-]` with no directory component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SanitizedName(String);

impl SanitizedName {
    /// The sanitized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether nothing survived sanitization.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercased text after the last `.`, if any.
    pub fn extension(&self) -> Option<String> {
        let (_, ext) = self.0.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext.to_ascii_lowercase())
        }
    }
}

impl fmt::Display for SanitizedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduce a client-supplied file name to a safe base name.
///
/// Both `/` and `\` count as separators; everything before the last one is
/// dropped. Remaining characters outside `[A-Za-z0-9._-]` become `_`.
pub fn sanitize_filename(name: &str) -> SanitizedName {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    SanitizedName(cleaned)
}

/// Transport-level failure reported for one uploaded part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Part exceeded the staging limit.
    TooLarge,
    /// Part was cut off before completion.
    Partial,
    /// No staging directory was available.
    NoTempDir,
    /// Staged content could not be written.
    WriteFailed,
    /// Refused by the transport before reaching storage.
    Blocked,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TransferErrorKind::TooLarge => "file exceeds the maximum upload size",
            TransferErrorKind::Partial => "file was only partially uploaded",
            TransferErrorKind::NoTempDir => "no temporary directory available",
            TransferErrorKind::WriteFailed => "failed to write file to disk",
            TransferErrorKind::Blocked => "upload was blocked",
        };
        f.write_str(msg)
    }
}

/// One declared file of a batch.
#[derive(Debug, Clone)]
pub struct UploadItem {
    /// Name as sent by the client.
    pub original_name: String,
    /// Size of the staged content.
    pub size_bytes: u64,
    /// Failure reported by the transport.
    pub declared_error: Option<TransferErrorKind>,
    /// Staged content.
    pub temp_source: PathBuf,
}

/// Why an item was refused.
#[derive(Debug, Error)]
pub enum UploadRejection {
    #[error("{0}")]
    Transfer(TransferErrorKind),

    #[error("file type not allowed")]
    DisallowedExtension,

    #[error("file exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("upload source is not a staged file")]
    NotStaged,

    #[error("a file with this name already exists")]
    AlreadyExists,

    #[error("target name is reserved")]
    Reserved,

    #[error("failed to store file: {0}")]
    Io(#[from] io::Error),
}

impl UploadRejection {
    /// Stable identifier for audit records.
    pub fn code(&self) -> &'static str {
        match self {
            UploadRejection::Transfer(_) => "transfer_error",
            UploadRejection::DisallowedExtension => "disallowed_extension",
            UploadRejection::TooLarge { .. } => "too_large",
            UploadRejection::NotStaged => "not_staged",
            UploadRejection::AlreadyExists => "already_exists",
            UploadRejection::Reserved => "reserved",
            UploadRejection::Io(_) => "io_error",
        }
    }
}

/// Per-item decision.
#[derive(Debug)]
pub enum UploadOutcome {
    Accepted {
        original_name: String,
        name: SanitizedName,
    },
    Rejected {
        original_name: String,
        reason: UploadRejection,
    },
}

impl UploadOutcome {
    /// Whether the file was stored.
    pub fn is_accepted(&self) -> bool {
        matches!(self, UploadOutcome::Accepted { .. })
    }

    /// Name as sent by the client.
    pub fn original_name(&self) -> &str {
        match self {
            UploadOutcome::Accepted { original_name, .. }
            | UploadOutcome::Rejected { original_name, .. } => original_name,
        }
    }
}

/// Batch exceeded the per-request file limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    /// Items declared by the client.
    pub declared: usize,
    /// Items actually considered.
    pub processed: usize,
}

/// Result of one batch.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub outcomes: Vec<UploadOutcome>,
    pub truncated: Option<Truncation>,
}

impl UploadReport {
    /// Number of stored files.
    pub fn accepted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_accepted()).count()
    }

    /// Number of refused files.
    pub fn rejected(&self) -> usize {
        self.outcomes.len() - self.accepted()
    }
}
