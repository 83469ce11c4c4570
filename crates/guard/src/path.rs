//! Path confinement.
//!
//! Every user-supplied path goes through [`PathResolver::resolve`] before any
//! filesystem operation. The only way to obtain a [`ResolvedPath`] is through
//! the resolver, so a function taking a `&ResolvedPath` cannot be handed an
//! unchecked location.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::audit::Auditor;
use crate::error::GuardError;
use crate::upload::SanitizedName;

/// Reasons a requested path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The path does not exist or could not be canonicalized.
    #[error("path not found")]
    NotFound,

    /// The path would escape the root.
    #[error("path escapes the root directory")]
    Traversal,

    /// The path names an application-owned file.
    #[error("path is reserved")]
    Reserved,
}

impl ResolveError {
    /// Audit event name for this rejection.
    pub fn audit_event(&self) -> &'static str {
        match self {
            ResolveError::NotFound => "path_not_found",
            ResolveError::Traversal => "path_traversal_blocked",
            ResolveError::Reserved => "reserved_path_denied",
        }
    }
}

impl From<ResolveError> for GuardError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound => GuardError::NotFound(err.to_string()),
            ResolveError::Traversal | ResolveError::Reserved => {
                GuardError::Authorization(err.to_string())
            }
        }
    }
}

/// Canonical root directory of the file manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root(PathBuf);

impl Root {
    /// Canonicalize `path` and check it is a directory.
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let canonical = fs::canonicalize(path.as_ref())?;
        if !canonical.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root is not a directory: {}", canonical.display()),
            ));
        }
        Ok(Self(canonical))
    }

    /// Absolute canonical path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

/// Application-owned locations that are never listed, served or replaced.
///
/// Entries are stored canonicalized so they compare equal to resolver
/// output. Entries that do not exist yet are anchored on their canonical
/// parent.
#[derive(Debug, Clone, Default)]
pub struct ReservedPaths {
    paths: Vec<PathBuf>,
}

impl ReservedPaths {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reserved location.
    pub fn with<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.insert(path);
        self
    }

    /// Add a reserved location.
    pub fn insert<P: AsRef<Path>>(&mut self, path: P) {
        let normalized = normalize_reserved(path.as_ref());
        if !self.paths.contains(&normalized) {
            self.paths.push(normalized);
        }
    }

    /// Whether `path` is a reserved location or lies below one.
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.iter().any(|reserved| path.starts_with(reserved))
    }

    /// Reserved locations.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }
}

fn normalize_reserved(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// An absolute path proven to be inside the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    path: PathBuf,
    relative: String,
}

impl ResolvedPath {
    /// Absolute canonical path.
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Path relative to the root with `/` separators; empty for the root.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Whether this is the root itself.
    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }

    /// Whether the path currently names a directory.
    pub fn is_dir(&self) -> bool {
        self.path.is_dir()
    }

    /// Whether the path currently names a regular file.
    pub fn is_file(&self) -> bool {
        self.path.is_file()
    }

    /// Last component, `None` for the root.
    pub fn file_name(&self) -> Option<String> {
        if self.is_root() {
            return None;
        }
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Relative path of the parent directory, `None` for the root.
    pub fn parent_relative(&self) -> Option<String> {
        if self.is_root() {
            return None;
        }
        Some(match self.relative.rfind('/') {
            Some(idx) => self.relative[..idx].to_string(),
            None => String::new(),
        })
    }

    /// Relative path of a child entry named `name`.
    pub fn child_relative(&self, name: &str) -> String {
        if self.relative.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.relative, name)
        }
    }

    /// Upload target for a sanitized name inside this directory.
    pub fn join_name(&self, name: &SanitizedName) -> PathBuf {
        self.path.join(name.as_str())
    }
}

/// Resolves user-supplied relative paths against the root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: Root,
    reserved: ReservedPaths,
}

impl PathResolver {
    /// Create a resolver for `root` that refuses the `reserved` locations.
    pub fn new(root: Root, reserved: ReservedPaths) -> Self {
        Self { root, reserved }
    }

    /// The root directory.
    pub fn root(&self) -> &Root {
        &self.root
    }

    /// Reserved locations.
    pub fn reserved(&self) -> &ReservedPaths {
        &self.reserved
    }

    /// Whether an absolute path is reserved.
    pub fn is_reserved(&self, path: &Path) -> bool {
        self.reserved.contains(path)
    }

    /// The root as a resolved path.
    pub fn root_path(&self) -> ResolvedPath {
        ResolvedPath {
            path: self.root.as_path().to_path_buf(),
            relative: String::new(),
        }
    }

    /// Resolve `requested` to a path inside the root.
    ///
    /// NUL characters are dropped, backslashes count as separators and
    /// leading slashes are ignored, so `/etc` means `<root>/etc`.
    pub fn resolve(&self, requested: &str) -> Result<ResolvedPath, ResolveError> {
        let normalized = normalize_input(requested);
        if normalized.is_empty() {
            return Ok(self.root_path());
        }

        if climbs_above_start(&normalized) {
            return Err(ResolveError::Traversal);
        }

        let joined = self.root.as_path().join(&normalized);
        let canonical = fs::canonicalize(&joined).map_err(|_| ResolveError::NotFound)?;

        // A symlink inside the root may still point elsewhere.
        let relative = match canonical.strip_prefix(self.root.as_path()) {
            Ok(rel) => rel,
            Err(_) => return Err(ResolveError::Traversal),
        };

        if self.reserved.contains(&canonical) {
            return Err(ResolveError::Reserved);
        }

        let relative = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");

        Ok(ResolvedPath {
            path: canonical,
            relative,
        })
    }

    /// Like [`resolve`](Self::resolve), reporting rejections to the audit log.
    ///
    /// The record carries the raw input, never the resolved location.
    pub fn resolve_audited(
        &self,
        requested: &str,
        auditor: &Auditor,
    ) -> Result<ResolvedPath, ResolveError> {
        let result = self.resolve(requested);
        if let Err(err) = &result {
            debug!(error = %err, "Path rejected");
            auditor.event(err.audit_event(), json!({ "input": requested }));
        }
        result
    }
}

fn normalize_input(requested: &str) -> String {
    let cleaned: String = requested
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| if c == '\\' { '/' } else { c })
        .collect();
    cleaned.trim_start_matches('/').to_string()
}

/// Whether walking the segments lexically would leave the starting directory.
fn climbs_above_start(normalized: &str) -> bool {
    let mut depth: usize = 0;
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            _ => depth += 1,
        }
    }
    false
}
