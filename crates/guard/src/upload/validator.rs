//! Per-item upload rules and persistence.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use super::{
    sanitize_filename, SanitizedName, StagingArea, Truncation, UploadItem, UploadOutcome,
    UploadRejection, UploadReport, DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_MAX_FILES,
    DEFAULT_MAX_FILE_BYTES,
};
use crate::audit::Auditor;
use crate::path::{ReservedPaths, ResolvedPath};

/// Permissions of stored uploads.
const UPLOAD_FILE_MODE: u32 = 0o640;

/// Limits applied to each batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_files: usize,
    pub max_file_bytes: u64,
    /// Lowercase extensions without the dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl UploadPolicy {
    /// Whether `ext` (already lowercased) is on the allow-list.
    pub fn allows_extension(&self, ext: &str) -> bool {
        self.allowed_extensions.iter().any(|a| a == ext)
    }
}

/// Applies the upload rules to a batch and stores accepted files.
pub struct UploadValidator {
    policy: UploadPolicy,
    staging: Arc<StagingArea>,
    reserved: ReservedPaths,
}

impl UploadValidator {
    /// Validator drawing sources from `staging` and refusing `reserved`
    /// targets.
    pub fn new(policy: UploadPolicy, staging: Arc<StagingArea>, reserved: ReservedPaths) -> Self {
        Self {
            policy,
            staging,
            reserved,
        }
    }

    /// Limits in force.
    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Staging area supplying upload sources.
    pub fn staging(&self) -> &Arc<StagingArea> {
        &self.staging
    }

    /// Process a batch into `target_dir`.
    ///
    /// Only the first `max_files` items are considered; the rest are
    /// discarded and reported through [`UploadReport::truncated`]. Every
    /// staged source is released once its item is decided.
    pub fn process(
        &self,
        items: Vec<UploadItem>,
        target_dir: &ResolvedPath,
        auditor: &Auditor,
    ) -> UploadReport {
        let declared = items.len();
        let mut report = UploadReport::default();

        if declared > self.policy.max_files {
            report.truncated = Some(Truncation {
                declared,
                processed: self.policy.max_files,
            });
            warn!(declared, limit = self.policy.max_files, "Upload batch truncated");
            auditor.event(
                "upload_truncated",
                json!({ "declared": declared, "processed": self.policy.max_files }),
            );
        }

        for (index, item) in items.into_iter().enumerate() {
            if index >= self.policy.max_files {
                self.staging.release(&item.temp_source);
                continue;
            }

            // Nameless parts are empty file inputs, not uploads.
            if item.original_name.is_empty() {
                self.staging.release(&item.temp_source);
                continue;
            }

            let outcome = match self.check_and_store(&item, target_dir) {
                Ok(name) => {
                    info!(name = %name, size = item.size_bytes, "Upload stored");
                    auditor.event(
                        "upload_accepted",
                        json!({
                            "name": name.as_str(),
                            "size": item.size_bytes,
                            "directory": target_dir.relative(),
                        }),
                    );
                    UploadOutcome::Accepted {
                        original_name: item.original_name.clone(),
                        name,
                    }
                }
                Err(reason) => {
                    debug!(reason = %reason, "Upload rejected");
                    auditor.event(
                        "upload_rejected",
                        json!({
                            "name": item.original_name,
                            "reason": reason.code(),
                            "directory": target_dir.relative(),
                        }),
                    );
                    UploadOutcome::Rejected {
                        original_name: item.original_name.clone(),
                        reason,
                    }
                }
            };

            self.staging.release(&item.temp_source);
            report.outcomes.push(outcome);
        }

        report
    }

    fn check_and_store(
        &self,
        item: &UploadItem,
        target_dir: &ResolvedPath,
    ) -> Result<SanitizedName, UploadRejection> {
        if let Some(kind) = item.declared_error {
            return Err(UploadRejection::Transfer(kind));
        }

        let name = sanitize_filename(&item.original_name);
        match name.extension() {
            Some(ext) if self.policy.allows_extension(&ext) => {}
            _ => return Err(UploadRejection::DisallowedExtension),
        }

        if item.size_bytes > self.policy.max_file_bytes {
            return Err(UploadRejection::TooLarge {
                limit: self.policy.max_file_bytes,
            });
        }

        if !self.staging.is_genuine(&item.temp_source) {
            warn!(source = ?item.temp_source, "Upload source was not issued by staging");
            return Err(UploadRejection::NotStaged);
        }

        let target = target_dir.join_name(&name);
        if self.reserved.contains(&target) {
            return Err(UploadRejection::Reserved);
        }
        if fs::symlink_metadata(&target).is_ok() {
            return Err(UploadRejection::AlreadyExists);
        }

        store_exclusive(&item.temp_source, &target)?;
        Ok(name)
    }
}

/// Place `source` at `target` without ever replacing an existing file.
fn store_exclusive(source: &Path, target: &Path) -> Result<(), UploadRejection> {
    // A hard link is an atomic exclusive create on the same filesystem.
    match fs::hard_link(source, target) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(UploadRejection::AlreadyExists);
        }
        Err(e) => {
            debug!(error = %e, "Hard link failed, copying staged content");
            copy_exclusive(source, target)?;
        }
    }

    set_upload_permissions(target)?;
    Ok(())
}

fn copy_exclusive(source: &Path, target: &Path) -> Result<(), UploadRejection> {
    let mut input = File::open(source)?;
    let mut output = match OpenOptions::new().write(true).create_new(true).open(target) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(UploadRejection::AlreadyExists);
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = io::copy(&mut input, &mut output).and_then(|_| output.sync_all()) {
        drop(output);
        if let Err(cleanup) = fs::remove_file(target) {
            warn!(path = ?target, error = %cleanup, "Failed to remove partial upload");
        }
        return Err(e.into());
    }
    Ok(())
}

#[cfg(unix)]
fn set_upload_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(UPLOAD_FILE_MODE))
}

#[cfg(not(unix))]
fn set_upload_permissions(_path: &Path) -> io::Result<()> {
    let _ = UPLOAD_FILE_MODE;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::path::{PathResolver, Root};
    use crate::upload::TransferErrorKind;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        resolver: PathResolver,
        validator: UploadValidator,
        sink: Arc<MemoryAuditLog>,
        auditor: Auditor,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir_all(root.join("inbox")).unwrap();

        let staging = Arc::new(StagingArea::new(temp_dir.path().join("staging")).unwrap());
        let reserved = ReservedPaths::new()
            .with(root.join("credential.json"))
            .with(staging.dir());
        let resolver = PathResolver::new(Root::new(&root).unwrap(), reserved.clone());
        let validator = UploadValidator::new(UploadPolicy::default(), staging, reserved);

        let sink = Arc::new(MemoryAuditLog::new());
        let auditor = Auditor::new(sink.clone(), "198.51.100.4");

        Fixture {
            _temp_dir: temp_dir,
            resolver,
            validator,
            sink,
            auditor,
        }
    }

    fn staged_item(fx: &Fixture, name: &str, content: &[u8]) -> UploadItem {
        let mut staged = fx.validator.staging().stage().unwrap();
        staged.file.write_all(content).unwrap();
        UploadItem {
            original_name: name.to_string(),
            size_bytes: content.len() as u64,
            declared_error: None,
            temp_source: staged.path,
        }
    }

    #[test]
    fn test_accepts_valid_file() {
        let fx = fixture();
        let dir = fx.resolver.resolve("inbox").unwrap();
        let item = staged_item(&fx, "report.PDF", b"%PDF-1.4");
        let source = item.temp_source.clone();

        let report = fx.validator.process(vec![item], &dir, &fx.auditor);

        assert_eq!(report.accepted(), 1);
        assert!(report.truncated.is_none());
        let stored = dir.as_path().join("report.PDF");
        assert_eq!(fs::read(&stored).unwrap(), b"%PDF-1.4");
        assert!(!source.exists());
        assert_eq!(fx.validator.staging().pending(), 0);
        assert!(fx.sink.contains("upload_accepted"));
    }

    #[cfg(unix)]
    #[test]
    fn test_stored_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture();
        let dir = fx.resolver.root_path();
        let item = staged_item(&fx, "notes.txt", b"hi");

        fx.validator.process(vec![item], &dir, &fx.auditor);

        let mode = fs::metadata(dir.as_path().join("notes.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_traversal_name_is_flattened() {
        let fx = fixture();
        let dir = fx.resolver.resolve("inbox").unwrap();
        let item = staged_item(&fx, "../../evil.txt", b"x");

        let report = fx.validator.process(vec![item], &dir, &fx.auditor);

        match &report.outcomes[0] {
            UploadOutcome::Accepted { name, .. } => assert_eq!(name.as_str(), "evil.txt"),
            other => panic!("expected acceptance, got {other:?}"),
        }
        assert!(dir.as_path().join("evil.txt").exists());
    }

    #[test]
    fn test_disallowed_extension_rejected_regardless_of_size() {
        let fx = fixture();
        let dir = fx.resolver.root_path();
        let items = vec![
            staged_item(&fx, "tool.exe", b""),
            staged_item(&fx, "../../evil.sh", b"#!/bin/sh"),
            staged_item(&fx, "noext", b"x"),
        ];

        let report = fx.validator.process(items, &dir, &fx.auditor);

        assert_eq!(report.rejected(), 3);
        for outcome in &report.outcomes {
            assert!(matches!(
                outcome,
                UploadOutcome::Rejected {
                    reason: UploadRejection::DisallowedExtension,
                    ..
                }
            ));
        }
        assert!(!dir.as_path().join("tool.exe").exists());
    }

    #[test]
    fn test_oversized_file_rejected() {
        let fx = fixture();
        let dir = fx.resolver.root_path();
        let mut item = staged_item(&fx, "big.zip", b"PK");
        item.size_bytes = 11 * 1024 * 1024;

        let report = fx.validator.process(vec![item], &dir, &fx.auditor);

        assert!(matches!(
            report.outcomes[0],
            UploadOutcome::Rejected {
                reason: UploadRejection::TooLarge { limit: 10485760 },
                ..
            }
        ));
    }

    #[test]
    fn test_declared_transfer_error_rejected() {
        let fx = fixture();
        let dir = fx.resolver.root_path();
        let mut item = staged_item(&fx, "cut.txt", b"par");
        item.declared_error = Some(TransferErrorKind::Partial);

        let report = fx.validator.process(vec![item], &dir, &fx.auditor);

        assert!(matches!(
            report.outcomes[0],
            UploadOutcome::Rejected {
                reason: UploadRejection::Transfer(TransferErrorKind::Partial),
                ..
            }
        ));
        assert_eq!(fx.validator.staging().pending(), 0);
    }

    #[test]
    fn test_forged_source_rejected_and_left_alone() {
        let fx = fixture();
        let dir = fx.resolver.root_path();
        let outside = fx._temp_dir.path().join("shadow.txt");
        fs::write(&outside, "secret").unwrap();

        let item = UploadItem {
            original_name: "copy.txt".to_string(),
            size_bytes: 6,
            declared_error: None,
            temp_source: outside.clone(),
        };
        let report = fx.validator.process(vec![item], &dir, &fx.auditor);

        assert!(matches!(
            report.outcomes[0],
            UploadOutcome::Rejected {
                reason: UploadRejection::NotStaged,
                ..
            }
        ));
        assert!(outside.exists());
        assert!(!dir.as_path().join("copy.txt").exists());
    }

    #[test]
    fn test_existing_file_not_overwritten() {
        let fx = fixture();
        let dir = fx.resolver.root_path();
        fs::write(dir.as_path().join("data.csv"), "original").unwrap();

        let item = staged_item(&fx, "data.csv", b"replacement");
        let report = fx.validator.process(vec![item], &dir, &fx.auditor);

        assert!(matches!(
            report.outcomes[0],
            UploadOutcome::Rejected {
                reason: UploadRejection::AlreadyExists,
                ..
            }
        ));
        assert_eq!(
            fs::read_to_string(dir.as_path().join("data.csv")).unwrap(),
            "original"
        );
    }

    #[test]
    fn test_reserved_target_rejected() {
        let fx = fixture();
        let dir = fx.resolver.root_path();

        // Reserved name that does not exist yet.
        let reserved = ReservedPaths::new().with(dir.as_path().join("settings.txt"));
        let validator = UploadValidator::new(
            UploadPolicy::default(),
            Arc::clone(fx.validator.staging()),
            reserved,
        );
        let item = staged_item(&fx, "settings.txt", b"x");

        let report = validator.process(vec![item], &dir, &fx.auditor);

        assert!(matches!(
            report.outcomes[0],
            UploadOutcome::Rejected {
                reason: UploadRejection::Reserved,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_name_skipped() {
        let fx = fixture();
        let dir = fx.resolver.root_path();
        let items = vec![staged_item(&fx, "", b""), staged_item(&fx, "a.txt", b"a")];

        let report = fx.validator.process(items, &dir, &fx.auditor);

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.accepted(), 1);
        assert_eq!(fx.validator.staging().pending(), 0);
    }

    #[test]
    fn test_batch_truncated_to_limit() {
        let fx = fixture();
        let dir = fx.resolver.root_path();
        let items: Vec<UploadItem> = (0..12)
            .map(|i| staged_item(&fx, &format!("file{i}.txt"), b"x"))
            .collect();

        let report = fx.validator.process(items, &dir, &fx.auditor);

        assert_eq!(report.outcomes.len(), 10);
        assert_eq!(report.accepted(), 10);
        assert_eq!(
            report.truncated,
            Some(Truncation {
                declared: 12,
                processed: 10
            })
        );
        assert!(!dir.as_path().join("file10.txt").exists());
        assert!(!dir.as_path().join("file11.txt").exists());
        assert_eq!(fx.validator.staging().pending(), 0);
        assert!(fx.sink.contains("upload_truncated"));
    }

    #[test]
    fn test_rules_short_circuit_in_order() {
        let fx = fixture();
        let dir = fx.resolver.root_path();

        // Bad extension and too large: extension wins.
        let mut item = staged_item(&fx, "huge.exe", b"x");
        item.size_bytes = u64::MAX;
        let report = fx.validator.process(vec![item], &dir, &fx.auditor);
        assert!(matches!(
            report.outcomes[0],
            UploadOutcome::Rejected {
                reason: UploadRejection::DisallowedExtension,
                ..
            }
        ));

        // Too large and not staged: size wins.
        let item = UploadItem {
            original_name: "huge.txt".into(),
            size_bytes: u64::MAX,
            declared_error: None,
            temp_source: PathBuf::from("/etc/hostname"),
        };
        let report = fx.validator.process(vec![item], &dir, &fx.auditor);
        assert!(matches!(
            report.outcomes[0],
            UploadOutcome::Rejected {
                reason: UploadRejection::TooLarge { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_policy_allows_extension() {
        let policy = UploadPolicy::default();
        assert!(policy.allows_extension("gz"));
        assert!(!policy.allows_extension("exe"));
        assert!(!policy.allows_extension("GZ"));
    }
}
