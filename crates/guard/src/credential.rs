//! Single administrator credential.
//!
//! The credential is an Argon2id PHC hash stored in a small JSON document.
//! It is written exactly once by first-run setup, together with a read-only
//! completion marker. The marker outlives the credential: if the credential
//! disappears later, setup stays locked and logins fail closed until an
//! operator restores it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::GuardError;

/// Credential file name inside the data directory.
pub const CREDENTIAL_FILE: &str = "credential.json";

/// Setup completion marker inside the data directory.
pub const SETUP_MARKER: &str = ".setup-complete";

/// Current credential document version.
pub const CREDENTIAL_FORMAT_VERSION: u32 = 1;

/// Minimum password length in characters.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// On-disk credential document.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialDocument {
    version: u32,
    password_hash: String,
    created_at: DateTime<Utc>,
}

/// Where the installation is in its first-run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    /// Neither credential nor marker exist; setup is offered.
    Unconfigured,
    /// Credential present; login is offered.
    Configured,
    /// Marker present but credential gone; everything is refused.
    ConfigMissing,
}

/// Setup refusals.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Password below the minimum length.
    #[error("password must be at least {min} characters")]
    TooShort { min: usize },

    /// Confirmation differs from the password.
    #[error("passwords do not match")]
    Mismatch,

    /// A credential file already exists.
    #[error("setup has already been completed")]
    AlreadyConfigured,

    /// Setup completed earlier but the credential is gone.
    #[error("credential file is missing; restore it to continue")]
    ConfigMissing,

    /// Hashing failed.
    #[error("failed to hash password: {0}")]
    Hash(String),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failures while checking a password.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The credential file does not exist.
    #[error("credential file missing: {0}")]
    Missing(PathBuf),

    /// The credential file could not be parsed.
    #[error("credential file is corrupt: {0}")]
    Corrupt(String),

    /// The document version is not understood.
    #[error("unsupported credential format version {0}")]
    UnsupportedVersion(u32),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<CredentialError> for GuardError {
    fn from(err: CredentialError) -> Self {
        GuardError::Configuration(err.to_string())
    }
}

impl From<SetupError> for GuardError {
    fn from(err: SetupError) -> Self {
        match err {
            SetupError::TooShort { .. } | SetupError::Mismatch => {
                GuardError::Validation(err.to_string())
            }
            SetupError::AlreadyConfigured => GuardError::Authorization(err.to_string()),
            SetupError::ConfigMissing | SetupError::Hash(_) => {
                GuardError::Configuration(err.to_string())
            }
            SetupError::Io(e) => GuardError::Io(e),
        }
    }
}

/// Checks a submitted password against the stored credential.
///
/// The authenticator depends on this trait rather than on the store so the
/// lockout logic can be exercised without hashing.
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(true)` on match, `Ok(false)` on mismatch.
    fn verify(&self, password: &str) -> Result<bool, CredentialError>;
}

/// File-backed credential store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    credential_path: PathBuf,
    marker_path: PathBuf,
    min_password_length: usize,
}

impl CredentialStore {
    /// Store keeping its files in `data_dir`.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let dir = data_dir.as_ref();
        Self {
            credential_path: dir.join(CREDENTIAL_FILE),
            marker_path: dir.join(SETUP_MARKER),
            min_password_length: MIN_PASSWORD_LENGTH,
        }
    }

    /// Override the minimum password length.
    pub fn with_min_password_length(mut self, min: usize) -> Self {
        self.min_password_length = min;
        self
    }

    /// Path of the credential file.
    pub fn credential_path(&self) -> &Path {
        &self.credential_path
    }

    /// Path of the setup marker.
    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    /// Whether the credential file exists.
    ///
    /// A path whose existence cannot be determined counts as present.
    pub fn exists(&self) -> bool {
        present(&self.credential_path)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SetupState {
        if self.exists() {
            SetupState::Configured
        } else if present(&self.marker_path) {
            SetupState::ConfigMissing
        } else {
            SetupState::Unconfigured
        }
    }

    /// Perform first-run setup.
    pub fn create(&self, password: &str, confirmation: &str) -> Result<(), SetupError> {
        match self.state() {
            SetupState::Configured => return Err(SetupError::AlreadyConfigured),
            SetupState::ConfigMissing => return Err(SetupError::ConfigMissing),
            SetupState::Unconfigured => {}
        }

        if password.chars().count() < self.min_password_length {
            return Err(SetupError::TooShort {
                min: self.min_password_length,
            });
        }
        if password != confirmation {
            return Err(SetupError::Mismatch);
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| SetupError::Hash(e.to_string()))?
            .to_string();

        let document = CredentialDocument {
            version: CREDENTIAL_FORMAT_VERSION,
            password_hash,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| SetupError::Io(io::Error::other(e)))?;

        if let Some(parent) = self.credential_path.parent() {
            fs::create_dir_all(parent)?;
        }

        match write_exclusive(&self.credential_path, &json, 0o600) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(SetupError::AlreadyConfigured);
            }
            Err(e) => return Err(e.into()),
        }

        let stamp = format!("{}\n", document.created_at.to_rfc3339());
        if let Err(e) = write_exclusive(&self.marker_path, stamp.as_bytes(), 0o400) {
            warn!(error = %e, "Failed to write setup marker, rolling back credential");
            if let Err(rollback) = fs::remove_file(&self.credential_path) {
                warn!(error = %rollback, "Failed to remove credential after marker failure");
            }
            return Err(e.into());
        }

        info!(path = ?self.credential_path, "Credential created");
        Ok(())
    }

    fn load(&self) -> Result<CredentialDocument, CredentialError> {
        let data = match fs::read(&self.credential_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CredentialError::Missing(self.credential_path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let document: CredentialDocument =
            serde_json::from_slice(&data).map_err(|e| CredentialError::Corrupt(e.to_string()))?;

        if document.version != CREDENTIAL_FORMAT_VERSION {
            return Err(CredentialError::UnsupportedVersion(document.version));
        }
        Ok(document)
    }
}

impl CredentialVerifier for CredentialStore {
    fn verify(&self, password: &str) -> Result<bool, CredentialError> {
        let document = self.load()?;
        let parsed = PasswordHash::new(&document.password_hash)
            .map_err(|e| CredentialError::Corrupt(e.to_string()))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => {
                debug!(error = %e, "Password hash verification error");
                Err(CredentialError::Corrupt(e.to_string()))
            }
        }
    }
}

fn present(path: &Path) -> bool {
    path.try_exists().unwrap_or(true)
}

#[cfg_attr(not(unix), allow(unused_variables))]
fn write_exclusive(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_initial_state_unconfigured() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());

        assert_eq!(store.state(), SetupState::Unconfigured);
        assert!(!store.exists());
    }

    #[test]
    fn test_setup_succeeds_once() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());

        store.create("correct horse", "correct horse").unwrap();
        assert_eq!(store.state(), SetupState::Configured);
        assert!(store.marker_path().exists());

        let second = store.create("another password", "another password");
        assert!(matches!(second, Err(SetupError::AlreadyConfigured)));

        // The original password still works.
        assert!(store.verify("correct horse").unwrap());
        assert!(!store.verify("another password").unwrap());
    }

    #[test]
    fn test_setup_creates_data_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path().join("nested/data"));

        store.create("password123", "password123").unwrap();
        assert!(store.credential_path().exists());
    }

    #[test]
    fn test_length_checked_before_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());

        let result = store.create("short", "different");
        assert!(matches!(result, Err(SetupError::TooShort { min: 8 })));

        let result = store.create("long enough", "different");
        assert!(matches!(result, Err(SetupError::Mismatch)));

        assert_eq!(store.state(), SetupState::Unconfigured);
    }

    #[test]
    fn test_length_counts_characters() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());

        // 4 characters, 8 bytes.
        let result = store.create("ääää", "ääää");
        assert!(matches!(result, Err(SetupError::TooShort { .. })));

        store.create("ääääääää", "ääääääää").unwrap();
        assert!(store.verify("ääääääää").unwrap());
    }

    #[test]
    fn test_custom_min_length() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path()).with_min_password_length(12);

        let result = store.create("elevenchars", "elevenchars");
        assert!(matches!(result, Err(SetupError::TooShort { min: 12 })));
    }

    #[test]
    fn test_verify_wrong_password() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        store.create("password123", "password123").unwrap();

        assert!(!store.verify("password124").unwrap());
        assert!(!store.verify("").unwrap());
    }

    #[test]
    fn test_deleted_credential_stays_locked() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        store.create("password123", "password123").unwrap();

        fs::remove_file(store.credential_path()).unwrap();

        assert_eq!(store.state(), SetupState::ConfigMissing);
        let result = store.create("newpassword", "newpassword");
        assert!(matches!(result, Err(SetupError::ConfigMissing)));
        assert!(matches!(
            store.verify("password123"),
            Err(CredentialError::Missing(_))
        ));
    }

    #[test]
    fn test_corrupt_credential() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        fs::write(store.credential_path(), "not json").unwrap();

        // Presence alone blocks setup.
        assert_eq!(store.state(), SetupState::Configured);
        assert!(matches!(
            store.create("password123", "password123"),
            Err(SetupError::AlreadyConfigured)
        ));
        assert!(matches!(
            store.verify("password123"),
            Err(CredentialError::Corrupt(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        fs::write(
            store.credential_path(),
            r#"{"version":99,"password_hash":"x","created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(matches!(
            store.verify("anything"),
            Err(CredentialError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_document_format() {
        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        store.create("password123", "password123").unwrap();

        let raw = fs::read_to_string(store.credential_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["password_hash"]
            .as_str()
            .unwrap()
            .starts_with("$argon2id$"));
        assert!(!raw.contains("password123"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = CredentialStore::new(temp_dir.path());
        store.create("password123", "password123").unwrap();

        let mode = fs::metadata(store.credential_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let mode = fs::metadata(store.marker_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }

    #[test]
    fn test_setup_error_categories() {
        assert_eq!(
            GuardError::from(SetupError::Mismatch).status_code(),
            400
        );
        assert_eq!(
            GuardError::from(SetupError::ConfigMissing).status_code(),
            500
        );
        assert_eq!(
            GuardError::from(CredentialError::Missing(PathBuf::from("x"))).error_code(),
            "configuration_error"
        );
    }
}
