//! Shared application state.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use guard::{
    AuditSink, Auditor, CredentialStore, CsrfTokenManager, FileAuditLog, PathResolver,
    ReservedPaths, Root, SessionAuthenticator, SessionStore, StagingArea, UploadValidator,
};
use tracing::{info, warn};

use crate::config::Config;

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub resolver: Arc<PathResolver>,
    pub credentials: CredentialStore,
    pub sessions: Arc<SessionStore>,
    pub authenticator: SessionAuthenticator,
    pub csrf: CsrfTokenManager,
    pub uploads: Arc<UploadValidator>,
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    /// Build state writing audit records under the data directory.
    ///
    /// `config_path` is the file the configuration came from, if any. It is
    /// reserved alongside the credential and audit files.
    pub fn from_config(config: Config, config_path: Option<&Path>) -> Result<Self> {
        let audit: Arc<dyn AuditSink> = Arc::new(FileAuditLog::new(config.storage.audit_dir()));
        Self::with_audit_sink(config, config_path, audit)
    }

    /// Build state around an explicit audit sink.
    pub fn with_audit_sink(
        config: Config,
        config_path: Option<&Path>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let storage = &config.storage;

        fs::create_dir_all(&storage.root).with_context(|| {
            format!("Failed to create root directory: {}", storage.root.display())
        })?;
        let root = Root::new(&storage.root)
            .with_context(|| format!("Invalid root directory: {}", storage.root.display()))?;

        create_private_dir(&storage.data_dir)?;

        let staging = Arc::new(
            StagingArea::new(storage.staging_dir()).context("Failed to prepare staging area")?,
        );
        match staging.clear_stale() {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed stale staged uploads"),
            Err(e) => warn!(error = %e, "Failed to clear staging area"),
        }

        let credentials = CredentialStore::new(&storage.data_dir)
            .with_min_password_length(config.security.min_password_length);

        let mut reserved = ReservedPaths::new()
            .with(credentials.credential_path())
            .with(credentials.marker_path())
            .with(storage.audit_dir())
            .with(staging.dir());
        if let Some(path) = config_path {
            reserved.insert(path);
        }

        let resolver = Arc::new(PathResolver::new(root, reserved.clone()));
        let uploads = Arc::new(UploadValidator::new(
            config.upload.policy(),
            Arc::clone(&staging),
            reserved,
        ));

        info!(
            root = %resolver.root().as_path().display(),
            data_dir = %storage.data_dir.display(),
            state = ?credentials.state(),
            "Application state ready"
        );

        Ok(Self {
            sessions: Arc::new(
                SessionStore::new(config.security.session_idle_secs as i64)
                    .with_max_sessions(config.security.max_sessions),
            ),
            authenticator: SessionAuthenticator::new(config.security.lockout_policy()),
            csrf: CsrfTokenManager::new(config.security.csrf_ttl_secs as i64),
            config: Arc::new(config),
            resolver,
            credentials,
            uploads,
            audit,
        })
    }

    /// Audit handle attributing events to `source`.
    pub fn auditor(&self, source: &str) -> Auditor {
        Auditor::new(Arc::clone(&self.audit), source)
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create data directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700)).with_context(|| {
            format!("Failed to restrict data directory: {}", path.display())
        })?;
    }

    Ok(())
}
