//! # Fileward Guard Library
//!
//! This crate holds the security decisions of the Fileward file manager:
//! whether a requested path may be touched and whether a request is allowed
//! to act. It knows nothing about HTTP; the server crate turns its outcomes
//! into responses.
//!
//! ## Overview
//!
//! - **Path Confinement**: resolve user paths against a fixed root, refusing
//!   traversal, symlink escapes and reserved files
//! - **Credential Store**: one Argon2id password hash, created exactly once
//! - **Sessions**: login state machine with brute-force lockout
//! - **CSRF Tokens**: per-action, single-use, expiring tokens
//! - **Upload Validation**: per-file rules and exclusive placement
//! - **Audit Trail**: JSON-lines record of every security decision
//!
//! ## Request Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   SessionStore / SessionAuthenticator       │  logged in? locked out?
//! ├─────────────────────────────────────────────┤
//! │           CsrfTokenManager                  │  mutating requests only
//! ├─────────────────────────────────────────────┤
//! │             PathResolver                    │  every path argument
//! ├─────────────────────────────────────────────┤
//! │            UploadValidator                  │  upload batches
//! └─────────────────────────────────────────────┘
//!                    │
//!                    ▼
//!                AuditSink
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use guard::{Auditor, MemoryAuditLog, PathResolver, ReservedPaths, Root};
//!
//! let root = Root::new("/srv/files").unwrap();
//! let resolver = PathResolver::new(root, ReservedPaths::new());
//! let auditor = Auditor::new(Arc::new(MemoryAuditLog::new()), "127.0.0.1");
//!
//! match resolver.resolve_audited("reports/2024", &auditor) {
//!     Ok(dir) => println!("listing {}", dir.relative()),
//!     Err(e) => println!("refused: {e}"),
//! }
//! ```
//!
//! ## Modules
//!
//! - [`path`]: Root, resolved paths and the resolver
//! - [`credential`]: First-run setup and password verification
//! - [`session`]: Login state, lockout and the session table
//! - [`csrf`]: Per-action tokens
//! - [`upload`]: Staging area and upload rules
//! - [`audit`]: Audit sinks
//! - [`error`]: Error taxonomy

pub mod audit;
pub mod credential;
pub mod csrf;
pub mod error;
pub mod path;
pub mod session;
pub mod upload;

pub use audit::{AuditRecord, AuditSink, Auditor, FileAuditLog, MemoryAuditLog, AUDIT_LOG_FILE};
pub use credential::{
    CredentialError, CredentialStore, CredentialVerifier, SetupError, SetupState,
    CREDENTIAL_FILE, MIN_PASSWORD_LENGTH, SETUP_MARKER,
};
pub use csrf::{CsrfAction, CsrfTokenManager, CsrfTokens, CSRF_TOKEN_TTL_SECS};
pub use error::{GuardError, Result};
pub use path::{PathResolver, ReservedPaths, ResolveError, ResolvedPath, Root};
pub use session::{
    unix_now, AuthSession, LockoutPolicy, LoginOutcome, SessionAuthenticator, SessionHandle,
    SessionId, SessionStore,
};
pub use upload::{
    sanitize_filename, SanitizedName, StagedFile, StagingArea, StagingError, TransferErrorKind,
    Truncation, UploadItem, UploadOutcome, UploadPolicy, UploadRejection, UploadReport,
    UploadValidator,
};
