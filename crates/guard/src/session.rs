//! Login state, brute-force lockout and session lifecycle.
//!
//! Each browser session is an [`AuthSession`] behind its own async mutex in
//! the [`SessionStore`]. The lock is held for the whole login attempt,
//! including password verification, so concurrent tabs cannot race the
//! attempt counter or the CSRF table.
//!
//! [`SessionAuthenticator`] implements the state machine. Failures are
//! counted twice: on the session and on a record keyed by the client source
//! address. Discarding the cookie therefore does not reset the lockout.
//!
//!
//! ```text
//! ANONYMOUS --5 failures--> LOCKED_OUT --window elapses--> ANONYMOUS
//! ANONYMOUS --correct password--> AUTHENTICATED --logout--> ANONYMOUS
//! ```
//!
//! All timestamps are Unix seconds supplied by the caller.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::Auditor;
use crate::credential::{CredentialError, CredentialVerifier};
use crate::csrf::CsrfTokens;

/// Failed attempts that trigger a lockout.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Lockout duration in seconds.
pub const DEFAULT_LOCKOUT_SECS: i64 = 900;

/// Idle time after which a session is discarded.
pub const DEFAULT_SESSION_IDLE_SECS: i64 = 1440;

/// Sessions held before anonymous ones are evicted.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

const SESSION_ID_BYTES: usize = 32;

/// Current time as Unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Opaque session identifier carried in the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accept a cookie value only if it has the shape of a generated id.
    pub fn parse(value: &str) -> Option<Self> {
        let well_formed = value.len() == SESSION_ID_BYTES * 2
            && value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        well_formed.then(|| Self(value.to_string()))
    }

    /// Cookie value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a prefix goes to logs.
        write!(f, "{}…", &self.0[..8.min(self.0.len())])
    }
}

/// Per-session authentication state.
#[derive(Debug, Clone, Default)]
pub struct AuthSession {
    /// Whether the session has authenticated.
    pub logged_in: bool,
    /// Consecutive failed attempts since the last success.
    pub attempts: u32,
    /// Time of the last failed attempt.
    pub last_attempt_at: i64,
    /// Logins are refused until this time.
    pub lock_until: i64,
    /// CSRF tokens issued to this session.
    pub csrf: CsrfTokens,
}

impl AuthSession {
    /// Fresh anonymous session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a lockout is in force at `now`.
    pub fn is_locked(&self, now: i64) -> bool {
        now < self.lock_until
    }

    /// Whole minutes until the lockout ends, rounded up.
    pub fn retry_minutes(&self, now: i64) -> i64 {
        minutes_until(self.lock_until, now)
    }
}

fn minutes_until(lock_until: i64, now: i64) -> i64 {
    let remaining = (lock_until - now).max(0);
    (remaining + 59) / 60
}

/// Failure counters for one client source.
#[derive(Debug, Clone, Copy, Default)]
struct SourceLock {
    attempts: u32,
    last_attempt_at: i64,
    lock_until: i64,
}

/// Lockout thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub lockout_secs: i64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout_secs: DEFAULT_LOCKOUT_SECS,
        }
    }
}

/// Result of a login submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Password accepted. The caller must rotate the session id.
    Authenticated,
    /// Wrong password, below the lockout threshold.
    Rejected { attempts: u32 },
    /// Wrong password that reached the threshold.
    LockoutEngaged { attempts: u32, retry_minutes: i64 },
    /// Refused without checking the password.
    LockedOut { retry_minutes: i64 },
    /// The credential could not be read.
    Misconfigured(String),
}

/// Drives [`AuthSession`] through the login state machine.
///
/// The client source is taken from the [`Auditor`] passed to each call, so
/// the address that is audited is the address that is locked.
#[derive(Debug, Clone, Default)]
pub struct SessionAuthenticator {
    policy: LockoutPolicy,
    sources: Arc<DashMap<String, SourceLock>>,
}

impl SessionAuthenticator {
    /// Authenticator using `policy`.
    pub fn new(policy: LockoutPolicy) -> Self {
        Self {
            policy,
            sources: Arc::new(DashMap::new()),
        }
    }

    /// Lockout thresholds in force.
    pub fn policy(&self) -> LockoutPolicy {
        self.policy
    }

    /// Full login attempt with a synchronous verifier.
    pub fn login(
        &self,
        session: &mut AuthSession,
        password: &str,
        verifier: &dyn CredentialVerifier,
        now: i64,
        auditor: &Auditor,
    ) -> LoginOutcome {
        if let Some(outcome) = self.check_lockout(session, now, auditor) {
            return outcome;
        }
        let verified = verifier.verify(password);
        self.record_attempt(session, verified, now, auditor)
    }

    /// First half of a login: refuse early if the session or its source
    /// address is locked.
    ///
    /// Returns `None` when the password should be verified. A refusal does
    /// not consume an attempt.
    pub fn check_lockout(
        &self,
        session: &AuthSession,
        now: i64,
        auditor: &Auditor,
    ) -> Option<LoginOutcome> {
        let source_lock = self
            .sources
            .get(auditor.source())
            .map(|record| record.lock_until)
            .unwrap_or(0);
        let lock_until = session.lock_until.max(source_lock);
        if now >= lock_until {
            return None;
        }

        let retry_minutes = minutes_until(lock_until, now);
        debug!(retry_minutes, "Login refused during lockout");
        auditor.event("login_locked", json!({ "retry_minutes": retry_minutes }));
        Some(LoginOutcome::LockedOut { retry_minutes })
    }

    /// Second half of a login: apply the verifier's answer.
    pub fn record_attempt(
        &self,
        session: &mut AuthSession,
        verified: Result<bool, CredentialError>,
        now: i64,
        auditor: &Auditor,
    ) -> LoginOutcome {
        match verified {
            Ok(true) => {
                session.logged_in = true;
                session.attempts = 0;
                session.lock_until = 0;
                session.last_attempt_at = 0;
                self.sources.remove(auditor.source());
                info!("Login succeeded");
                auditor.event("login_success", json!({}));
                LoginOutcome::Authenticated
            }
            Ok(false) => {
                session.attempts = session.attempts.saturating_add(1);
                session.last_attempt_at = now;

                let lock_until = now + self.policy.lockout_secs;
                let attempts = {
                    let mut record = self.sources.entry(auditor.source().to_string()).or_default();
                    record.attempts = record.attempts.saturating_add(1);
                    record.last_attempt_at = now;
                    let attempts = record.attempts.max(session.attempts);
                    if attempts >= self.policy.max_attempts {
                        record.lock_until = lock_until;
                    }
                    attempts
                };

                auditor.event("login_failed", json!({ "attempts": attempts }));

                if attempts >= self.policy.max_attempts {
                    session.lock_until = lock_until;
                    let retry_minutes = session.retry_minutes(now);
                    warn!(attempts, retry_minutes, "Login lockout engaged");
                    auditor.event(
                        "lockout_engaged",
                        json!({ "attempts": attempts, "lock_until": session.lock_until }),
                    );
                    LoginOutcome::LockoutEngaged {
                        attempts,
                        retry_minutes,
                    }
                } else {
                    info!(attempts, "Login failed");
                    LoginOutcome::Rejected { attempts }
                }
            }
            Err(e) => {
                warn!(error = %e, "Credential unavailable during login");
                auditor.event("credential_unavailable", json!({ "error": e.to_string() }));
                LoginOutcome::Misconfigured(e.to_string())
            }
        }
    }

    /// Return the session to anonymous. The caller destroys the record.
    pub fn logout(&self, session: &mut AuthSession, auditor: &Auditor) {
        let was_logged_in = session.logged_in;
        *session = AuthSession::new();
        info!(was_logged_in, "Logged out");
        auditor.event("logout", json!({}));
    }

    /// Drop source records that are no longer relevant.
    ///
    /// A record outlives its lockout by one further window so a client that
    /// returns right away still starts at the threshold.
    pub fn sweep(&self, now: i64) -> usize {
        let window = self.policy.lockout_secs;
        let before = self.sources.len();
        self.sources.retain(|_, record| {
            now - record.last_attempt_at <= window || now < record.lock_until + window
        });
        let removed = before.saturating_sub(self.sources.len());
        if removed > 0 {
            debug!(removed, "Swept login failure records");
        }
        removed
    }

    /// Number of client sources with recorded failures.
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }

    /// Periodically sweep source records in the background.
    pub fn start_sweep_task(&self, interval_secs: u64) {
        let authenticator = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(interval_secs);
            loop {
                tokio::time::sleep(interval).await;
                authenticator.sweep(unix_now());
            }
        });
    }
}

/// Shared handle to one session.
pub type SessionHandle = Arc<Mutex<AuthSession>>;

struct SessionEntry {
    handle: SessionHandle,
    last_seen: AtomicI64,
}

/// Thread-safe session table with idle expiry and a size cap.
pub struct SessionStore {
    sessions: DashMap<SessionId, SessionEntry>,
    idle_secs: i64,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_IDLE_SECS)
    }
}

impl SessionStore {
    /// Store discarding sessions idle longer than `idle_secs`.
    pub fn new(idle_secs: i64) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_secs,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// Set the number of sessions held before anonymous ones are evicted.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    /// Create an anonymous session.
    ///
    /// When the store is full, idle sessions are swept first and then the
    /// least recently seen anonymous session is evicted.
    pub fn create(&self, now: i64) -> (SessionId, SessionHandle) {
        if self.sessions.len() >= self.max_sessions {
            self.make_room(now);
        }

        let id = SessionId::generate();
        let handle: SessionHandle = Arc::new(Mutex::new(AuthSession::new()));
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                handle: Arc::clone(&handle),
                last_seen: AtomicI64::new(now),
            },
        );
        debug!(session_id = %id, "Created session");
        (id, handle)
    }

    fn make_room(&self, now: i64) {
        if self.sweep(now) > 0 && self.sessions.len() < self.max_sessions {
            return;
        }

        // Sessions busy in a request or logged in are never evicted.
        let victim = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .handle
                    .try_lock()
                    .map(|session| !session.logged_in)
                    .unwrap_or(false)
            })
            .min_by_key(|entry| entry.last_seen.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());

        match victim {
            Some(id) => {
                self.sessions.remove(&id);
                warn!(session_id = %id, "Session store full, evicted anonymous session");
            }
            None => warn!(
                sessions = self.sessions.len(),
                "Session store full of active sessions"
            ),
        }
    }

    /// Look up a live session and mark it as seen.
    ///
    /// An idle session is removed and reported as absent.
    pub fn get(&self, id: &SessionId, now: i64) -> Option<SessionHandle> {
        {
            let entry = self.sessions.get(id)?;
            let last_seen = entry.last_seen.load(Ordering::Relaxed);
            if now - last_seen <= self.idle_secs {
                entry.last_seen.store(now, Ordering::Relaxed);
                return Some(Arc::clone(&entry.handle));
            }
        }

        self.sessions.remove(id);
        debug!(session_id = %id, "Session expired");
        None
    }

    /// Existing live session for `id`, or a new one.
    ///
    /// The boolean is true when a session was created.
    pub fn get_or_create(
        &self,
        id: Option<&SessionId>,
        now: i64,
    ) -> (SessionId, SessionHandle, bool) {
        if let Some(id) = id {
            if let Some(handle) = self.get(id, now) {
                return (id.clone(), handle, false);
            }
        }
        let (id, handle) = self.create(now);
        (id, handle, true)
    }

    /// Move a session to a fresh identifier, invalidating the old one.
    pub fn regenerate(&self, id: &SessionId) -> Option<SessionId> {
        let (_, entry) = self.sessions.remove(id)?;
        let new_id = SessionId::generate();
        self.sessions.insert(new_id.clone(), entry);
        debug!(old = %id, new = %new_id, "Regenerated session id");
        Some(new_id)
    }

    /// Remove a session. Returns whether it existed.
    pub fn destroy(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Remove all idle sessions, returning how many were dropped.
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| now - entry.last_seen.load(Ordering::Relaxed) <= self.idle_secs);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!(removed, "Swept idle sessions");
        }
        removed
    }

    /// Number of sessions held.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Periodically sweep idle sessions in the background.
    pub fn start_sweep_task(self: &Arc<Self>, interval_secs: u64) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(interval_secs);
            loop {
                tokio::time::sleep(interval).await;
                store.sweep(unix_now());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use std::sync::atomic::AtomicUsize;

    const T0: i64 = 1_700_000_000;

    /// Verifier that accepts "right" and counts calls.
    #[derive(Default)]
    struct CountingVerifier {
        calls: AtomicUsize,
    }

    impl CountingVerifier {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CredentialVerifier for CountingVerifier {
        fn verify(&self, password: &str) -> Result<bool, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(password == "right")
        }
    }

    struct BrokenVerifier;

    impl CredentialVerifier for BrokenVerifier {
        fn verify(&self, _password: &str) -> Result<bool, CredentialError> {
            Err(CredentialError::Missing("credential.json".into()))
        }
    }

    fn auditor() -> (Arc<MemoryAuditLog>, Auditor) {
        let sink = Arc::new(MemoryAuditLog::new());
        let auditor = Auditor::new(sink.clone(), "192.0.2.1");
        (sink, auditor)
    }

    #[test]
    fn test_successful_login() {
        let (sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        let outcome = authenticator.login(&mut session, "right", &verifier, T0, &auditor);

        assert_eq!(outcome, LoginOutcome::Authenticated);
        assert!(session.logged_in);
        assert_eq!(session.attempts, 0);
        assert!(sink.contains("login_success"));
    }

    #[test]
    fn test_failed_logins_count_up() {
        let (sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        for expected in 1..=4 {
            let outcome = authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
            assert_eq!(outcome, LoginOutcome::Rejected { attempts: expected });
        }
        assert!(!session.logged_in);
        assert_eq!(session.last_attempt_at, T0);

        let last = sink.records().pop().unwrap();
        assert_eq!(last.event, "login_failed");
        assert_eq!(last.context["attempts"], 4);
    }

    #[test]
    fn test_fifth_failure_engages_lockout() {
        let (sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        for _ in 0..4 {
            authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        }
        let outcome = authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);

        assert_eq!(
            outcome,
            LoginOutcome::LockoutEngaged {
                attempts: 5,
                retry_minutes: 15
            }
        );
        assert_eq!(session.lock_until, T0 + 900);
        assert_eq!(session.attempts, 5);
        assert!(sink.contains("lockout_engaged"));
    }

    #[test]
    fn test_locked_session_skips_verifier() {
        let (sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        for _ in 0..5 {
            authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        }
        assert_eq!(verifier.calls(), 5);

        // Even the correct password is refused during the window.
        let outcome = authenticator.login(&mut session, "right", &verifier, T0 + 60, &auditor);
        assert_eq!(outcome, LoginOutcome::LockedOut { retry_minutes: 14 });
        assert_eq!(verifier.calls(), 5);
        assert_eq!(session.attempts, 5);
        assert!(!session.logged_in);
        assert!(sink.contains("login_locked"));
    }

    #[test]
    fn test_retry_minutes_rounds_up() {
        let mut session = AuthSession::new();
        session.lock_until = T0 + 61;
        assert_eq!(session.retry_minutes(T0), 2);
        assert_eq!(session.retry_minutes(T0 + 1), 1);
        assert_eq!(session.retry_minutes(T0 + 60), 1);
        assert_eq!(session.retry_minutes(T0 + 61), 0);
    }

    #[test]
    fn test_attempts_resume_after_window() {
        let (_sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        for _ in 0..5 {
            authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        }

        // Counter is retained, so one more failure re-locks immediately.
        let after = T0 + 900;
        let outcome = authenticator.login(&mut session, "wrong", &verifier, after, &auditor);
        assert_eq!(
            outcome,
            LoginOutcome::LockoutEngaged {
                attempts: 6,
                retry_minutes: 15
            }
        );
        assert_eq!(verifier.calls(), 6);

        // Success after the next window resets everything.
        let later = after + 900;
        let outcome = authenticator.login(&mut session, "right", &verifier, later, &auditor);
        assert_eq!(outcome, LoginOutcome::Authenticated);
        assert_eq!(session.attempts, 0);
        assert_eq!(session.lock_until, 0);
    }

    #[test]
    fn test_custom_policy() {
        let (_sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::new(LockoutPolicy {
            max_attempts: 2,
            lockout_secs: 60,
        });
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        let outcome = authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        assert_eq!(
            outcome,
            LoginOutcome::LockoutEngaged {
                attempts: 2,
                retry_minutes: 1
            }
        );
    }

    #[test]
    fn test_misconfigured_does_not_consume_attempt() {
        let (sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let mut session = AuthSession::new();

        let outcome = authenticator.login(&mut session, "right", &BrokenVerifier, T0, &auditor);

        assert!(matches!(outcome, LoginOutcome::Misconfigured(_)));
        assert_eq!(session.attempts, 0);
        assert!(!session.logged_in);
        assert!(sink.contains("credential_unavailable"));
    }

    #[test]
    fn test_password_never_audited() {
        let (sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        authenticator.login(&mut session, "hunter2-secret", &verifier, T0, &auditor);
        authenticator.login(&mut session, "right", &verifier, T0, &auditor);

        for record in sink.records() {
            assert!(!record.context.to_string().contains("hunter2-secret"));
            assert!(!record.context.to_string().contains("right"));
        }
    }

    #[test]
    fn test_logout_resets_session() {
        let (sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        authenticator.login(&mut session, "right", &verifier, T0, &auditor);
        authenticator.logout(&mut session, &auditor);

        assert!(!session.logged_in);
        assert!(sink.contains("logout"));
    }

    #[test]
    fn test_lockout_survives_fresh_session() {
        let (sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut first = AuthSession::new();

        for _ in 0..5 {
            authenticator.login(&mut first, "wrong", &verifier, T0, &auditor);
        }

        // Same client, new cookie.
        let mut second = AuthSession::new();
        let outcome = authenticator.login(&mut second, "right", &verifier, T0 + 60, &auditor);

        assert_eq!(outcome, LoginOutcome::LockedOut { retry_minutes: 14 });
        assert_eq!(verifier.calls(), 5);
        assert!(!second.logged_in);
        assert!(sink.contains("login_locked"));
    }

    #[test]
    fn test_failures_accumulate_across_sessions() {
        let (_sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();

        for _ in 0..4 {
            let mut session = AuthSession::new();
            authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        }
        let mut session = AuthSession::new();
        let outcome = authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);

        assert_eq!(
            outcome,
            LoginOutcome::LockoutEngaged {
                attempts: 5,
                retry_minutes: 15
            }
        );
        assert_eq!(session.lock_until, T0 + 900);
    }

    #[test]
    fn test_lockout_is_per_source() {
        let (_sink, auditor) = auditor();
        let other = Auditor::new(Arc::new(MemoryAuditLog::new()), "198.51.100.7");
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        for _ in 0..5 {
            authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        }

        let mut elsewhere = AuthSession::new();
        let outcome = authenticator.login(&mut elsewhere, "right", &verifier, T0, &other);
        assert_eq!(outcome, LoginOutcome::Authenticated);
    }

    #[test]
    fn test_success_clears_source_record() {
        let (_sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        assert_eq!(authenticator.tracked_sources(), 1);

        authenticator.login(&mut session, "right", &verifier, T0, &auditor);
        assert_eq!(authenticator.tracked_sources(), 0);

        // A later failure from a new session starts from one.
        let mut fresh = AuthSession::new();
        let outcome = authenticator.login(&mut fresh, "wrong", &verifier, T0, &auditor);
        assert_eq!(outcome, LoginOutcome::Rejected { attempts: 1 });
    }

    #[test]
    fn test_sweep_keeps_records_one_window_past_lockout() {
        let (_sink, auditor) = auditor();
        let authenticator = SessionAuthenticator::default();
        let verifier = CountingVerifier::default();
        let mut session = AuthSession::new();

        for _ in 0..5 {
            authenticator.login(&mut session, "wrong", &verifier, T0, &auditor);
        }

        assert_eq!(authenticator.sweep(T0 + 900), 0);
        assert_eq!(authenticator.sweep(T0 + 1799), 0);
        assert_eq!(authenticator.sweep(T0 + 1801), 1);
        assert_eq!(authenticator.tracked_sources(), 0);

        let mut single = AuthSession::new();
        authenticator.login(&mut single, "wrong", &verifier, T0, &auditor);
        assert_eq!(authenticator.sweep(T0 + 901), 1);
    }

    #[test]
    fn test_session_id_format() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(SessionId::parse(id.as_str()), Some(id.clone()));

        assert_eq!(SessionId::parse("short"), None);
        assert_eq!(SessionId::parse(&"G".repeat(64)), None);
        assert_eq!(SessionId::parse(&"A".repeat(64)), None);
        assert_ne!(SessionId::generate(), SessionId::generate());

        // Display never shows the full id.
        assert!(!id.to_string().contains(id.as_str()));
    }

    #[tokio::test]
    async fn test_store_create_and_get() {
        let store = SessionStore::default();
        let (id, handle) = store.create(T0);

        handle.lock().await.logged_in = true;

        let fetched = store.get(&id, T0 + 10).unwrap();
        assert!(fetched.lock().await.logged_in);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_idle_expiry() {
        let store = SessionStore::new(1440);
        let (id, _) = store.create(T0);

        assert!(store.get(&id, T0 + 1440).is_some());
        // Access refreshed last_seen.
        assert!(store.get(&id, T0 + 2880).is_some());
        assert!(store.get(&id, T0 + 2880 + 1441).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_get_or_create() {
        let store = SessionStore::default();

        let (id, _, created) = store.get_or_create(None, T0);
        assert!(created);

        let (same, _, created) = store.get_or_create(Some(&id), T0);
        assert!(!created);
        assert_eq!(same, id);

        let unknown = SessionId::generate();
        let (fresh, _, created) = store.get_or_create(Some(&unknown), T0);
        assert!(created);
        assert_ne!(fresh, unknown);
    }

    #[tokio::test]
    async fn test_store_regenerate_keeps_state() {
        let store = SessionStore::default();
        let (old_id, handle) = store.create(T0);
        handle.lock().await.logged_in = true;

        let new_id = store.regenerate(&old_id).unwrap();

        assert_ne!(new_id, old_id);
        assert!(store.get(&old_id, T0).is_none());
        let moved = store.get(&new_id, T0).unwrap();
        assert!(moved.lock().await.logged_in);
        assert!(store.regenerate(&old_id).is_none());
    }

    #[tokio::test]
    async fn test_store_evicts_oldest_anonymous_when_full() {
        let store = SessionStore::new(1440).with_max_sessions(3);
        let (admin, admin_handle) = store.create(T0);
        admin_handle.lock().await.logged_in = true;
        let (oldest, _) = store.create(T0 + 1);
        let (newer, _) = store.create(T0 + 2);

        let (latest, _) = store.create(T0 + 3);

        assert_eq!(store.len(), 3);
        assert!(store.get(&admin, T0 + 3).is_some());
        assert!(store.get(&oldest, T0 + 3).is_none());
        assert!(store.get(&newer, T0 + 3).is_some());
        assert!(store.get(&latest, T0 + 3).is_some());
    }

    #[test]
    fn test_store_full_prefers_sweeping_idle() {
        let store = SessionStore::new(100).with_max_sessions(2);
        let (idle, _) = store.create(T0);
        let (recent, _) = store.create(T0 + 150);

        store.create(T0 + 150);

        assert_eq!(store.len(), 2);
        assert!(store.get(&idle, T0 + 150).is_none());
        assert!(store.get(&recent, T0 + 150).is_some());
    }

    #[test]
    fn test_store_destroy_and_sweep() {
        let store = SessionStore::new(100);
        let (a, _) = store.create(T0);
        let (_b, _) = store.create(T0 + 50);
        let (_c, _) = store.create(T0 + 200);

        assert!(store.destroy(&a));
        assert!(!store.destroy(&a));

        assert_eq!(store.sweep(T0 + 200), 1);
        assert_eq!(store.len(), 1);
    }
}
