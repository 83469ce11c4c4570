//! Per-action, single-use CSRF tokens.
//!
//! Tokens live inside the session ([`CsrfTokens`]) and are keyed by the
//! action they protect, so a token issued for the login form cannot
//! authorize a bulk delete. A token is consumed by the first successful
//! validation.

use std::collections::HashMap;
use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Default token lifetime in seconds.
pub const CSRF_TOKEN_TTL_SECS: i64 = 1800;

/// Random bytes per token (hex-encoded on the wire).
const TOKEN_BYTES: usize = 32;

/// Mutating actions that require a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsrfAction {
    Login,
    Upload,
    DeleteAll,
}

impl CsrfAction {
    /// Stable name used in logs and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            CsrfAction::Login => "login",
            CsrfAction::Upload => "upload",
            CsrfAction::DeleteAll => "delete_all",
        }
    }
}

impl fmt::Display for CsrfAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct TokenRecord {
    value: String,
    issued_at: i64,
}

/// Token table carried by a session.
#[derive(Debug, Clone, Default)]
pub struct CsrfTokens {
    records: HashMap<CsrfAction, TokenRecord>,
}

impl CsrfTokens {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record exists for `action`, expired or not.
    pub fn contains(&self, action: CsrfAction) -> bool {
        self.records.contains_key(&action)
    }

    /// Drop every token.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Issues and validates tokens with a fixed lifetime.
#[derive(Debug, Clone, Copy)]
pub struct CsrfTokenManager {
    ttl_secs: i64,
}

impl Default for CsrfTokenManager {
    fn default() -> Self {
        Self::new(CSRF_TOKEN_TTL_SECS)
    }
}

impl CsrfTokenManager {
    /// Manager whose tokens expire after `ttl_secs`.
    pub fn new(ttl_secs: i64) -> Self {
        Self { ttl_secs }
    }

    /// Token lifetime in seconds.
    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Issue a fresh token for `action`, replacing any existing one.
    pub fn issue(&self, tokens: &mut CsrfTokens, action: CsrfAction, now: i64) -> String {
        let value = generate_token();
        tokens.records.insert(
            action,
            TokenRecord {
                value: value.clone(),
                issued_at: now,
            },
        );
        value
    }

    /// Current token for `action`, issuing one if absent or expired.
    ///
    /// Repeated calls within the lifetime return the same value, so
    /// rendering a page twice does not invalidate an open form.
    pub fn get(&self, tokens: &mut CsrfTokens, action: CsrfAction, now: i64) -> String {
        match tokens.records.get(&action) {
            Some(record) if !self.is_expired(record, now) => record.value.clone(),
            _ => self.issue(tokens, action, now),
        }
    }

    /// Check `supplied` against the stored token and consume it on success.
    ///
    /// Expired records are removed. A mismatch leaves the record in place.
    pub fn validate(
        &self,
        tokens: &mut CsrfTokens,
        action: CsrfAction,
        supplied: &str,
        now: i64,
    ) -> bool {
        let Some(record) = tokens.records.get(&action) else {
            return false;
        };

        if self.is_expired(record, now) {
            tokens.records.remove(&action);
            return false;
        }

        let matches: bool = record.value.as_bytes().ct_eq(supplied.as_bytes()).into();
        if matches {
            tokens.records.remove(&action);
        }
        matches
    }

    fn is_expired(&self, record: &TokenRecord, now: i64) -> bool {
        now - record.issued_at >= self.ttl_secs
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
