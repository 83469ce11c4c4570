//! Per-request security context.
//!
//! [`RequestContext`] is extracted before any handler runs. It binds the
//! request to a session (creating one when the cookie is absent, unknown or
//! expired), records the client address for the audit trail and carries
//! whether cookies must be marked `Secure`.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use guard::{unix_now, Auditor, SessionHandle, SessionId};

use crate::state::AppState;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "fileward_session";

/// Session and client information for one request.
pub struct RequestContext {
    /// Identifier the session is stored under.
    pub session_id: SessionId,
    /// Locked for the duration of any state change.
    pub session: SessionHandle,
    /// Whether the session was created by this request.
    pub is_new: bool,
    /// Client address.
    pub source: String,
    /// Whether cookies carry the `Secure` flag.
    pub secure: bool,
    /// Audit handle stamped with `source`.
    pub auditor: Auditor,
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let presented = jar
            .get(SESSION_COOKIE)
            .and_then(|cookie| SessionId::parse(cookie.value()));

        let (session_id, session, is_new) =
            state.sessions.get_or_create(presented.as_ref(), unix_now());

        let source = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            session_id,
            session,
            is_new,
            auditor: state.auditor(&source),
            source,
            secure: state.config.server.behind_tls,
        })
    }
}

impl RequestContext {
    /// Cookie change implied by the extraction alone.
    pub fn initial_cookie(&self) -> CookieUpdate {
        if self.is_new {
            CookieUpdate::Set(self.session_id.clone())
        } else {
            CookieUpdate::Keep
        }
    }
}

/// What to do with the session cookie on the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieUpdate {
    /// Leave the client's cookie alone.
    Keep,
    /// Point the cookie at this session.
    Set(SessionId),
    /// Expire the cookie.
    Remove,
}

/// Session cookie for `id`.
pub fn session_cookie(id: &SessionId, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, id.as_str().to_string());
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(secure);
    cookie.set_path("/");
    cookie
}

/// Expired session cookie.
pub fn removal_cookie(secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, "");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(secure);
    cookie.set_path("/");
    cookie.make_removal();
    cookie
}

/// Attach the cookie change to a response.
pub fn apply_cookie(response: Response, update: CookieUpdate, secure: bool) -> Response {
    match update {
        CookieUpdate::Keep => response,
        CookieUpdate::Set(id) => {
            (CookieJar::new().add(session_cookie(&id, secure)), response).into_response()
        }
        CookieUpdate::Remove => {
            (CookieJar::new().add(removal_cookie(secure)), response).into_response()
        }
    }
}
