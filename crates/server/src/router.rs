//! HTTP routing and request dispatch.
//!
//! Everything is served from `/`. Before any handler logic runs, the
//! request passes through a gate that picks exactly one of four states:
//!
//! 1. the credential went missing after setup: fail closed with a 500,
//! 2. no credential yet: the setup form,
//! 3. the session is anonymous: the login form,
//! 4. authenticated: browsing, download, upload, delete-all and logout.

use std::time::Duration;

use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Router};
use guard::{
    unix_now, AuthSession, CredentialVerifier, CsrfAction, LoginOutcome, ResolvedPath, SetupError,
    SetupState, TransferErrorKind, UploadItem, UploadOutcome, UploadReport,
};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::context::{apply_cookie, CookieUpdate, RequestContext};
use crate::error::AppError;
use crate::files::{self, DirectoryBrowser, TransferError};
use crate::headers::security_headers;
use crate::state::AppState;
use crate::views::{self, ListingView, Notice};

/// Allowance for form fields and multipart framing on top of file content.
const BODY_OVERHEAD_BYTES: u64 = 1024 * 1024;

const CSRF_FAILED: &str = "Invalid or expired security token. Please try again.";

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    Router::new()
        .route("/", get(handle_get).post(handle_post))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(timeout))
                .layer(middleware::from_fn_with_state(state.clone(), security_headers))
                .layer(DefaultBodyLimit::max(body_limit(&state))),
        )
        .with_state(state)
}

/// Largest accepted request body.
///
/// Each file part is cut off at the staging limit while streaming, so the
/// body only needs room for a full batch plus one overflowing part.
fn body_limit(state: &AppState) -> usize {
    let upload = &state.config.upload;
    let parts = upload.max_files as u64 + 1;
    let limit = upload
        .staging_limit_bytes
        .saturating_mul(parts)
        .saturating_add(BODY_OVERHEAD_BYTES);
    usize::try_from(limit).unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    ConfigMissing,
    Setup,
    Login,
    Authenticated,
}

async fn gate(state: &AppState, ctx: &RequestContext) -> Gate {
    match state.credentials.state() {
        SetupState::ConfigMissing => {
            warn!("Credential missing after setup; refusing requests");
            ctx.auditor.event("config_missing", json!({}));
            Gate::ConfigMissing
        }
        SetupState::Unconfigured => Gate::Setup,
        SetupState::Configured => {
            if ctx.session.lock().await.logged_in {
                Gate::Authenticated
            } else {
                Gate::Login
            }
        }
    }
}

fn finish(result: Result<Response, AppError>, update: CookieUpdate, secure: bool) -> Response {
    let response = match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    apply_cookie(response, update, secure)
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    path: Option<String>,
    download: Option<String>,
    logout: Option<String>,
}

async fn handle_get(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<PageQuery>,
) -> Response {
    let mut update = ctx.initial_cookie();

    let result = match gate(&state, &ctx).await {
        Gate::ConfigMissing => Err(AppError::ConfigMissing),
        Gate::Setup => Ok(setup_response(&state, StatusCode::OK, &[])),
        Gate::Login if query.logout.is_some() => Ok(Redirect::to("/").into_response()),
        Gate::Login => Ok(login_response(&state, &ctx, StatusCode::OK, &[]).await),
        Gate::Authenticated => {
            if query.logout.is_some() {
                update = CookieUpdate::Remove;
                Ok(logout(&state, &ctx).await)
            } else if let Some(requested) = query.download {
                download(&state, &ctx, &requested).await
            } else {
                listing_response(&state, &ctx, query.path.as_deref(), StatusCode::OK, &[]).await
            }
        }
    };

    finish(result, update, ctx.secure)
}

#[derive(Debug, Default, Deserialize)]
struct PostForm {
    csrf_token: Option<String>,
    password: Option<String>,
    setup_password: Option<String>,
    confirm_password: Option<String>,
    delete_all_files: Option<String>,
    path: Option<String>,
}

async fn handle_post(State(state): State<AppState>, ctx: RequestContext, request: Request) -> Response {
    let mut update = ctx.initial_cookie();
    let multipart = is_multipart(&request);

    let result = match gate(&state, &ctx).await {
        Gate::ConfigMissing => Err(AppError::ConfigMissing),
        Gate::Setup if multipart => Ok(setup_response(&state, StatusCode::OK, &[])),
        Gate::Setup => match parse_form(request, &state).await {
            Ok(form) => handle_setup(&state, &ctx, form).await,
            Err(e) => Err(e),
        },
        Gate::Login if multipart => Ok(login_response(&state, &ctx, StatusCode::OK, &[]).await),
        Gate::Login => match parse_form(request, &state).await {
            Ok(form) => handle_login(&state, &ctx, form, &mut update).await,
            Err(e) => Err(e),
        },
        Gate::Authenticated if multipart => handle_upload(&state, &ctx, request).await,
        Gate::Authenticated => match parse_form(request, &state).await {
            Ok(form) if form.delete_all_files.as_deref() == Some("1") => {
                handle_delete_all(&state, &ctx, form).await
            }
            Ok(form) => {
                listing_response(&state, &ctx, form.path.as_deref(), StatusCode::OK, &[]).await
            }
            Err(e) => Err(e),
        },
    };

    finish(result, update, ctx.secure)
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

async fn parse_form(request: Request, state: &AppState) -> Result<PostForm, AppError> {
    Form::<PostForm>::from_request(request, state)
        .await
        .map(|Form(form)| form)
        .map_err(|e| AppError::BadRequest(e.body_text()))
}

// Setup

fn setup_response(state: &AppState, status: StatusCode, notices: &[Notice]) -> Response {
    let body = views::setup_page(notices, state.config.security.min_password_length);
    (status, Html(body)).into_response()
}

async fn handle_setup(
    state: &AppState,
    ctx: &RequestContext,
    form: PostForm,
) -> Result<Response, AppError> {
    let (Some(password), Some(confirmation)) = (form.setup_password, form.confirm_password) else {
        return Ok(setup_response(state, StatusCode::OK, &[]));
    };

    let store = state.credentials.clone();
    let created = tokio::task::spawn_blocking(move || store.create(&password, &confirmation)).await?;

    match created {
        Ok(()) => {
            info!("Setup completed");
            ctx.auditor.event("setup_completed", json!({}));
            let notices = [Notice::success("Setup complete. Please log in.")];
            Ok(login_response(state, ctx, StatusCode::OK, &notices).await)
        }
        Err(e @ (SetupError::TooShort { .. } | SetupError::Mismatch)) => {
            debug!(error = %e, "Setup rejected");
            ctx.auditor.event("setup_rejected", json!({ "reason": e.to_string() }));
            let notices = [Notice::error(capitalize(&e.to_string()))];
            Ok(setup_response(state, StatusCode::OK, &notices))
        }
        Err(SetupError::AlreadyConfigured) => {
            ctx.auditor.event("setup_rejected", json!({ "reason": "already configured" }));
            Ok(login_response(state, ctx, StatusCode::OK, &[]).await)
        }
        Err(SetupError::ConfigMissing) => Err(AppError::ConfigMissing),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}

// Login

async fn login_response(
    state: &AppState,
    ctx: &RequestContext,
    status: StatusCode,
    notices: &[Notice],
) -> Response {
    let mut session = ctx.session.lock().await;
    render_login(state, &mut session, status, notices)
}

fn render_login(
    state: &AppState,
    session: &mut AuthSession,
    status: StatusCode,
    notices: &[Notice],
) -> Response {
    let token = state.csrf.get(&mut session.csrf, CsrfAction::Login, unix_now());
    (status, Html(views::login_page(&token, notices))).into_response()
}

async fn handle_login(
    state: &AppState,
    ctx: &RequestContext,
    form: PostForm,
    update: &mut CookieUpdate,
) -> Result<Response, AppError> {
    let Some(password) = form.password else {
        return Ok(login_response(state, ctx, StatusCode::OK, &[]).await);
    };
    let supplied = form.csrf_token.unwrap_or_default();

    // Held until the attempt is recorded so concurrent submissions from one
    // session are counted one at a time.
    let mut session = ctx.session.lock().await;
    let now = unix_now();

    if !state.csrf.validate(&mut session.csrf, CsrfAction::Login, &supplied, now) {
        warn!("Login CSRF validation failed");
        ctx.auditor.event("csrf_validation_failed", json!({ "action": "login" }));
        let notices = [Notice::error(CSRF_FAILED)];
        return Ok(render_login(state, &mut session, StatusCode::FORBIDDEN, &notices));
    }

    let outcome = match state.authenticator.check_lockout(&session, now, &ctx.auditor) {
        Some(outcome) => outcome,
        None => {
            let store = state.credentials.clone();
            let verified = tokio::task::spawn_blocking(move || store.verify(&password)).await?;
            state
                .authenticator
                .record_attempt(&mut session, verified, unix_now(), &ctx.auditor)
        }
    };

    let max_attempts = state.authenticator.policy().max_attempts;
    let notice = match outcome {
        LoginOutcome::Authenticated => {
            session.csrf.clear();
            drop(session);
            return match state.sessions.regenerate(&ctx.session_id) {
                Some(new_id) => {
                    *update = CookieUpdate::Set(new_id);
                    Ok(Redirect::to("/").into_response())
                }
                None => Err(AppError::Internal("session vanished during login".into())),
            };
        }
        LoginOutcome::Rejected { attempts } => {
            let remaining = max_attempts.saturating_sub(attempts);
            Notice::error(format!(
                "Invalid password. {remaining} attempt(s) remaining."
            ))
        }
        LoginOutcome::LockoutEngaged { retry_minutes, .. }
        | LoginOutcome::LockedOut { retry_minutes } => Notice::error(format!(
            "Too many failed attempts. Try again in {retry_minutes} minute(s)."
        )),
        LoginOutcome::Misconfigured(_) => return Err(AppError::ConfigMissing),
    };

    Ok(render_login(state, &mut session, StatusCode::OK, &[notice]))
}

// Logout

async fn logout(state: &AppState, ctx: &RequestContext) -> Response {
    {
        let mut session = ctx.session.lock().await;
        state.authenticator.logout(&mut session, &ctx.auditor);
    }
    state.sessions.destroy(&ctx.session_id);
    Redirect::to("/").into_response()
}

// Browsing

/// Resolve a listing target, falling back to the root for anything that is
/// not a reachable directory.
fn listing_dir(state: &AppState, ctx: &RequestContext, requested: Option<&str>) -> ResolvedPath {
    let Some(requested) = requested.filter(|r| !r.is_empty()) else {
        return state.resolver.root_path();
    };
    match state.resolver.resolve_audited(requested, &ctx.auditor) {
        Ok(dir) if dir.is_dir() => dir,
        Ok(_) => {
            debug!("Listing target is not a directory; showing root");
            state.resolver.root_path()
        }
        Err(_) => state.resolver.root_path(),
    }
}

async fn listing_response(
    state: &AppState,
    ctx: &RequestContext,
    requested: Option<&str>,
    status: StatusCode,
    notices: &[Notice],
) -> Result<Response, AppError> {
    let dir = listing_dir(state, ctx, requested);
    render_listing(state, ctx, dir, status, notices).await
}

async fn render_listing(
    state: &AppState,
    ctx: &RequestContext,
    dir: ResolvedPath,
    status: StatusCode,
    notices: &[Notice],
) -> Result<Response, AppError> {
    let browser = DirectoryBrowser::new(state.resolver.clone());
    let listed = dir.clone();
    let entries = tokio::task::spawn_blocking(move || browser.list(&listed))
        .await?
        .map_err(|e| AppError::Internal(format!("failed to list directory: {e}")))?;

    let (upload_token, delete_token) = {
        let mut session = ctx.session.lock().await;
        let now = unix_now();
        (
            state.csrf.get(&mut session.csrf, CsrfAction::Upload, now),
            state.csrf.get(&mut session.csrf, CsrfAction::DeleteAll, now),
        )
    };

    let parent = dir.parent_relative();
    let upload = &state.config.upload;
    let view = ListingView {
        relative: dir.relative(),
        parent: parent.as_deref(),
        entries: &entries,
        notices,
        upload_token: &upload_token,
        delete_token: &delete_token,
        allowed_extensions: &upload.allowed_extensions,
        max_files: upload.max_files,
        max_file_bytes: upload.max_file_bytes,
    };
    Ok((status, Html(views::listing_page(&view))).into_response())
}

// Download

async fn download(
    state: &AppState,
    ctx: &RequestContext,
    requested: &str,
) -> Result<Response, AppError> {
    if requested.is_empty() {
        return Err(AppError::MissingParameter("download"));
    }

    let resolved = state
        .resolver
        .resolve_audited(requested, &ctx.auditor)
        .map_err(|_| AppError::NotFound)?;

    let download = files::open_download(&resolved).await.map_err(|e| match e {
        TransferError::NotFound | TransferError::NotAFile => AppError::NotFound,
        TransferError::Unreadable => {
            ctx.auditor.event("download_unreadable", json!({ "path": resolved.relative() }));
            AppError::Unreadable
        }
        TransferError::Io(e) => AppError::Internal(e.to_string()),
    })?;

    info!(path = %resolved.relative(), size = download.size, "Serving download");
    ctx.auditor.event(
        "file_downloaded",
        json!({ "path": resolved.relative(), "size": download.size }),
    );
    Ok(download.into_response())
}

// Delete all

async fn handle_delete_all(
    state: &AppState,
    ctx: &RequestContext,
    form: PostForm,
) -> Result<Response, AppError> {
    let dir = listing_dir(state, ctx, form.path.as_deref());
    let supplied = form.csrf_token.unwrap_or_default();

    let valid = {
        let mut session = ctx.session.lock().await;
        state.csrf.validate(&mut session.csrf, CsrfAction::DeleteAll, &supplied, unix_now())
    };
    if !valid {
        warn!("Delete-all CSRF validation failed");
        ctx.auditor.event("csrf_validation_failed", json!({ "action": "delete_all" }));
        let notices = [Notice::error(CSRF_FAILED)];
        return render_listing(state, ctx, dir, StatusCode::FORBIDDEN, &notices).await;
    }

    let resolver = state.resolver.clone();
    let target = dir.clone();
    let report = tokio::task::spawn_blocking(move || files::delete_all(&target, &resolver))
        .await?
        .map_err(|e| AppError::Internal(format!("failed to read directory: {e}")))?;

    info!(directory = %dir.relative(), deleted = report.deleted, failed = report.failed, "Deleted files");
    ctx.auditor.event(
        "delete_all",
        json!({
            "directory": dir.relative(),
            "deleted": report.deleted,
            "failed": report.failed,
        }),
    );

    let mut notices = vec![Notice::success(format!("Deleted {} file(s).", report.deleted))];
    if report.failed > 0 {
        notices.push(Notice::warning(format!(
            "{} file(s) could not be deleted.",
            report.failed
        )));
    }
    render_listing(state, ctx, dir, StatusCode::OK, &notices).await
}

// Upload

async fn handle_upload(
    state: &AppState,
    ctx: &RequestContext,
    request: Request,
) -> Result<Response, AppError> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?;

    let mut items = Vec::new();
    let mut supplied = String::new();
    let mut target = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                // Keep what arrived; the cut-off part already carries its error.
                warn!(error = %e, "Multipart stream ended early");
                break;
            }
        };

        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("csrf_token") => supplied = field.text().await.unwrap_or_default(),
            Some("path") => target = field.text().await.unwrap_or_default(),
            Some("upload_files[]") | Some("upload_files") => {
                items.push(stage_field(state, field).await);
            }
            _ => {}
        }
    }

    let valid = {
        let mut session = ctx.session.lock().await;
        state.csrf.validate(&mut session.csrf, CsrfAction::Upload, &supplied, unix_now())
    };

    let dir = listing_dir(state, ctx, Some(&target));

    if !valid {
        for item in &items {
            state.uploads.staging().release(&item.temp_source);
        }
        warn!(files = items.len(), "Upload CSRF validation failed");
        ctx.auditor.event("csrf_validation_failed", json!({ "action": "upload" }));
        let notices = [Notice::error(CSRF_FAILED)];
        return render_listing(state, ctx, dir, StatusCode::FORBIDDEN, &notices).await;
    }

    let uploads = state.uploads.clone();
    let auditor = ctx.auditor.clone();
    let upload_dir = dir.clone();
    let report =
        tokio::task::spawn_blocking(move || uploads.process(items, &upload_dir, &auditor)).await?;

    let notices = upload_notices(&report);
    render_listing(state, ctx, dir, StatusCode::OK, &notices).await
}

/// Stream one file part into the staging area.
///
/// Transport failures are recorded on the item rather than aborting the
/// batch, so the validator reports them per file.
async fn stage_field(state: &AppState, mut field: Field<'_>) -> UploadItem {
    let original_name = field.file_name().unwrap_or_default().to_string();
    let limit = state.config.upload.staging_limit_bytes;

    let staged = match state.uploads.staging().stage() {
        Ok(staged) => staged,
        Err(e) => {
            warn!(error = %e, "No staging file available");
            return UploadItem {
                original_name,
                size_bytes: 0,
                declared_error: Some(TransferErrorKind::NoTempDir),
                temp_source: Default::default(),
            };
        }
    };

    let mut file = tokio::fs::File::from_std(staged.file);
    let mut size_bytes = 0u64;
    let mut declared_error = None;

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                size_bytes += chunk.len() as u64;
                if size_bytes > limit {
                    declared_error = Some(TransferErrorKind::TooLarge);
                    break;
                }
                if let Err(e) = file.write_all(&chunk).await {
                    warn!(error = %e, "Failed to write staged upload");
                    declared_error = Some(TransferErrorKind::WriteFailed);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Upload part cut off");
                declared_error = Some(TransferErrorKind::Partial);
                break;
            }
        }
    }

    if declared_error.is_none() {
        if let Err(e) = file.flush().await {
            warn!(error = %e, "Failed to flush staged upload");
            declared_error = Some(TransferErrorKind::WriteFailed);
        }
    }

    UploadItem {
        original_name,
        size_bytes,
        declared_error,
        temp_source: staged.path,
    }
}

fn upload_notices(report: &UploadReport) -> Vec<Notice> {
    let mut notices = Vec::new();

    if let Some(truncated) = report.truncated {
        notices.push(Notice::warning(format!(
            "{} files were submitted; only the first {} were processed.",
            truncated.declared, truncated.processed
        )));
    }

    for outcome in &report.outcomes {
        notices.push(match outcome {
            UploadOutcome::Accepted { name, .. } => {
                Notice::success(format!("Uploaded {}.", name.as_str()))
            }
            UploadOutcome::Rejected { original_name, reason } => {
                Notice::error(format!("{}: {}.", original_name, reason))
            }
        });
    }

    if notices.is_empty() {
        notices.push(Notice::warning("No files were selected."));
    }
    notices
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
