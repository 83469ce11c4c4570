//! # Fileward Server Library
//!
//! HTTP front end for Fileward, a password-protected web file manager that
//! serves a single root directory.
//!
//! ## Overview
//!
//! The server is a thin axum application around the `guard` crate:
//!
//! - **Dispatch**: every request passes a setup/login/authenticated gate
//! - **Browsing**: directory listings confined to the root
//! - **Transfer**: streaming downloads, validated uploads, bulk delete
//! - **Hardening**: session cookies, CSRF tokens, security headers
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      axum Router                          │
//! │   TraceLayer → Timeout → security headers → body limit    │
//! ├───────────────────────────────────────────────────────────┤
//! │  RequestContext (session, source address, TLS flag)       │
//! │                          │                                │
//! │                  gate: setup / login / app                │
//! │                          │                                │
//! │  ┌────────────┐  ┌───────────────┐  ┌──────────────────┐  │
//! │  │  browser   │  │   transfer    │  │ UploadValidator  │  │
//! │  └────────────┘  └───────────────┘  └──────────────────┘  │
//! ├───────────────────────────────────────────────────────────┤
//! │  guard: PathResolver, CredentialStore, sessions, audit    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{build_router, AppState, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let listen = config.server.listen.clone();
//!     let app = build_router(AppState::from_config(config, None)?);
//!
//!     let listener = tokio::net::TcpListener::bind(&listen).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`state`]: Shared application state
//! - [`context`]: Per-request session binding and cookies
//! - [`router`]: Routing and the request gate
//! - [`files`]: Listing, download and bulk delete
//! - [`views`]: HTML rendering
//! - [`headers`]: Security response headers
//! - [`error`]: HTTP error mapping

pub mod config;
pub mod context;
pub mod error;
pub mod files;
pub mod headers;
pub mod router;
pub mod state;
pub mod views;

pub use config::{Config, ConfigError, LogFormat};
pub use context::{RequestContext, SESSION_COOKIE};
pub use error::AppError;
pub use router::build_router;
pub use state::AppState;
