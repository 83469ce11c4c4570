//! File manager operations below the HTTP layer.
//!
//! This module provides:
//! - Directory listing that hides reserved entries and escaping symlinks
//! - Streaming downloads with safe headers
//! - Non-recursive bulk deletion of the current directory's files
//!
//! # Security
//!
//! Every path reaching this module is a [`guard::ResolvedPath`], so it has
//! already been proven to lie inside the root and outside reserved storage.

pub mod browser;
pub mod transfer;

pub use browser::{count_entries, BrowserError, DirectoryBrowser, DirectoryEntry};
pub use transfer::{
    delete_all, download_filename, open_download, DeleteReport, Download, TransferError,
};
