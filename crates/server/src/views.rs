//! Plain HTML pages.
//!
//! Rendering only. Every value interpolated into markup goes through
//! [`escape_html`], and every value placed in a URL goes through
//! [`url_param`]. Pages carry no script so the CSP can forbid it entirely.

use std::time::SystemTime;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};

use crate::files::{count_entries, DirectoryEntry};

const STYLE: &str = "body{font-family:system-ui,sans-serif;margin:2rem auto;max-width:60rem;\
padding:0 1rem;color:#222}table{border-collapse:collapse;width:100%}\
th,td{text-align:left;padding:.4rem .6rem;border-bottom:1px solid #ddd}\
.notice{padding:.6rem 1rem;margin:1rem 0;border-radius:4px}\
.success{background:#e6f4ea}.error{background:#fce8e6}.warning{background:#fef7e0}\
nav ol{list-style:none;padding:0;display:flex;gap:.5rem}\
nav li+li:before{content:'/';padding-right:.5rem;color:#888}\
form.inline{display:inline}footer{margin-top:1rem;color:#666}";

/// Severity of a message shown above page content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Warning,
    Error,
}

impl NoticeKind {
    fn class(self) -> &'static str {
        match self {
            NoticeKind::Success => "success",
            NoticeKind::Warning => "warning",
            NoticeKind::Error => "error",
        }
    }
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

impl Notice {
    pub fn success(text: impl Into<String>) -> Self {
        Self { kind: NoticeKind::Success, text: text.into() }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self { kind: NoticeKind::Warning, text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { kind: NoticeKind::Error, text: text.into() }
    }
}

/// Escape text for HTML element content and quoted attributes.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Percent-encode a query parameter value.
pub fn url_param(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Human-readable size, rounded to at most two decimals.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{size:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

fn format_modified(modified: SystemTime) -> String {
    DateTime::<Utc>::from(modified)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
<meta name=\"robots\" content=\"noindex, nofollow\">\n<title>{}</title>\n\
<style>{}</style>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape_html(title),
        STYLE,
        body
    )
}

fn render_notices(notices: &[Notice]) -> String {
    notices
        .iter()
        .map(|n| {
            format!(
                "<div class=\"notice {}\" role=\"alert\">{}</div>\n",
                n.kind.class(),
                escape_html(&n.text)
            )
        })
        .collect()
}

/// First-run page asking for the administrator password.
pub fn setup_page(notices: &[Notice], min_password_length: usize) -> String {
    let body = format!(
        "<h1>Fileward setup</h1>\n{}\
<p>Choose the administrator password. It must be at least {} characters long.</p>\n\
<form method=\"post\" action=\"/\">\n\
<p><label>Password <input type=\"password\" name=\"setup_password\" required minlength=\"{min}\" autocomplete=\"new-password\"></label></p>\n\
<p><label>Confirm password <input type=\"password\" name=\"confirm_password\" required minlength=\"{min}\" autocomplete=\"new-password\"></label></p>\n\
<p><button type=\"submit\">Complete setup</button></p>\n</form>",
        render_notices(notices),
        min_password_length,
        min = min_password_length,
    );
    layout("Fileward setup", &body)
}

/// Login form carrying the login CSRF token.
pub fn login_page(csrf_token: &str, notices: &[Notice]) -> String {
    let body = format!(
        "<h1>Fileward</h1>\n{}\
<form method=\"post\" action=\"/\">\n\
<input type=\"hidden\" name=\"csrf_token\" value=\"{}\">\n\
<p><label>Password <input type=\"password\" name=\"password\" required autofocus autocomplete=\"current-password\"></label></p>\n\
<p><button type=\"submit\">Log in</button></p>\n</form>",
        render_notices(notices),
        escape_html(csrf_token),
    );
    layout("Log in", &body)
}

/// Error page body for `status`.
pub fn error_page(status: StatusCode, message: &str) -> String {
    let title = status.canonical_reason().unwrap_or("Error");
    let body = format!(
        "<h1>{} {}</h1>\n<p>{}</p>\n<p><a href=\"/\">Back to files</a></p>",
        status.as_u16(),
        escape_html(title),
        escape_html(message)
    );
    layout(title, &body)
}

/// Breadcrumb trail from the root to `relative`.
pub fn breadcrumbs(relative: &str) -> String {
    let mut out = String::from("<nav aria-label=\"breadcrumb\"><ol>\n<li><a href=\"/\">Home</a></li>\n");
    let mut so_far = String::new();
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        if !so_far.is_empty() {
            so_far.push('/');
        }
        so_far.push_str(part);
        out.push_str(&format!(
            "<li><a href=\"/?path={}\">{}</a></li>\n",
            url_param(&so_far),
            escape_html(part)
        ));
    }
    out.push_str("</ol></nav>\n");
    out
}

/// Everything the listing page shows.
pub struct ListingView<'a> {
    /// Current directory relative to the root.
    pub relative: &'a str,
    /// Parent directory, `None` at the root.
    pub parent: Option<&'a str>,
    pub entries: &'a [DirectoryEntry],
    pub notices: &'a [Notice],
    pub upload_token: &'a str,
    pub delete_token: &'a str,
    pub allowed_extensions: &'a [String],
    pub max_files: usize,
    pub max_file_bytes: u64,
}

/// Directory listing with upload, delete-all and logout controls.
pub fn listing_page(view: &ListingView<'_>) -> String {
    let mut rows = String::new();

    if let Some(parent) = view.parent {
        let href = if parent.is_empty() {
            "/".to_string()
        } else {
            format!("/?path={}", url_param(parent))
        };
        rows.push_str(&format!(
            "<tr><td><a href=\"{href}\">..</a></td><td>Directory</td><td>-</td><td></td></tr>\n"
        ));
    }

    if view.entries.is_empty() {
        rows.push_str("<tr><td colspan=\"4\">This folder is empty</td></tr>\n");
    }

    for entry in view.entries {
        let (link, kind, size) = if entry.is_dir {
            (
                format!("/?path={}", url_param(&entry.relative_path)),
                "Directory",
                "-".to_string(),
            )
        } else {
            (
                format!("/?download={}", url_param(&entry.relative_path)),
                "File",
                format_size(entry.size),
            )
        };
        rows.push_str(&format!(
            "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&link),
            escape_html(&entry.name),
            kind,
            size,
            format_modified(entry.modified),
        ));
    }

    let (folders, files) = count_entries(view.entries);
    let location = if view.relative.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", view.relative)
    };
    let accept: Vec<String> = view
        .allowed_extensions
        .iter()
        .map(|ext| format!(".{ext}"))
        .collect();

    let body = format!(
        "<h1>Directory listing of {location}</h1>\n\
<p><a href=\"/?logout=1\">Log out</a></p>\n{breadcrumbs}{notices}\
<table>\n<thead><tr><th>Name</th><th>Type</th><th>Size</th><th>Modified</th></tr></thead>\n\
<tbody>\n{rows}</tbody>\n</table>\n\
<footer>{folders} folder(s), {files} file(s)</footer>\n\
<h2>Upload files</h2>\n\
<form method=\"post\" action=\"/\" enctype=\"multipart/form-data\">\n\
<input type=\"hidden\" name=\"csrf_token\" value=\"{upload_token}\">\n\
<input type=\"hidden\" name=\"path\" value=\"{path}\">\n\
<p><input type=\"file\" name=\"upload_files[]\" multiple accept=\"{accept}\"></p>\n\
<p>Up to {max_files} files, {max_size} each.</p>\n\
<p><button type=\"submit\">Upload</button></p>\n</form>\n\
<h2>Delete files</h2>\n\
<form method=\"post\" action=\"/\" class=\"inline\">\n\
<input type=\"hidden\" name=\"csrf_token\" value=\"{delete_token}\">\n\
<input type=\"hidden\" name=\"path\" value=\"{path}\">\n\
<input type=\"hidden\" name=\"delete_all_files\" value=\"1\">\n\
<button type=\"submit\">Delete all files in this folder</button>\n</form>",
        location = escape_html(&location),
        breadcrumbs = breadcrumbs(view.relative),
        notices = render_notices(view.notices),
        rows = rows,
        folders = folders,
        files = files,
        upload_token = escape_html(view.upload_token),
        delete_token = escape_html(view.delete_token),
        path = escape_html(view.relative),
        accept = escape_html(&accept.join(",")),
        max_files = view.max_files,
        max_size = format_size(view.max_file_bytes),
    );
    layout("Fileward", &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, relative: &str, is_dir: bool, size: u64) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_string(),
            relative_path: relative.to_string(),
            is_dir,
            size,
            modified: SystemTime::UNIX_EPOCH,
        }
    }

    fn listing<'a>(entries: &'a [DirectoryEntry], notices: &'a [Notice]) -> ListingView<'a> {
        ListingView {
            relative: "docs",
            parent: Some(""),
            entries,
            notices,
            upload_token: "up-token",
            delete_token: "del-token",
            allowed_extensions: &[],
            max_files: 10,
            max_file_bytes: 10 * 1024 * 1024,
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<script>alert('x') & \"y\"</script>"),
            "&lt;script&gt;alert(&#39;x&#39;) &amp; &quot;y&quot;&lt;/script&gt;"
        );
        assert_eq!(escape_html("plain.txt"), "plain.txt");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1_234_567), "1.18 MB");
        assert_eq!(format_size(10 * 1024 * 1024), "10 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3 GB");
        assert_eq!(format_size(2048 * 1024 * 1024 * 1024 * 1024), "2048 TB");
    }

    #[test]
    fn test_url_param() {
        assert_eq!(url_param("a b/c&d"), "a+b%2Fc%26d");
    }

    #[test]
    fn test_breadcrumbs() {
        let html = breadcrumbs("reports/2024");
        assert!(html.contains("<a href=\"/\">Home</a>"));
        assert!(html.contains("<a href=\"/?path=reports\">reports</a>"));
        assert!(html.contains("<a href=\"/?path=reports%2F2024\">2024</a>"));

        assert_eq!(breadcrumbs("").matches("<li>").count(), 1);
    }

    #[test]
    fn test_listing_escapes_names() {
        let entries = vec![entry("<img src=x>.txt", "docs/<img src=x>.txt", false, 10)];
        let html = listing_page(&listing(&entries, &[]));

        assert!(!html.contains("<img src=x>"));
        assert!(html.contains("&lt;img src=x&gt;.txt"));
    }

    #[test]
    fn test_listing_links_and_footer() {
        let entries = vec![
            entry("sub", "docs/sub", true, 0),
            entry("a.txt", "docs/a.txt", false, 2048),
        ];
        let html = listing_page(&listing(&entries, &[]));

        assert!(html.contains("href=\"/?path=docs%2Fsub\""));
        assert!(html.contains("href=\"/?download=docs%2Fa.txt\""));
        assert!(html.contains("2 KB"));
        assert!(html.contains("1 folder(s), 1 file(s)"));
        assert!(html.contains("value=\"up-token\""));
        assert!(html.contains("value=\"del-token\""));
        assert!(html.contains("name=\"path\" value=\"docs\""));
    }

    #[test]
    fn test_listing_empty_folder() {
        let html = listing_page(&listing(&[], &[]));
        assert!(html.contains("This folder is empty"));
        assert!(html.contains("0 folder(s), 0 file(s)"));
    }

    #[test]
    fn test_notices_rendered() {
        let notices = vec![
            Notice::success("Uploaded a.txt"),
            Notice::error("<b>bad</b>"),
        ];
        let html = listing_page(&listing(&[], &notices));
        assert!(html.contains("notice success"));
        assert!(html.contains("&lt;b&gt;bad&lt;/b&gt;"));
    }

    #[test]
    fn test_login_page_carries_token() {
        let html = login_page("abc123", &[]);
        assert!(html.contains("name=\"csrf_token\" value=\"abc123\""));
        assert!(html.contains("name=\"password\""));
    }

    #[test]
    fn test_setup_page_fields() {
        let html = setup_page(&[], 8);
        assert!(html.contains("name=\"setup_password\""));
        assert!(html.contains("name=\"confirm_password\""));
        assert!(html.contains("at least 8 characters"));
    }

    #[test]
    fn test_error_page() {
        let html = error_page(StatusCode::NOT_FOUND, "File not found or access denied.");
        assert!(html.contains("404 Not Found"));
    }
}
