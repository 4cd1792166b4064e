//! HTTP Request Logger
//!
//! Logs every upload attempt to a file when enabled via environment variable.
//! Set `QINIU_HTTP_LOG=1` or `QINIU_HTTP_LOG=true` to enable, and optionally
//! `QINIU_HTTP_LOG_DIR` to choose where the `.qiniu-uploader` folder lives.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use reqwest::header::HeaderMap;
use tracing::warn;

/// Environment variable to control HTTP logging
const ENV_HTTP_LOG: &str = "QINIU_HTTP_LOG";

/// Environment variable overriding the log directory
const ENV_HTTP_LOG_DIR: &str = "QINIU_HTTP_LOG_DIR";

/// Log file name
const LOG_FILE_NAME: &str = "http_requests.log";

/// Maximum body size to log (10KB)
const MAX_BODY_SIZE: usize = 10000;

/// Sensitive headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "set-cookie",
    "cookie",
    "proxy-authorization",
];

/// Authorization schemes whose credential part gets masked
const AUTH_SCHEMES: &[&str] = &["UpToken ", "Bearer ", "Qiniu "];

/// Global mutex for thread-safe log writing
static LOG_MUTEX: Mutex<()> = Mutex::new(());

/// Check if HTTP logging is enabled
pub fn is_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var(ENV_HTTP_LOG)
            .map(|v| {
                let v = v.trim().to_lowercase();
                v == "1" || v == "true" || v == "yes" || v == "on"
            })
            .unwrap_or(false)
    })
}

/// Get log file path, creating the log folder on first use
fn get_log_file_path() -> PathBuf {
    let base = std::env::var(ENV_HTTP_LOG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let log_dir = base.join(".qiniu-uploader");
    if !log_dir.exists() {
        if let Err(e) = fs::create_dir_all(&log_dir) {
            warn!("Failed to create .qiniu-uploader directory: {}", e);
        }
    }
    log_dir.join(LOG_FILE_NAME)
}

/// Body as it should appear in the log
pub enum LoggedBody<'a> {
    Text(&'a str),
    Binary(usize),
    Form(Vec<String>),
}

/// HTTP request log entry
pub struct HttpRequestLog<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub attempt: usize,
    pub headers: Vec<(String, String)>,
    pub body: Option<LoggedBody<'a>>,
}

/// HTTP response log entry
pub struct HttpResponseLog<'a> {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: &'a [u8],
}

/// Log an HTTP attempt and its outcome
pub fn log_request(
    request: &HttpRequestLog<'_>,
    response: Option<&HttpResponseLog<'_>>,
    duration_ms: u64,
    error: Option<&str>,
) {
    if !is_enabled() {
        return;
    }

    let log_content = render_entry(request, response, duration_ms, error);
    let log_path = get_log_file_path();

    if let Err(e) = write_log(&log_path, &log_content) {
        warn!("Failed to write HTTP log: {}", e);
    }
}

fn render_entry(
    request: &HttpRequestLog<'_>,
    response: Option<&HttpResponseLog<'_>>,
    duration_ms: u64,
    error: Option<&str>,
) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let separator = "=".repeat(80);

    let mut log_content = String::new();
    log_content.push_str(&format!(
        "\n{}\n[{}] {} {} (attempt {})\n{}\n",
        separator, timestamp, request.method, request.url, request.attempt, separator
    ));

    log_content.push_str("\n--- Request Headers ---\n");
    for (name, value) in &request.headers {
        log_content.push_str(&format!("{}: {}\n", name, mask_sensitive_header(name, value)));
    }

    match &request.body {
        Some(LoggedBody::Text(body)) => {
            log_content.push_str("\n--- Request Body ---\n");
            log_content.push_str(&format_body(body));
            log_content.push('\n');
        }
        Some(LoggedBody::Binary(len)) => {
            log_content.push_str(&format!("\n--- Request Body ---\n<{} bytes binary>\n", len));
        }
        Some(LoggedBody::Form(fields)) => {
            log_content.push_str("\n--- Request Form ---\n");
            for field in fields {
                log_content.push_str(field);
                log_content.push('\n');
            }
        }
        None => {}
    }

    if let Some(resp) = response {
        log_content.push_str(&format!("\n--- Response ({}ms) ---\n", duration_ms));
        log_content.push_str(&format!("Status: {}\n", resp.status));

        log_content.push_str("\n--- Response Headers ---\n");
        for (name, value) in &resp.headers {
            log_content.push_str(&format!("{}: {}\n", name, mask_sensitive_header(name, value)));
        }

        if !resp.body.is_empty() {
            log_content.push_str("\n--- Response Body ---\n");
            match std::str::from_utf8(resp.body) {
                Ok(text) => log_content.push_str(&format_body(text)),
                Err(_) => log_content.push_str(&format!("<{} bytes binary>", resp.body.len())),
            }
            log_content.push('\n');
        }
    }

    if let Some(err) = error {
        log_content.push_str(&format!("\n--- Error ({}ms) ---\n", duration_ms));
        log_content.push_str(err);
        log_content.push('\n');
    }

    log_content.push_str(&format!("\n{}\n", separator));
    log_content
}

/// Write log content to file (thread-safe)
fn write_log(path: &Path, content: &str) -> std::io::Result<()> {
    // Concurrent sessions share one file
    let _guard = LOG_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Check if a header is sensitive and should be masked
pub fn is_sensitive_header(name: &str) -> bool {
    let name_lower = name.to_lowercase();
    SENSITIVE_HEADERS.iter().any(|h| name_lower == *h)
}

fn mask_sensitive_header(name: &str, value: &str) -> String {
    if is_sensitive_header(name) {
        mask_token(value)
    } else {
        value.to_string()
    }
}

/// Mask a credential, keeping the auth scheme and the first/last 4 chars
pub fn mask_token(value: &str) -> String {
    for scheme in AUTH_SCHEMES {
        if let Some(token) = value.strip_prefix(scheme) {
            return format!("{}{}", scheme, mask_credential(token));
        }
    }
    mask_credential(value)
}

fn mask_credential(token: &str) -> String {
    // Work on chars so multi-byte tokens never split mid-codepoint
    let chars: Vec<char> = token.chars().collect();
    if chars.len() > 8 {
        let prefix: String = chars[..4].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "****".to_string()
    }
}

/// Format body for logging with truncation (UTF-8 safe)
fn format_body(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let pretty = serde_json::to_string_pretty(&json).unwrap_or_else(|_| body.to_string());
        truncate_utf8_safe(&pretty, MAX_BODY_SIZE)
    } else {
        truncate_utf8_safe(body, MAX_BODY_SIZE)
    }
}

/// Truncate string at UTF-8 character boundary (safe for multi-byte chars)
pub fn truncate_utf8_safe(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...\n[truncated, total {} bytes]", &s[..end], s.len())
}

/// Flatten a header map for logging
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}
