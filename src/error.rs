//! Typed error hierarchy for the fan-out server.
//!
//! Every error carries enough information to compute a close code (for the
//! WebSocket transport) or an HTTP status (for `/health` and any plain HTTP
//! responses) per §7 of the design. Construction helpers mirror the ones a
//! reader would expect from a relay-style codebase: short, named after the
//! error kind, not the call site.

use thiserror::Error;

/// Errors surfaced anywhere in the fan-out server.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed command, violated precondition, missing required field.
    #[error("{0}")]
    ClientProtocol(String),

    /// Identity service reports the key unknown or revoked.
    #[error("unauthorized: {0}")]
    Authorization(String),

    /// Identity service failure or timeout.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Connection reset mid-stream, or any other transport-level fault.
    #[error("transport error: {0}")]
    Transport(String),

    /// Uncaught fault in the supervisor loop.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// An operation referenced a connection id that is not (or no longer)
    /// registered.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
}

impl Error {
    pub fn client_protocol(msg: impl Into<String>) -> Self {
        Error::ClientProtocol(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Error::Authorization(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::Upstream(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// The HTTP-like status this error maps to, per §7.
    pub fn http_like_status(&self) -> u16 {
        match self {
            Error::ClientProtocol(_) => 400,
            Error::Authorization(_) => 403,
            Error::Upstream(_) => 500,
            Error::Transport(_) => 500,
            Error::Fatal(_) => 500,
            Error::ConnectionNotFound(_) => 404,
        }
    }

    /// The WebSocket close code for this error: `4000 + <http-like status>`,
    /// with any status below 1000 first shifted into the reserved range.
    pub fn close_code(&self) -> u16 {
        let status = self.http_like_status();
        let shifted = if status < 1000 { status } else { status % 1000 };
        4000 + shifted
    }

    /// Truncate to the first line and to the transport's close-frame limit
    /// (123 bytes is the practical WebSocket close-reason ceiling).
    pub fn close_reason(&self, dev: bool) -> String {
        let raw = if dev || !matches!(self, Error::Upstream(_) | Error::Fatal(_)) {
            self.to_string()
        } else {
            "internal error".to_string()
        };
        let first_line = raw.lines().next().unwrap_or("").to_string();
        truncate_bytes(&first_line, 123)
    }
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Redact an API key for log output: keep a short prefix/suffix, mask the
/// middle. Never logs a key verbatim.
pub fn redact_key(key: &str) -> String {
    if key == "public" {
        return key.to_string();
    }
    let len = key.chars().count();
    if len <= 8 {
        return "*".repeat(len);
    }
    let prefix: String = key.chars().take(3).collect();
    let suffix: String = key.chars().skip(len - 3).collect();
    format!("{prefix}***{suffix}")
}
