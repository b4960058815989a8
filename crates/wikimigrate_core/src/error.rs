//! Typed errors for the destination API surface and configuration.
//!
//! Everything else in the crate uses `anyhow`; these two enums exist because
//! callers branch on them (rate limiting, fatal configuration).

use thiserror::Error;

/// Errors returned by [`crate::destination::DestinationApi`] implementations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP 429 from the destination.
    #[error("rate limited by destination{}", retry_hint(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    /// 502/503/504 or a transport timeout; worth exactly one retry.
    #[error("transient destination failure: {0}")]
    Transient(String),

    /// Any other non-success status.
    #[error("destination API error (HTTP {status}): {body}")]
    Http { status: u16, body: String },

    #[error("destination entity not found: {0}")]
    NotFound(String),

    #[error("destination transport error: {0}")]
    Transport(String),

    #[error("failed to decode destination response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            Self::Transient(error.to_string())
        } else if error.is_decode() {
            Self::Decode(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

fn retry_hint(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(seconds) => format!(" (retry after {seconds}s)"),
        None => String::new(),
    }
}

/// Fatal configuration problems, raised before any network call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {setting} (set {env} or {setting} in the config file)")]
    Missing {
        setting: &'static str,
        env: &'static str,
    },

    #[error("invalid value for {setting}: {detail}")]
    Invalid {
        setting: &'static str,
        detail: String,
    },
}
