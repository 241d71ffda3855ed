use reqwest::StatusCode;
use thiserror::Error;

use super::date_range::DateRangeError;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("Invalid date range: {0}")]
    InvalidDateRange(#[from] DateRangeError),
    #[error("Form '{form}' not found on {url}")]
    FormNotFound { form: String, url: String },
    #[error("Field '{field}' not found in form '{form}'")]
    FieldNotFound { form: String, field: String },
    #[error("Cookie for {domain} has no usable name: {name:?}")]
    MalformedCookie { domain: String, name: String },
    #[error("Portal request to {url} failed with status {status}: {message}")]
    HttpStatus {
        url: String,
        status: StatusCode,
        message: String,
    },
    #[error("Portal request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Portal returned a body that is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Redirect chain from {url} exceeded {limit} hops")]
    TooManyRedirects { url: String, limit: usize },
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type PortalResult<T> = std::result::Result<T, PortalError>;

/// Longest body excerpt carried in an [`PortalError::HttpStatus`].
const MESSAGE_EXCERPT_CHARS: usize = 300;

pub(crate) fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MESSAGE_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(MESSAGE_EXCERPT_CHARS).collect();
    cut.push('…');
    cut
}
