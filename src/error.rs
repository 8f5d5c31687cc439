use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Identity source error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

// ---------------------------------------------------------------------------
// Network error taxonomy
// ---------------------------------------------------------------------------

/// What a single upstream call returned, classified at the HTTP boundary.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("rate limited (retry_after={retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authorization rejected (status {status})")]
    Auth { status: u16 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure (status {status}): {message}")]
    Permanent { status: u16, message: String },
}

impl SourceError {
    /// Map an HTTP status to the taxonomy. Returns None for success codes.
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: String) -> Option<Self> {
        match status {
            200..=299 => None,
            429 => Some(SourceError::RateLimited { retry_after }),
            401 | 403 | 407 => Some(SourceError::Auth { status }),
            408 | 500..=599 => Some(SourceError::Transient(format!("status {status}: {message}"))),
            _ => Some(SourceError::Permanent { status, message }),
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            SourceError::RateLimited { .. } => "rate_limit",
            SourceError::Auth { .. } => "auth",
            SourceError::Transient(_) => "transient",
            SourceError::Permanent { .. } => "permanent",
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if let Some(err) = SourceError::from_status(status.as_u16(), None, e.to_string()) {
                return err;
            }
        }
        SourceError::Transient(e.to_string())
    }
}

/// Terminal outcome of the bounded-retry fetch combinator.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("circuit open, {remaining:?} until probe")]
    CircuitOpen { remaining: Duration },

    #[error("no usable egress identity")]
    NoIdentity,

    #[error("still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("authorization failed on {attempts} identities")]
    Auth { attempts: u32 },

    #[error("transient failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    #[error("permanent failure (status {status}): {message}")]
    Permanent { status: u16, message: String },
}

impl FetchError {
    pub fn class(&self) -> &'static str {
        match self {
            FetchError::CircuitOpen { .. } => "systemic",
            FetchError::NoIdentity | FetchError::Auth { .. } => "auth",
            FetchError::RateLimited { .. } => "rate_limit",
            FetchError::Transient { .. } => "transient",
            FetchError::Permanent { .. } => "permanent",
        }
    }
}

/// Failure of the scoring collaborator on one payload.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload missing field `{0}`")]
    MissingField(&'static str),
}
