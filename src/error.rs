use std::fmt::Display;

use axum::{http::StatusCode, response::IntoResponse, Json};

/// Boundary-facing error: what callers of the HTTP surface and the scheduler's public
/// operations see. Hand-rolled rather than `thiserror`-derived, matching how the rest of
/// this codebase's top-level error type is built.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppError {
    pub message: String,
    #[serde(skip)]
    pub kind: AppErrorKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppErrorKind {
    InternalError,
    NotFound,
    BadRequest,
}

impl std::error::Error for AppError {}

impl Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            AppErrorKind::InternalError => write!(f, "Internal Error: {}", self.message),
            AppErrorKind::NotFound => write!(f, "Not Found: {}", self.message),
            AppErrorKind::BadRequest => write!(f, "Bad Request: {}", self.message),
        }
    }
}

impl From<AppErrorKind> for StatusCode {
    fn from(val: AppErrorKind) -> Self {
        match val {
            AppErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            AppErrorKind::NotFound => StatusCode::NOT_FOUND,
            AppErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => AppError {
                message: "row not found".to_string(),
                kind: AppErrorKind::NotFound,
            },
            rest => AppError {
                message: rest.to_string(),
                kind: AppErrorKind::InternalError,
            },
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => AppError {
                message: value.to_string(),
                kind: AppErrorKind::NotFound,
            },
            _ => AppError {
                message: value.to_string(),
                kind: AppErrorKind::InternalError,
            },
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError {
            message: value.to_string(),
            kind: AppErrorKind::InternalError,
        }
    }
}

impl AppError {
    pub fn not_found(msg: impl AsRef<str>) -> Self {
        AppError {
            message: msg.as_ref().into(),
            kind: AppErrorKind::NotFound,
        }
    }

    pub fn bad_request(msg: impl AsRef<str>) -> Self {
        AppError {
            message: msg.as_ref().into(),
            kind: AppErrorKind::BadRequest,
        }
    }

    pub fn internal_error(msg: impl AsRef<str>) -> Self {
        AppError {
            message: msg.as_ref().into(),
            kind: AppErrorKind::InternalError,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status: StatusCode = self.kind.clone().into();
        (status, Json(self)).into_response()
    }
}

/// Errors from a single fetch attempt (component C). Retryability is the caller's (the
/// runner's) business, not encoded here, except for the HTTP-status class which the runner
/// needs to decide immediate-fail-on-404 vs retry.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    Timeout,
    #[error("connection reset")]
    ConnectionReset,
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::HttpStatus(status.as_u16())
        } else if err.is_connect() {
            FetchError::ConnectionReset
        } else {
            FetchError::Other(err.to_string())
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Other(err.to_string())
    }
}

/// Errors from manifest resolution (component B).
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("cancelled")]
    Cancelled,
    #[error("manifest has no variants or segments")]
    EmptyManifest,
    #[error("too many master->media redirects")]
    TooManyRedirects,
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid manifest url: {0}")]
    InvalidUrl(String),
}

/// Errors from the AES decryption primitive (§6).
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("ciphertext is not a multiple of the block size, or padding is invalid")]
    Padding,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The taxonomy a task's terminal `Task.error` string is drawn from (§7). The runner
/// converts any of the lower-level errors above into one of these before failing a task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    Timeout,
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("connection reset")]
    ConnectionReset,
    #[error("manifest is empty")]
    EmptyManifest,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("segment {index} failed after retries")]
    SegmentFailed { index: usize },
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("repository error: {0}")]
    RepositoryError(String),
    #[error("filesystem error: {0}")]
    FilesystemError(String),
}

impl From<FetchError> for TaskError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => TaskError::Cancelled,
            FetchError::Timeout => TaskError::Timeout,
            FetchError::ConnectionReset => TaskError::ConnectionReset,
            FetchError::HttpStatus(code) => TaskError::HttpStatus(code),
            FetchError::Other(msg) => TaskError::FilesystemError(msg),
        }
    }
}

impl From<ResolverError> for TaskError {
    fn from(err: ResolverError) -> Self {
        match err {
            ResolverError::Cancelled => TaskError::Cancelled,
            ResolverError::EmptyManifest => TaskError::EmptyManifest,
            ResolverError::TooManyRedirects => TaskError::TooManyRedirects,
            ResolverError::Fetch(f) => f.into(),
            ResolverError::InvalidUrl(msg) => TaskError::FilesystemError(msg),
        }
    }
}

impl From<DecryptError> for TaskError {
    fn from(err: DecryptError) -> Self {
        TaskError::DecryptionFailed(err.to_string())
    }
}
