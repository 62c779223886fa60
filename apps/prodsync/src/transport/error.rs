use reqwest::StatusCode;
use thiserror::Error;

/// User-facing classification of a failed HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    ServerError,
    Other,
}

impl HttpErrorKind {
    pub fn classify(status: StatusCode) -> Self {
        match status.as_u16() {
            400 | 422 => HttpErrorKind::BadRequest,
            401 | 403 => HttpErrorKind::Unauthorized,
            404 => HttpErrorKind::NotFound,
            409 => HttpErrorKind::Conflict,
            500..=599 => HttpErrorKind::ServerError,
            _ => HttpErrorKind::Other,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            HttpErrorKind::BadRequest => "request rejected",
            HttpErrorKind::Unauthorized => "not authorized",
            HttpErrorKind::NotFound => "not found",
            HttpErrorKind::Conflict => "conflicting update",
            HttpErrorKind::ServerError => "server error",
            HttpErrorKind::Other => "unexpected response",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("{} ({status}): {message}", .kind.describe())]
    Http {
        status: u16,
        kind: HttpErrorKind,
        message: String,
    },
    #[error("session expired")]
    SessionExpired,
    #[error("could not parse response from {path}: {reason}")]
    Parse { path: String, reason: String },
}

impl ApiError {
    pub fn kind(&self) -> Option<HttpErrorKind> {
        match self {
            ApiError::Http { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        ApiError::Network(value.to_string())
    }
}
