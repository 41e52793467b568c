use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Classification attached to every handler failure. Drives the retry/DLQ
/// decision in the worker runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    StalePrecondition,
    ConfigMissing,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "Transient",
            ErrorKind::Permanent => "Permanent",
            ErrorKind::StalePrecondition => "StalePrecondition",
            ErrorKind::ConfigMissing => "ConfigMissing",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("stale precondition: {0}")]
    StalePrecondition(String),
    #[error("config snapshot unresolved: {0}")]
    ConfigMissing(String),
}

impl ProcessingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessingError::Transient(_) => ErrorKind::Transient,
            ProcessingError::Permanent(_) => ErrorKind::Permanent,
            ProcessingError::StalePrecondition(_) => ErrorKind::StalePrecondition,
            ProcessingError::ConfigMissing(_) => ErrorKind::ConfigMissing,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProcessingError::Transient(m)
            | ProcessingError::Permanent(m)
            | ProcessingError::StalePrecondition(m)
            | ProcessingError::ConfigMissing(m) => m.clone(),
        }
    }

    pub fn schema_rejected(detail: impl Into<String>) -> Self {
        ProcessingError::Permanent(format!("SchemaRejected: {}", detail.into()))
    }
}

impl From<sqlx::Error> for ProcessingError {
    fn from(err: sqlx::Error) -> Self {
        ProcessingError::Transient(format!("store error: {err}"))
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::Permanent(format!("malformed payload: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("envelope serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<BrokerError> for ProcessingError {
    fn from(err: BrokerError) -> Self {
        ProcessingError::Transient(err.to_string())
    }
}

/// HTTP-facing error for the thin ingest/read surface.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Db(_) | AppError::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
