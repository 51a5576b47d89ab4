use std::fmt;

use api::response::ErrorBody;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;

#[derive(Debug)]
pub enum AppError {
    /// The live stream belongs to another operator
    Busy { current_operator: String },
    NotLive,
    NotRecording,
    AlreadyRecording(String),
    /// The handle no longer owns the live stream or upload
    SessionClosed,
    StorageFailure(String),
    DecodeFailure { key: String, reason: String },
    ChunkGap { expected: u32, got: u32 },
    InvalidTransition(String),
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Throw(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn storage<T: fmt::Display>(t: T) -> Self {
        AppError::StorageFailure(format!("{:#}", t))
    }

    pub fn decode<K: ToString, R: fmt::Display>(key: K, reason: R) -> Self {
        AppError::DecodeFailure {
            key: key.to_string(),
            reason: format!("{:#}", reason),
        }
    }

    pub fn not_found<T: ToString>(t: T) -> Self {
        AppError::NotFound(t.to_string())
    }

    pub fn bad_request<T: ToString>(t: T) -> Self {
        AppError::BadRequest(t.to_string())
    }

    pub fn throw<T: ToString>(t: T) -> Self {
        AppError::Throw(t.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Busy { .. } => "busy",
            AppError::NotLive => "not_live",
            AppError::NotRecording => "not_recording",
            AppError::AlreadyRecording(_) => "already_recording",
            AppError::SessionClosed => "session_closed",
            AppError::StorageFailure(_) => "storage_failure",
            AppError::DecodeFailure { .. } => "decode_failure",
            AppError::ChunkGap { .. } => "chunk_gap",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Forbidden(_) => "forbidden",
            AppError::Throw(_) | AppError::InternalServerError(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Busy { .. }
            | AppError::NotLive
            | AppError::NotRecording
            | AppError::AlreadyRecording(_)
            | AppError::ChunkGap { .. }
            | AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            AppError::SessionClosed => StatusCode::GONE,
            AppError::StorageFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::DecodeFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Throw(_) | AppError::InternalServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Busy { current_operator } => {
                write!(f, "stream is live by {}", current_operator)
            }
            AppError::NotLive => write!(f, "no live stream"),
            AppError::NotRecording => write!(f, "no active recording"),
            AppError::AlreadyRecording(version) => {
                write!(f, "recording {} already active", version)
            }
            AppError::SessionClosed => write!(f, "session closed"),
            AppError::StorageFailure(err) => write!(f, "storage failure: {}", err),
            AppError::DecodeFailure { key, reason } => {
                write!(f, "cannot decode {}: {}", key, reason)
            }
            AppError::ChunkGap { expected, got } => {
                write!(f, "chunk {} out of order, expected {}", got, expected)
            }
            AppError::InvalidTransition(err)
            | AppError::NotFound(err)
            | AppError::BadRequest(err)
            | AppError::Forbidden(err)
            | AppError::Throw(err) => f.write_str(err),
            AppError::InternalServerError(err) => write!(f, "{:#}", err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        let mut body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
            ..Default::default()
        };
        match self {
            AppError::Busy { current_operator } => body.current_operator = Some(current_operator),
            AppError::ChunkGap { expected, .. } => body.expected = Some(expected),
            AppError::DecodeFailure { key, .. } => body.key = Some(key),
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError::InternalServerError(err.into())
    }
}
