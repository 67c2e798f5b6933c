use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Error kinds per the documented error-handling contract. Each variant
/// carries enough context for server-side logging; `user_message` is the
/// only thing that ever reaches a client.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("argument error: {0}")]
    Argument(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited")]
    RateLimited,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        AppError::Internal(err.to_string())
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Argument(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Crypto(_) => StatusCode::UNAUTHORIZED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The only text a client ever sees. Never distinguishes "unknown user"
    /// from "wrong password", never leaks internal detail.
    fn user_message(&self) -> String {
        match self {
            AppError::Argument(msg) => msg.clone(),
            AppError::Unauthorized(msg) => msg.clone(),
            AppError::Forbidden(msg) => msg.clone(),
            AppError::RateLimited => "Too many requests.".to_string(),
            AppError::Conflict(msg) => msg.clone(),
            AppError::Integrity(_) => "An error occurred. Please try again.".to_string(),
            AppError::Crypto(msg) => msg.clone(),
            AppError::Internal(_) => "An error occurred. Please try again.".to_string(),
        }
    }
}

#[derive(Serialize)]
struct JsonEnvelope {
    success: bool,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Integrity(detail) => {
                tracing::error!(target: "securevault::integrity", "{detail}");
            }
            AppError::Internal(detail) => {
                tracing::error!(target: "securevault::internal", "{detail}");
            }
            _ => {}
        }

        let body = JsonEnvelope {
            success: false,
            message: self.user_message(),
        };

        (self.status(), Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
