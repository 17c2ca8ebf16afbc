use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use photogate_core::AdmissionError;
use serde_json::json;
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Raw error detail; only serialized into the body in development.
    pub stack: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            stack: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    /// Maps a domain error onto an HTTP status. `dev` keeps the raw error
    /// text in the body; stacks are logged regardless.
    pub fn from_admission(err: AdmissionError, dev: bool) -> Self {
        let mapped = match err {
            AdmissionError::NotFound(msg) => Self::not_found(msg),
            AdmissionError::AlreadyProcessed => {
                Self::bad_request("Image has already been processed")
            }
            AdmissionError::InvalidRequest(msg) => Self::bad_request(msg),
            AdmissionError::Unavailable(msg) => Self::unavailable(msg),
            other => {
                tracing::error!("internal error: {other}");
                let mut mapped = Self::internal("Server Error");
                if dev {
                    mapped.stack = Some(other.to_string());
                }
                mapped
            }
        };
        mapped
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": true,
            "message": self.message,
        });
        if let Some(stack) = self.stack {
            body["stack"] = json!(stack);
        }
        (self.status, Json(body)).into_response()
    }
}
