//! Error responses of the REST layer.

use crate::Error;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::any::Any;
use tracing::error;

/// JSON error body: `{"status": 400, "message": "...", "details": "..."}`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn with_details(mut self, details: impl ToString) -> Self {
        self.details = Some(details.to_string());
        self
    }

    /// Wrap a crate error under a short summary.
    pub fn context(message: impl Into<String>, err: Error) -> Self {
        let status = StatusCode::from_u16(err.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, message).with_details(err)
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = StatusCode::from_u16(err.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.to_string())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(d) => write!(f, "{}: {}", self.message, d),
            None => f.write_str(&self.message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::to_string_pretty(&self)
            .unwrap_or_else(|_| format!("{{\"status\":{},\"message\":\"internal error\"}}", self.status));
        (
            self.status_code(),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}

/// Panic message, for the catch-panic layer and the streaming drain.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}

/// Response for a panic caught outside of a stream.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic_message(panic.as_ref());
    error!(panic = %message, "request handler panicked");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        .with_details(message)
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_errors_keep_their_status() {
        let e = ApiError::from(Error::Conflict("busy".into()));
        assert_eq!(e.status, 409);
        let e = ApiError::context("failed to rename", Error::NotFound("x".into()));
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(e.message, "failed to rename");
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
