//! Error → HTTP mapping.
//!
//! Every failure leaves the façade as an OpenAI-style error envelope with
//! a stable `code`. Internal detail goes to the log, never to the client.

use askgate_core::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error, warn};

#[derive(Debug)]
pub struct ApiError {
    error: Error,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(error: Error) -> Self {
        Self {
            error,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    fn log(&self, status: StatusCode) {
        match status.as_u16() {
            500..=599 => error!(
                code = %self.error.code,
                request_id = ?self.request_id,
                details = ?self.error.details,
                "server error: {}",
                self.error.message
            ),
            422 => warn!(
                code = %self.error.code,
                request_id = ?self.request_id,
                "safety rejection: {}",
                self.error.message
            ),
            _ => debug!(
                code = %self.error.code,
                request_id = ?self.request_id,
                "client error: {}",
                self.error.message
            ),
        }
    }

    /// The OpenAI-style error body.
    pub fn body(&self) -> serde_json::Value {
        let status = self.error.http_status();
        let error_type = if status >= 500 {
            "server_error"
        } else {
            "invalid_request_error"
        };
        json!({
            "error": {
                "message": self.error.message,
                "type": error_type,
                "code": self.error.code.as_str(),
                "request_id": self.request_id,
            }
        })
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.log(status);
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askgate_core::ErrorCode;

    #[test]
    fn body_carries_stable_code() {
        let err = ApiError::new(Error::new(ErrorCode::TenantConflict, "mismatch"))
            .with_request_id("req-1");
        let body = err.body();
        assert_eq!(body["error"]["code"], "tenant_conflict");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["request_id"], "req-1");
    }

    #[test]
    fn transient_codes_read_as_server_errors() {
        let err = ApiError::new(Error::new(ErrorCode::ProviderUnavailable, "down"));
        assert_eq!(err.body()["error"]["type"], "server_error");
    }

    #[test]
    fn details_never_reach_the_body() {
        let err = ApiError::new(
            Error::new(ErrorCode::Internal, "internal error").with_details("stack secrets"),
        );
        assert!(!err.body().to_string().contains("stack secrets"));
    }
}
