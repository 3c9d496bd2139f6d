//! Request ID middleware.
//!
//! Extracts a request id from `x-request-id` (or generates a UUID),
//! stores it in request extensions for handlers and error payloads, and
//! echoes it back on the response so clients can correlate.

use axum::{
    extract::Request,
    http::{header::HeaderValue, HeaderName},
    middleware::Next,
    response::Response,
};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id carried through request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = extract_or_generate(&request);

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    debug!(request_id = %request_id, status = %response.status(), "request completed");
    response
}

fn extract_or_generate(request: &Request) -> String {
    if let Some(value) = request.headers().get(REQUEST_ID_HEADER) {
        if let Ok(id) = value.to_str() {
            if is_valid(id) {
                return id.to_string();
            }
        }
    }
    Uuid::new_v4().to_string()
}

fn is_valid(id: &str) -> bool {
    if Uuid::from_str(id).is_ok() {
        return true;
    }
    (8..=128).contains(&id.len())
        && id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn generates_and_echoes_an_id() {
        let app = Router::new()
            .route("/", get(|| async { "OK" }))
            .layer(axum::middleware::from_fn(request_id_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(is_valid(id.to_str().unwrap()));
    }

    #[tokio::test]
    async fn preserves_a_caller_supplied_id() {
        let app = Router::new()
            .route("/", get(|| async { "OK" }))
            .layer(axum::middleware::from_fn(request_id_middleware));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "client-id-12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            "client-id-12345"
        );
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!is_valid("abc"));
        assert!(!is_valid("bad@id!!"));
        assert!(is_valid("550e8400-e29b-41d4-a716-446655440000"));
    }
}
