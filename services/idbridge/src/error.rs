//! HTTP rendering of engine errors
//!
//! Errors become an RFC 6749 section 5.2 JSON body:
//! `{"error": "...", "error_description": "..."}`.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

#[derive(Debug)]
pub struct ApiError(pub oidc::Error);

impl From<oidc::Error> for ApiError {
    fn from(err: oidc::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %err, code = err.error_code(), "request failed");
        } else {
            debug!(error = %err, code = err.error_code(), "request rejected");
        }

        let body = serde_json::json!({
            "error": err.error_code(),
            "error_description": err.description(),
        });
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"idbridge\""),
            );
        }
        response
    }
}
