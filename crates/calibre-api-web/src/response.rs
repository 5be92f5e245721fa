//! JSON envelope shared by every route
//!
//! Success: `{"status": "success", "data": ...}`
//! Failure: `{"status": "error", "message": "..."}`

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use calibre_api_core::QueryError;
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::{error, warn};

#[derive(Serialize)]
struct Success<T: Serialize> {
    status: &'static str,
    data: T,
}

/// Wrap any serializable value in the success envelope
pub fn success<T: Serialize>(data: T) -> Response {
    Json(Success {
        status: "success",
        data,
    })
    .into_response()
}

/// Wrap a cached JSON payload without decoding it first
pub fn success_raw(payload: &str) -> Result<Response, ApiError> {
    let data: &RawValue = serde_json::from_str(payload)
        .map_err(|e| ApiError::from(QueryError::internal(format!("corrupt cached payload: {}", e))))?;
    Ok(success(data))
}

/// Error half of the envelope
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

/// HTTP status for a service error
pub fn status_for(error: &QueryError) -> StatusCode {
    match error {
        QueryError::Unauthorized => StatusCode::UNAUTHORIZED,
        QueryError::Forbidden => StatusCode::FORBIDDEN,
        QueryError::InvalidFilter { .. } => StatusCode::BAD_REQUEST,
        QueryError::NotFound { .. } => StatusCode::NOT_FOUND,
        QueryError::SourceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        QueryError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<QueryError> for ApiError {
    fn from(error: QueryError) -> Self {
        let status = status_for(&error);
        match &error {
            QueryError::Internal { .. } => error!(error = %error, "Request failed"),
            QueryError::SourceUnavailable { .. } => warn!(error = %error, "Request failed"),
            _ => {}
        }
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "message": self.message,
        });
        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&QueryError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&QueryError::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&QueryError::invalid_filter("limit", "not a number")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&QueryError::NotFound { id: 7 }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&QueryError::SourceUnavailable {
                message: "gone".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&QueryError::internal("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unauthorized_carries_challenge() {
        let response = ApiError::from(QueryError::Unauthorized).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn test_corrupt_payload_is_internal() {
        let err = success_raw("{not json").unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
