//! Token middleware in front of every data route

use crate::response::ApiError;
use crate::ApiState;
use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use tracing::warn;

/// Header carrying the token when `Authorization` is not used
pub const TOKEN_HEADER: &str = "x-api-token";

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
    api_token: Option<String>,
}

/// Token supplied with the request, first match wins:
/// `Authorization: Bearer`, `X-API-Token`, `?token=`, `?api_token=`
pub fn extract_token(request: &Request) -> Option<String> {
    let headers = request.headers();

    if let Some(value) = headers.get(AUTHORIZATION) {
        let value = String::from_utf8_lossy(value.as_bytes());
        if let Some((scheme, token)) = value.split_once(' ') {
            if scheme.eq_ignore_ascii_case("bearer") {
                return Some(token.trim().to_string());
            }
        }
    }

    if let Some(value) = headers.get(TOKEN_HEADER) {
        return Some(String::from_utf8_lossy(value.as_bytes()).trim().to_string());
    }

    let query = Query::<TokenQuery>::try_from_uri(request.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();
    query.token.or(query.api_token)
}

/// Reject the request before any cache or query work unless the token passes
pub async fn require_token(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(&request);
    let decision = state.authorizer.authorize(token.as_deref());

    if let Some(error) = decision.into_error() {
        warn!(
            method = %request.method(),
            path = %request.uri().path(),
            ?decision,
            "Request rejected"
        );
        return Err(error.into());
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_header() {
        let req = request("/statistics", &[("Authorization", "Bearer abc")]);
        assert_eq!(extract_token(&req).as_deref(), Some("abc"));

        let req = request("/statistics", &[("authorization", "bearer abc")]);
        assert_eq!(extract_token(&req).as_deref(), Some("abc"));
    }

    #[test]
    fn test_precedence() {
        let req = request(
            "/statistics?token=query",
            &[("Authorization", "Bearer header"), ("X-API-Token", "custom")],
        );
        assert_eq!(extract_token(&req).as_deref(), Some("header"));

        let req = request("/statistics?token=query", &[("X-API-Token", "custom")]);
        assert_eq!(extract_token(&req).as_deref(), Some("custom"));

        let req = request("/statistics?api_token=second&token=first", &[]);
        assert_eq!(extract_token(&req).as_deref(), Some("first"));

        let req = request("/statistics?api_token=second", &[]);
        assert_eq!(extract_token(&req).as_deref(), Some("second"));
    }

    #[test]
    fn test_non_bearer_authorization_falls_through() {
        let req = request(
            "/statistics?token=query",
            &[("Authorization", "Basic dXNlcjpwYXNz")],
        );
        assert_eq!(extract_token(&req).as_deref(), Some("query"));
    }

    #[test]
    fn test_no_token() {
        assert_eq!(extract_token(&request("/statistics", &[])), None);
        assert_eq!(extract_token(&request("/books/search?title=dune", &[])), None);
    }
}
