//! Web router using Axum

use crate::auth;
use crate::response::{success, success_raw, ApiError};
use crate::ApiState;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{delete, get};
use axum::{middleware, Json, Router};
use calibre_api_core::models::SearchParams;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Calibre routes with their state already applied
///
/// The result merges into a host router of any state type. Everything except
/// `/health` sits behind the token middleware.
pub fn routes<S>(state: ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let gated = Router::new()
        .route("/statistics", get(statistics_handler))
        .route("/books/search", get(search_handler))
        .route("/books/{id}", get(book_handler))
        .route("/cache", delete(clear_cache_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(gated)
        .with_state(state)
}

/// Standalone router: the routes plus permissive CORS and request tracing
pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn statistics_handler(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let entry = state.service.statistics().await?;
    success_raw(&entry.payload)
}

async fn search_handler(
    State(state): State<ApiState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let entry = state.service.search(&params).await?;
    success_raw(&entry.payload)
}

async fn book_handler(
    State(state): State<ApiState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = id.map_err(|_| ApiError::bad_request("Book id must be an integer"))?;
    let entry = state.service.book(id).await?;
    success_raw(&entry.payload)
}

#[derive(Debug, Default, Deserialize)]
struct ClearCacheParams {
    pattern: Option<String>,
}

async fn clear_cache_handler(
    State(state): State<ApiState>,
    params: Result<Query<ClearCacheParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let invalidated = state.service.invalidate(params.pattern.as_deref()).await?;
    Ok(success(serde_json::json!({ "invalidated": invalidated })))
}

async fn health_handler(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let cache = state.service.status().await;
    Json(serde_json::json!({
        "status": if cache.healthy { "healthy" } else { "degraded" },
        "policy": state.service.policy().to_string(),
        "cache": cache,
    }))
}
