//! Query API: routes, readings with presigned image URLs, layers.

use crate::config::ApiConfig;
use crate::error::StorageError;
use crate::kv::ItemKey;
use crate::model::{Bounded, Layer, Route, RouteStatus};
use crate::object_store::ObjectStore;
use crate::reading::{Reading, ReadingRef, ReadingType};
use crate::store::SurveyStore;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SurveyStore>,
    pub presigned_url_expiry: Duration,
}

/// A reading plus a time-limited URL for its image, if it has a stored one
#[derive(Debug, Clone, Serialize)]
pub struct ReadingView {
    #[serde(flatten)]
    pub reading: Reading,
    pub image_url: Option<String>,
    pub url_expires_at: Option<DateTime<Utc>>,
    /// Set when the reading has a stored image but no URL could be generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url_error: Option<String>,
}

/// Resolve stored image locators to presigned URLs. Readings without a
/// stored image get no URL; a failed presign leaves the URL empty and
/// records the failure in `image_url_error`.
pub async fn attach_image_urls(
    objects: &dyn ObjectStore,
    readings: Vec<Reading>,
    ttl: Duration,
) -> Vec<ReadingView> {
    let expires_at = chrono::Duration::from_std(ttl)
        .ok()
        .map(|ttl| Utc::now() + ttl);
    let mut views = Vec::with_capacity(readings.len());

    for reading in readings {
        let locator = reading.image_ref().and_then(|image| image.locator()).cloned();
        let (image_url, image_url_error) = match locator {
            Some(locator) => match objects.presign(&locator, ttl).await {
                Ok(url) => (Some(url), None),
                Err(e) => {
                    warn!(error = %e, locator = %locator, "Failed to presign image");
                    (None, Some(e.to_string()))
                }
            },
            None => (None, None),
        };

        views.push(ReadingView {
            url_expires_at: image_url.as_ref().and(expires_at),
            reading,
            image_url,
            image_url_error,
        });
    }

    views
}

/// Bucket page query parameters
#[derive(Debug, Deserialize)]
pub struct BucketPageQuery {
    /// Sort key to continue after, from a previous page's `next`
    pub start: Option<String>,
    pub reading_type: Option<ReadingType>,
    pub limit: Option<usize>,
}

/// One page of a bucket
#[derive(Debug, Serialize)]
pub struct BucketPage {
    pub readings: Vec<ReadingView>,
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: RouteStatus,
}

#[derive(Debug, Deserialize)]
pub struct AddReadingsRequest {
    pub readings: Vec<ReadingRef>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn api_error(e: StorageError) -> ApiError {
    let (status, code) = match &e {
        StorageError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        StorageError::PreconditionViolation(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        StorageError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
        StorageError::UnrecognizedType(_) => (StatusCode::BAD_REQUEST, "UNRECOGNIZED_TYPE"),
        StorageError::MalformedItem(_)
        | StorageError::Backend(_)
        | StorageError::Serialization(_) => {
            error!(error = %e, "Storage request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
        }
    };

    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
}

fn not_found(what: String) -> ApiError {
    api_error(StorageError::not_found(what))
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/routes/:route_id", get(get_route).patch(rename_route))
        .route("/api/v1/routes/:route_id/readings", get(get_route_readings))
        .route("/api/v1/routes/:route_id/status", put(set_route_status))
        .route("/api/v1/users/:user_id/routes", get(list_user_routes))
        .route("/api/v1/buckets/:bucket_key/readings", get(get_bucket_page))
        .route("/api/v1/groups/:group_id/layers/:layer_id", get(get_layer))
        .route(
            "/api/v1/groups/:group_id/layers/:layer_id/readings",
            post(add_layer_readings),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "storage-service"
    }))
}

#[instrument(skip(state))]
async fn get_route(State(state): State<AppState>, Path(route_id): Path<String>) -> ApiResult<Route> {
    state
        .store
        .get_route(&route_id)
        .await
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("route {route_id}")))
}

/// All readings of a route with image URLs, offloaded to the object store
/// when the response would be too large
#[instrument(skip(state))]
async fn get_route_readings(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
) -> ApiResult<Bounded<Vec<ReadingView>>> {
    if state.store.get_route(&route_id).await.map_err(api_error)?.is_none() {
        return Err(not_found(format!("route {route_id}")));
    }

    let readings = state
        .store
        .get_route_readings(&route_id)
        .await
        .map_err(api_error)?;
    let views = attach_image_urls(
        state.store.objects().as_ref(),
        readings,
        state.presigned_url_expiry,
    )
    .await;

    state
        .store
        .bound_payload(views)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
async fn list_user_routes(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<Route>> {
    state
        .store
        .list_user_routes(&user_id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Single native page of a spatial bucket
#[instrument(skip(state))]
async fn get_bucket_page(
    State(state): State<AppState>,
    Path(bucket_key): Path<String>,
    Query(params): Query<BucketPageQuery>,
) -> ApiResult<BucketPage> {
    let start = params
        .start
        .map(|sk| ItemKey::new(bucket_key.as_str(), sk).to_item());

    let (readings, next) = state
        .store
        .query_readings_page(&bucket_key, params.reading_type, start, params.limit)
        .await
        .map_err(api_error)?;

    let next = next
        .map(|item| ItemKey::of(&item).map(|key| key.sk))
        .transpose()
        .map_err(api_error)?;

    let readings = attach_image_urls(
        state.store.objects().as_ref(),
        readings,
        state.presigned_url_expiry,
    )
    .await;

    Ok(Json(BucketPage { readings, next }))
}

#[instrument(skip(state, request))]
async fn rename_route(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Route> {
    state
        .store
        .update_route_name(&route_id, &request.name)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state, request))]
async fn set_route_status(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> ApiResult<Route> {
    state
        .store
        .set_route_status(&route_id, request.status)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
async fn get_layer(
    State(state): State<AppState>,
    Path((group_id, layer_id)): Path<(String, String)>,
) -> ApiResult<Layer> {
    state
        .store
        .get_layer(&group_id, &layer_id)
        .await
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("layer {layer_id} in group {group_id}")))
}

#[instrument(skip(state, request), fields(count = request.readings.len()))]
async fn add_layer_readings(
    State(state): State<AppState>,
    Path((group_id, layer_id)): Path<(String, String)>,
    Json(request): Json<AddReadingsRequest>,
) -> ApiResult<Layer> {
    state
        .store
        .add_readings_to_layer(&group_id, &layer_id, request.readings)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Start the query API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting query API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
