//! Road-snap service client.
//!
//! Request: up to [`MAX_POINTS_PER_REQUEST`] ordered `(lat, lng)` pairs plus an
//! interpolate flag. Response: ordered snapped points, each optionally naming
//! the input index it replaces.

use crate::config::RoadsConfig;
use async_trait::async_trait;
use roadsurvey_storage::Coordinate;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Service maximum for one request
pub const MAX_POINTS_PER_REQUEST: usize = 100;

const USER_AGENT: &str = concat!("roadsurvey-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum RoadsError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    /// Required fields missing; never retried
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Too many points in one request: {0}")]
    TooManyPoints(usize),
}

/// One point of the snapped path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnappedPoint {
    pub coordinate: Coordinate,
    /// Index into the request path; `None` for points the service inserted
    pub original_index: Option<usize>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoadSnapper: Send + Sync {
    async fn snap(
        &self,
        path: &[Coordinate],
        interpolate: bool,
    ) -> Result<Vec<SnappedPoint>, RoadsError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapResponse {
    #[serde(default)]
    snapped_points: Vec<RawSnappedPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnappedPoint {
    location: Option<RawLocation>,
    original_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Parse a snap response body
pub fn parse_snap_response(body: &str) -> Result<Vec<SnappedPoint>, RoadsError> {
    let response: SnapResponse =
        serde_json::from_str(body).map_err(|e| RoadsError::MalformedResponse(e.to_string()))?;

    response
        .snapped_points
        .into_iter()
        .enumerate()
        .map(|(i, point)| {
            let location = point
                .location
                .ok_or_else(|| RoadsError::MalformedResponse(format!("point {i} has no location")))?;
            match (location.latitude, location.longitude) {
                (Some(lat), Some(lng)) => Ok(SnappedPoint {
                    coordinate: Coordinate::new(lat, lng),
                    original_index: point.original_index,
                }),
                _ => Err(RoadsError::MalformedResponse(format!(
                    "point {i} location lacks latitude/longitude"
                ))),
            }
        })
        .collect()
}

/// `lat,lng|lat,lng|...`
fn path_param(path: &[Coordinate]) -> String {
    path.iter()
        .map(|c| format!("{},{}", c.lat, c.lng))
        .collect::<Vec<_>>()
        .join("|")
}

/// HTTP client for the snap-to-roads service
pub struct RoadsClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl RoadsClient {
    pub fn new(config: &RoadsConfig) -> Result<Self, RoadsError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()
            .map_err(|e| RoadsError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl RoadSnapper for RoadsClient {
    async fn snap(
        &self,
        path: &[Coordinate],
        interpolate: bool,
    ) -> Result<Vec<SnappedPoint>, RoadsError> {
        if path.len() > MAX_POINTS_PER_REQUEST {
            return Err(RoadsError::TooManyPoints(path.len()));
        }

        let params = [
            ("path", path_param(path)),
            ("interpolate", interpolate.to_string()),
            ("key", self.api_key.clone()),
        ];

        debug!(points = path.len(), interpolate, "Requesting road snap");

        let response = self
            .http_client
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| RoadsError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RoadsError::Api(status.as_u16(), error_text));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RoadsError::Network(e.to_string()))?;
        let points = parse_snap_response(&body)?;

        debug!(snapped = points.len(), "Road snap response");
        Ok(points)
    }
}
