//! Position/image fusion.
//!
//! Two modes produce prediction stubs from a route's position and image
//! readings:
//!
//! - **interpolation**: each image inside the position path's time span is
//!   located by linear interpolation; images outside it are dropped
//! - **snap**: positions are first corrected onto road geometry by the
//!   road-snap service, in batches of [`MAX_POINTS_PER_REQUEST`], then
//!   interpolated as above

use crate::interpolator::{InterpolationError, PathInterpolator, PathSample};
use crate::roads::{RoadSnapper, RoadsError, SnappedPoint, MAX_POINTS_PER_REQUEST};
use chrono::Utc;
use roadsurvey_storage::{Coordinate, Prediction, Reading, ReadingData, ReadingType};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Annotator id stamped on generated prediction stubs
pub const AUTOMATED_ANNOTATOR: &str = "automated";

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Error)]
pub enum GeolocateError {
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),

    #[error(transparent)]
    Roads(#[from] RoadsError),

    #[error("Expected a {expected} reading, got {actual} ({reading_id})")]
    WrongReadingType {
        expected: ReadingType,
        actual: ReadingType,
        reading_id: String,
    },

    #[error("Snapped point references index {index} in a batch of {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

pub type Result<T> = std::result::Result<T, GeolocateError>;

pub struct Geolocator {
    snapper: Arc<dyn RoadSnapper>,
}

impl Geolocator {
    pub fn new(snapper: Arc<dyn RoadSnapper>) -> Self {
        Self { snapper }
    }

    /// Snap mode: road-snap the positions, then interpolate
    #[instrument(skip_all, fields(positions = positions.len(), images = images.len()))]
    pub async fn generate_predictions(
        &self,
        positions: Vec<Reading>,
        images: &[Reading],
    ) -> Result<Vec<Reading>> {
        let snapped = self.snap_to_roads(positions).await?;
        interpolated(&snapped, images)
    }

    /// Reposition every position reading onto the road network. Output is
    /// sorted by timestamp and holds exactly the input reading ids.
    pub async fn snap_to_roads(&self, mut positions: Vec<Reading>) -> Result<Vec<Reading>> {
        positions.sort_by_key(|r| r.timestamp);
        let mut snapped = Vec::with_capacity(positions.len());

        for (batch_number, batch) in positions.chunks(MAX_POINTS_PER_REQUEST).enumerate() {
            let path = batch
                .iter()
                .map(position_of)
                .collect::<Result<Vec<_>>>()?;

            let points = self.snapper.snap(&path, true).await?;
            debug!(
                batch = batch_number,
                sent = path.len(),
                received = points.len(),
                "Snapped batch"
            );

            let resolved = resolve_batch(&path, &points)?;
            snapped.extend(batch.iter().zip(resolved).map(|(reading, coordinate)| Reading {
                data: ReadingData::Position(coordinate),
                ..reading.clone()
            }));
        }

        // batches are independent; re-establish global order
        snapped.sort_by_key(|r| r.timestamp);
        info!(positions = snapped.len(), "Positions snapped to roads");
        Ok(snapped)
    }
}

/// Final coordinate for every point of one batch. Indexed points replace
/// their original; every other original takes the nearest returned point.
fn resolve_batch(path: &[Coordinate], points: &[SnappedPoint]) -> Result<Vec<Coordinate>> {
    let mut resolved: Vec<Option<Coordinate>> = vec![None; path.len()];

    for point in points {
        if let Some(index) = point.original_index {
            let slot = resolved.get_mut(index).ok_or(GeolocateError::IndexOutOfRange {
                index,
                len: path.len(),
            })?;
            *slot = Some(point.coordinate);
        }
    }

    if points.is_empty() {
        warn!(points = path.len(), "Snap service matched nothing; keeping raw positions");
    }

    Ok(path
        .iter()
        .zip(resolved)
        .map(|(original, snapped)| {
            snapped
                .or_else(|| nearest(*original, points))
                .unwrap_or(*original)
        })
        .collect())
}

fn nearest(origin: Coordinate, points: &[SnappedPoint]) -> Option<Coordinate> {
    points
        .iter()
        .map(|p| (haversine_distance(origin, p.coordinate), p.coordinate))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, coordinate)| coordinate)
}

/// Great-circle distance in meters
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1_rad = a.lat.to_radians();
    let lat2_rad = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

fn position_of(reading: &Reading) -> Result<Coordinate> {
    match reading.data {
        ReadingData::Position(coordinate) => Ok(coordinate),
        _ => Err(GeolocateError::WrongReadingType {
            expected: ReadingType::Position,
            actual: reading.reading_type(),
            reading_id: reading.reading_id.clone(),
        }),
    }
}

/// Interpolation mode: one prediction stub per image inside the position
/// path's time span, keeping the image's reading id and locator.
pub fn interpolated(positions: &[Reading], images: &[Reading]) -> Result<Vec<Reading>> {
    let samples = positions
        .iter()
        .map(|r| {
            position_of(r).map(|c| PathSample {
                timestamp: r.timestamp,
                coordinate: c,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let path = PathInterpolator::new(samples)?;
    let annotation_timestamp = Utc::now().timestamp_millis();

    let mut predictions = Vec::with_capacity(images.len());
    for reading in images {
        let ReadingData::Image { image } = &reading.data else {
            return Err(GeolocateError::WrongReadingType {
                expected: ReadingType::Image,
                actual: reading.reading_type(),
                reading_id: reading.reading_id.clone(),
            });
        };

        if !path.contains(reading.timestamp) {
            debug!(
                reading_id = %reading.reading_id,
                timestamp = reading.timestamp,
                "Image outside position span, dropped"
            );
            continue;
        }

        predictions.push(Reading {
            reading_id: reading.reading_id.clone(),
            route_id: reading.route_id.clone(),
            timestamp: reading.timestamp,
            data: ReadingData::Prediction(Prediction {
                position: path.point_at(reading.timestamp),
                image: image.clone(),
                entities: Vec::new(),
                annotation_timestamp,
                annotator_id: AUTOMATED_ANNOTATOR.to_string(),
            }),
        });
    }

    predictions.sort_by_key(|r| r.timestamp);
    info!(
        images = images.len(),
        predictions = predictions.len(),
        "Images geolocated"
    );
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roads::MockRoadSnapper;
    use roadsurvey_storage::{ImageRef, ObjectLocator};
    use std::collections::HashSet;

    fn positions(n: usize) -> Vec<Reading> {
        // deliberately out of order
        (0..n)
            .rev()
            .map(|i| {
                Reading::position(
                    format!("pos-{i}"),
                    "route",
                    1_000 + i as i64 * 1_000,
                    Coordinate::new(-27.0 - i as f64 * 1e-4, 153.0),
                )
            })
            .collect()
    }

    fn echo_snapper(expected_calls: usize) -> MockRoadSnapper {
        let mut snapper = MockRoadSnapper::new();
        snapper
            .expect_snap()
            .times(expected_calls)
            .returning(|path: &[Coordinate], _| {
                Ok(path
                    .iter()
                    .enumerate()
                    .map(|(i, c)| SnappedPoint {
                        coordinate: Coordinate::new(c.lat, c.lng + 1e-5),
                        original_index: Some(i),
                    })
                    .collect())
            });
        snapper
    }

    fn assert_complete_and_sorted(output: &[Reading], n: usize) {
        assert_eq!(output.len(), n);
        assert!(output.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        let ids: HashSet<_> = output.iter().map(|r| r.reading_id.as_str()).collect();
        assert_eq!(ids.len(), n);
    }

    #[tokio::test]
    async fn test_exactly_one_batch_makes_one_call() {
        let geolocator = Geolocator::new(Arc::new(echo_snapper(1)));
        let snapped = geolocator.snap_to_roads(positions(100)).await.unwrap();
        assert_complete_and_sorted(&snapped, 100);
        assert!((snapped[0].coordinate().unwrap().lng - 153.00001).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_overflow_batch_makes_two_calls() {
        let geolocator = Geolocator::new(Arc::new(echo_snapper(2)));
        let snapped = geolocator.snap_to_roads(positions(101)).await.unwrap();
        assert_complete_and_sorted(&snapped, 101);
    }

    #[tokio::test]
    async fn test_small_input_one_call() {
        let geolocator = Geolocator::new(Arc::new(echo_snapper(1)));
        let snapped = geolocator.snap_to_roads(positions(7)).await.unwrap();
        assert_complete_and_sorted(&snapped, 7);
    }

    #[test]
    fn test_unmatched_points_take_nearest() {
        let path = [
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.0, 0.01),
            Coordinate::new(0.0, 0.02),
        ];
        let points = [
            SnappedPoint {
                coordinate: Coordinate::new(0.0001, 0.0),
                original_index: Some(0),
            },
            SnappedPoint {
                coordinate: Coordinate::new(0.0001, 0.0199),
                original_index: None,
            },
            SnappedPoint {
                coordinate: Coordinate::new(0.0001, 0.0101),
                original_index: None,
            },
        ];

        let resolved = resolve_batch(&path, &points).unwrap();
        assert_eq!(resolved[0], Coordinate::new(0.0001, 0.0));
        assert_eq!(resolved[1], Coordinate::new(0.0001, 0.0101));
        assert_eq!(resolved[2], Coordinate::new(0.0001, 0.0199));
    }

    #[test]
    fn test_empty_snap_keeps_raw_positions() {
        let path = [Coordinate::new(1.0, 1.0)];
        assert_eq!(resolve_batch(&path, &[]).unwrap(), path.to_vec());
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let points = [SnappedPoint {
            coordinate: Coordinate::new(0.0, 0.0),
            original_index: Some(5),
        }];
        assert!(matches!(
            resolve_batch(&[Coordinate::new(0.0, 0.0)], &points),
            Err(GeolocateError::IndexOutOfRange { index: 5, len: 1 })
        ));
    }

    #[tokio::test]
    async fn test_snap_failure_propagates() {
        let mut snapper = MockRoadSnapper::new();
        snapper
            .expect_snap()
            .times(1)
            .returning(|_, _| Err(RoadsError::MalformedResponse("no location".to_string())));

        let geolocator = Geolocator::new(Arc::new(snapper));
        assert!(matches!(
            geolocator.snap_to_roads(positions(3)).await,
            Err(GeolocateError::Roads(RoadsError::MalformedResponse(_)))
        ));
    }

    #[test]
    fn test_haversine_distance() {
        // one degree of latitude
        let d = haversine_distance(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 1.0);
        assert_eq!(
            haversine_distance(Coordinate::new(5.0, 5.0), Coordinate::new(5.0, 5.0)),
            0.0
        );
    }

    fn image(id: &str, timestamp: i64) -> Reading {
        Reading::image(
            id,
            "route",
            timestamp,
            ImageRef::Stored(ObjectLocator::new("b", format!("{id}.jpg"))),
        )
    }

    #[test]
    fn test_interpolation_drops_images_outside_span() {
        let positions = vec![
            Reading::position("p1", "route", 200, Coordinate::new(-10.0, 150.0)),
            Reading::position("p2", "route", 300, Coordinate::new(-20.0, 100.0)),
        ];
        let images = vec![
            image("before", 100),
            image("mid", 250),
            image("start", 200),
            image("after", 301),
        ];

        let predictions = interpolated(&positions, &images).unwrap();
        let ids: Vec<_> = predictions.iter().map(|r| r.reading_id.as_str()).collect();
        assert_eq!(ids, vec!["start", "mid"]);

        let ReadingData::Prediction(p) = &predictions[1].data else {
            panic!("expected a prediction");
        };
        assert!((p.position.lat - -15.0).abs() < 1e-12);
        assert!((p.position.lng - 125.0).abs() < 1e-12);
        assert_eq!(p.annotator_id, AUTOMATED_ANNOTATOR);
        assert!(p.entities.is_empty());
        assert_eq!(p.image, ImageRef::Stored(ObjectLocator::new("b", "mid.jpg")));
    }

    #[test]
    fn test_interpolation_keeps_raw_image_refs() {
        let positions = vec![
            Reading::position("p1", "route", 0, Coordinate::new(0.0, 0.0)),
            Reading::position("p2", "route", 10, Coordinate::new(1.0, 1.0)),
        ];
        let images = vec![Reading::image("i", "route", 5, ImageRef::raw("x.jpg"))];

        let predictions = interpolated(&positions, &images).unwrap();
        assert_eq!(predictions[0].image_ref(), Some(&ImageRef::raw("x.jpg")));
    }

    #[test]
    fn test_interpolation_needs_two_positions() {
        let positions = vec![Reading::position("p1", "route", 0, Coordinate::new(0.0, 0.0))];
        assert!(matches!(
            interpolated(&positions, &[image("i", 0)]),
            Err(GeolocateError::Interpolation(InterpolationError::TooFewSamples(1)))
        ));
    }

    #[tokio::test]
    async fn test_generate_predictions_snaps_then_interpolates() {
        let geolocator = Geolocator::new(Arc::new(echo_snapper(1)));
        let images = vec![image("a", 1_500), image("b", 50_000)];

        let predictions = geolocator
            .generate_predictions(positions(5), &images)
            .await
            .unwrap();

        assert_eq!(predictions.len(), 1);
        let c = predictions[0].coordinate().unwrap();
        assert!((c.lng - 153.00001).abs() < 1e-9);
    }
}
