//! Time-indexed position path with linear interpolation.

use roadsurvey_storage::Coordinate;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum InterpolationError {
    #[error("Path needs at least 2 samples, got {0}")]
    TooFewSamples(usize),

    /// Two samples share a timestamp; deduplicate before building the path
    #[error("Duplicate sample timestamp {0}")]
    DuplicateTimestamp(i64),
}

/// One position fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathSample {
    /// Unix milliseconds
    pub timestamp: i64,
    pub coordinate: Coordinate,
}

impl PathSample {
    pub fn new(timestamp: i64, lat: f64, lng: f64) -> Self {
        Self {
            timestamp,
            coordinate: Coordinate::new(lat, lng),
        }
    }
}

/// Polyline in (time, lat, lng), ascending by time
#[derive(Debug, Clone)]
pub struct PathInterpolator {
    samples: Vec<PathSample>,
}

impl PathInterpolator {
    pub fn new(mut samples: Vec<PathSample>) -> Result<Self, InterpolationError> {
        if samples.len() < 2 {
            return Err(InterpolationError::TooFewSamples(samples.len()));
        }

        samples.sort_by_key(|s| s.timestamp);
        if let Some(pair) = samples.windows(2).find(|w| w[0].timestamp == w[1].timestamp) {
            return Err(InterpolationError::DuplicateTimestamp(pair[0].timestamp));
        }

        Ok(Self { samples })
    }

    pub fn start(&self) -> i64 {
        self.samples[0].timestamp
    }

    pub fn end(&self) -> i64 {
        self.samples[self.samples.len() - 1].timestamp
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start() <= timestamp && timestamp <= self.end()
    }

    /// Location at `timestamp`. Outside the path the boundary sample is
    /// returned unchanged; the path is never extrapolated.
    pub fn point_at(&self, timestamp: i64) -> Coordinate {
        let first = &self.samples[0];
        let last = &self.samples[self.samples.len() - 1];

        if timestamp < first.timestamp {
            warn!(timestamp, start = first.timestamp, "Clamping to path start");
            return first.coordinate;
        }
        if timestamp > last.timestamp {
            warn!(timestamp, end = last.timestamp, "Clamping to path end");
            return last.coordinate;
        }

        // index of the first sample at or after `timestamp`
        let idx = self.samples.partition_point(|s| s.timestamp < timestamp);
        let next = &self.samples[idx];
        if next.timestamp == timestamp {
            return next.coordinate;
        }
        let prev = &self.samples[idx - 1];

        let span = (next.timestamp - prev.timestamp) as f64;
        let next_weight = (timestamp - prev.timestamp) as f64 / span;
        let prev_weight = 1.0 - next_weight;

        Coordinate::new(
            prev.coordinate.lat * prev_weight + next.coordinate.lat * next_weight,
            prev.coordinate.lng * prev_weight + next.coordinate.lng * next_weight,
        )
    }
}
