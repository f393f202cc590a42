//! Typed readings.
//!
//! A reading is one timestamped observation belonging to a route. All
//! variants share a header (`reading_id`, `route_id`, `timestamp`); the
//! variant itself determines the reading type and which fields exist.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of reading kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingType {
    Position,
    Image,
    Prediction,
}

impl ReadingType {
    pub const ALL: [ReadingType; 3] = [
        ReadingType::Position,
        ReadingType::Image,
        ReadingType::Prediction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingType::Position => "position",
            ReadingType::Image => "image",
            ReadingType::Prediction => "prediction",
        }
    }
}

impl fmt::Display for ReadingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "position" => Ok(ReadingType::Position),
            "image" => Ok(ReadingType::Image),
            "prediction" => Ok(ReadingType::Prediction),
            other => Err(StorageError::UnrecognizedType(other.to_string())),
        }
    }
}

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Object-store location of an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Where an image lives: a raw file awaiting upload, or its resolved object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRef {
    Raw { file: String },
    Stored(ObjectLocator),
}

impl ImageRef {
    pub fn raw(file: impl Into<String>) -> Self {
        ImageRef::Raw { file: file.into() }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ImageRef::Stored(_))
    }

    pub fn locator(&self) -> Option<&ObjectLocator> {
        match self {
            ImageRef::Stored(locator) => Some(locator),
            ImageRef::Raw { .. } => None,
        }
    }
}

/// One detected road-defect class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    /// In `[0, 1]`
    pub confidence: f64,
    pub present: bool,
    /// Non-negative
    pub severity: f64,
}

/// Position + image plus the annotation made on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub position: Coordinate,
    pub image: ImageRef,
    pub entities: Vec<Entity>,
    pub annotation_timestamp: i64,
    pub annotator_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reading_type", rename_all = "snake_case")]
pub enum ReadingData {
    Position(Coordinate),
    Image { image: ImageRef },
    Prediction(Prediction),
}

/// A typed reading with its shared header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub reading_id: String,
    pub route_id: String,
    /// Unix milliseconds
    pub timestamp: i64,
    #[serde(flatten)]
    pub data: ReadingData,
}

impl Reading {
    pub fn position(
        reading_id: impl Into<String>,
        route_id: impl Into<String>,
        timestamp: i64,
        coordinate: Coordinate,
    ) -> Self {
        Self {
            reading_id: reading_id.into(),
            route_id: route_id.into(),
            timestamp,
            data: ReadingData::Position(coordinate),
        }
    }

    pub fn image(
        reading_id: impl Into<String>,
        route_id: impl Into<String>,
        timestamp: i64,
        image: ImageRef,
    ) -> Self {
        Self {
            reading_id: reading_id.into(),
            route_id: route_id.into(),
            timestamp,
            data: ReadingData::Image { image },
        }
    }

    pub fn reading_type(&self) -> ReadingType {
        match self.data {
            ReadingData::Position(_) => ReadingType::Position,
            ReadingData::Image { .. } => ReadingType::Image,
            ReadingData::Prediction(_) => ReadingType::Prediction,
        }
    }

    /// Location, for the variants that carry one
    pub fn coordinate(&self) -> Option<Coordinate> {
        match &self.data {
            ReadingData::Position(c) => Some(*c),
            ReadingData::Prediction(p) => Some(p.position),
            ReadingData::Image { .. } => None,
        }
    }

    pub fn image_ref(&self) -> Option<&ImageRef> {
        match &self.data {
            ReadingData::Image { image } => Some(image),
            ReadingData::Prediction(p) => Some(&p.image),
            ReadingData::Position(_) => None,
        }
    }

    pub fn image_ref_mut(&mut self) -> Option<&mut ImageRef> {
        match &mut self.data {
            ReadingData::Image { image } => Some(image),
            ReadingData::Prediction(p) => Some(&mut p.image),
            ReadingData::Position(_) => None,
        }
    }

    /// Lightweight pointer used by layers, with the partition derived from
    /// this reading's coordinate. Readings read back from the store should
    /// use [`StoredReading::reference`].
    pub fn reference(&self) -> ReadingRef {
        ReadingRef {
            reading_id: self.reading_id.clone(),
            partition_key: crate::keys::reading_partition_key(self),
        }
    }
}

/// A decoded reading together with the partition it was written under.
///
/// Decoded coordinates carry fixed-precision rounding, so the partition is
/// never recomputed from them.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub partition_key: String,
    pub reading: Reading,
}

impl StoredReading {
    pub fn item_key(&self) -> crate::kv::ItemKey {
        crate::kv::ItemKey::new(
            self.partition_key.clone(),
            crate::keys::reading_sort_key(self.reading.reading_type(), &self.reading.reading_id),
        )
    }

    pub fn reference(&self) -> ReadingRef {
        ReadingRef {
            reading_id: self.reading.reading_id.clone(),
            partition_key: self.partition_key.clone(),
        }
    }
}

/// `{reading_id, partition_key}` pair stored in layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingRef {
    pub reading_id: String,
    pub partition_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_type_parse() {
        for rt in ReadingType::ALL {
            assert_eq!(rt.as_str().parse::<ReadingType>().unwrap(), rt);
        }
        assert!(matches!(
            "lidar".parse::<ReadingType>(),
            Err(StorageError::UnrecognizedType(t)) if t == "lidar"
        ));
    }

    #[test]
    fn test_coordinate_by_variant() {
        let pos = Reading::position("r1", "route", 10, Coordinate::new(1.0, 2.0));
        assert_eq!(pos.coordinate(), Some(Coordinate::new(1.0, 2.0)));
        assert!(pos.image_ref().is_none());

        let img = Reading::image("r2", "route", 10, ImageRef::raw("a.jpg"));
        assert_eq!(img.coordinate(), None);
        assert_eq!(img.reading_type(), ReadingType::Image);
        assert!(!img.image_ref().unwrap().is_resolved());
    }

    #[test]
    fn test_reading_json_shape() {
        let reading = Reading::position("r1", "route", 10, Coordinate::new(1.5, -2.5));
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["reading_type"], "position");
        assert_eq!(json["lat"], 1.5);

        let back: Reading = serde_json::from_value(json).unwrap();
        assert_eq!(back, reading);
    }
}
