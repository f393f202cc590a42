//! Ingestion run orchestration.
//!
//! Every input shape (archive, prefix, local files) is an [`InputSource`]:
//! it lists file names, uploads a named file to a destination key and reads
//! the position log. One routine drives all three:
//!
//! 1. classify files by name: images, the `GPS.txt` position log, ignored
//! 2. fuse positions with images (snapped or interpolated)
//! 3. upload every image still referenced by raw file name
//! 4. persist the fused predictions as a new route
//!
//! Archive runs then delete the archive and announce the route, strictly
//! after the route is stored.

use crate::geolocator::{self, GeolocateError, Geolocator};
use crate::interpolator::PathSample;
use crate::roads::RoadSnapper;
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use roadsurvey_pipeline::{ProducerError, RouteNotifier};
use roadsurvey_storage::object_store::sanitize_path_component;
use roadsurvey_storage::{
    ImageRef, ObjectLocator, Reading, Route, RouteSpec, StorageError, SurveyStore,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Exact name of the position log
pub const POSITION_LOG_NAME: &str = "GPS.txt";

const IMAGE_EXTENSION: &str = "jpg";
const MILLIS_IMAGE_PREFIX: &str = "img_";

#[derive(Debug, Error)]
pub enum DigestError {
    /// A `.jpg` whose name carries no recognizable timestamp
    #[error("Unrecognized input file: {0}")]
    UnrecognizedType(String),

    #[error("No {POSITION_LOG_NAME} in input")]
    MissingPositionLog,

    #[error("More than one {POSITION_LOG_NAME} in input")]
    DuplicatePositionLog,

    #[error("Malformed position log line {line}: {message}")]
    MalformedPositionLog { line: usize, message: String },

    #[error("No image could be located within the position log's time span")]
    NoLocatedImages,

    #[error("Input source error: {0}")]
    Source(String),

    #[error(transparent)]
    Geolocate(#[from] GeolocateError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Notify(#[from] ProducerError),
}

pub type Result<T> = std::result::Result<T, DigestError>;

/// What a file name means to ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image { timestamp: i64 },
    PositionLog,
    Ignored,
}

/// Final path segment of a key or path
pub fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Classify an input file by name and extension
pub fn classify(name: &str) -> Result<FileKind> {
    let base = base_name(name);
    if base == POSITION_LOG_NAME {
        return Ok(FileKind::PositionLog);
    }

    match base.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case(IMAGE_EXTENSION) => {
            let timestamp = parse_image_timestamp(stem)
                .ok_or_else(|| DigestError::UnrecognizedType(name.to_string()))?;
            Ok(FileKind::Image { timestamp })
        }
        _ => Ok(FileKind::Ignored),
    }
}

/// Millisecond timestamp from an image stem: `YYYY_MM_DD_HH_MM_SS_mmm-<n>`
/// (UTC wall clock) or `img_<unixMillis>-<n>`
pub fn parse_image_timestamp(stem: &str) -> Option<i64> {
    let (head, sequence) = stem.rsplit_once('-')?;
    if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    match head.strip_prefix(MILLIS_IMAGE_PREFIX) {
        Some(millis) => parse_millis(millis),
        None => parse_wall_clock(head),
    }
}

fn parse_millis(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// `YYYY_MM_DD_HH_MM_SS_mmm` as UTC
fn parse_wall_clock(s: &str) -> Option<i64> {
    let parts: Vec<u32> = s
        .split('_')
        .map(|p| {
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                p.parse().ok()
            }
        })
        .collect::<Option<_>>()?;

    let [year, month, day, hour, minute, second, milli] = parts[..] else {
        return None;
    };

    let naive = NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)?
        .and_hms_milli_opt(hour, minute, second, milli)?;
    Some(Utc.from_utc_datetime(&naive).timestamp_millis())
}

/// Parse the position log: one `<timestamp> <lat> <lng>` fix per line,
/// separated by commas or whitespace. Blank and `#` lines are skipped.
/// Output is ascending by timestamp with duplicate timestamps removed
/// (first fix in the file wins).
pub fn parse_position_log(text: &str) -> Result<Vec<PathSample>> {
    let mut samples = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let malformed = |message: &str| DigestError::MalformedPositionLog {
            line: index + 1,
            message: message.to_string(),
        };

        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        let [timestamp, lat, lng] = fields[..] else {
            return Err(malformed("expected <timestamp> <lat> <lng>"));
        };

        let timestamp = parse_millis(timestamp)
            .or_else(|| parse_wall_clock(timestamp))
            .ok_or_else(|| malformed("unparseable timestamp"))?;
        let lat: f64 = lat.parse().map_err(|_| malformed("latitude is not a number"))?;
        let lng: f64 = lng.parse().map_err(|_| malformed("longitude is not a number"))?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(malformed("coordinate out of range"));
        }

        samples.push(PathSample::new(timestamp, lat, lng));
    }

    samples.sort_by_key(|s| s.timestamp);
    let before = samples.len();
    samples.dedup_by_key(|s| s.timestamp);
    if samples.len() < before {
        debug!(dropped = before - samples.len(), "Duplicate position timestamps dropped");
    }

    Ok(samples)
}

/// Places a named input file at a destination key
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, file: &str, key: &str) -> Result<ObjectLocator>;
}

/// Reads the position log text
#[async_trait]
pub trait LogReader: Send + Sync {
    async fn read_log(&self, file: &str) -> Result<String>;
}

/// One ingestion input
#[async_trait]
pub trait InputSource: Uploader + LogReader {
    async fn file_names(&self) -> Result<Vec<String>>;
}

/// Per-run options
#[derive(Debug, Clone)]
pub struct DigestRequest {
    pub user_id: String,
    pub snap_to_roads: bool,
    pub route_name: Option<String>,
}

impl DigestRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            snap_to_roads: false,
            route_name: None,
        }
    }

    pub fn with_snap_to_roads(mut self, snap_to_roads: bool) -> Self {
        self.snap_to_roads = snap_to_roads;
        self
    }

    pub fn with_route_name(mut self, name: Option<String>) -> Self {
        self.route_name = name;
        self
    }
}

pub struct Digester {
    store: Arc<SurveyStore>,
    geolocator: Geolocator,
    notifier: Arc<dyn RouteNotifier>,
    image_prefix: String,
}

impl Digester {
    pub fn new(
        store: Arc<SurveyStore>,
        snapper: Arc<dyn RoadSnapper>,
        notifier: Arc<dyn RouteNotifier>,
        image_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            geolocator: Geolocator::new(snapper),
            notifier,
            image_prefix: image_prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<SurveyStore> {
        &self.store
    }

    /// Digest an uploaded zip archive, then delete it and announce the route
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn digest_archive(
        &self,
        bucket: &str,
        key: &str,
        request: &DigestRequest,
    ) -> Result<Route> {
        let archive = ObjectLocator::new(bucket, key);
        let objects = self.store.objects().clone();
        let bytes = objects.get_bytes(&archive).await?;
        let source = crate::sources::ArchiveSource::new(bytes, objects.clone())?;

        let route = self.digest(&source, request).await?;

        // route is stored; announce it even if the archive lingers
        if let Err(e) = objects.delete(&archive).await {
            warn!(archive = %archive, error = %e, "Failed to delete digested archive");
        }
        self.notifier
            .notify_route_ready(&route.user_id, &route.route_id)
            .await?;

        info!(route_id = %route.route_id, archive = %archive, "Archive digested");
        Ok(route)
    }

    /// Digest files already uploaded under one flat prefix
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn digest_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        request: &DigestRequest,
    ) -> Result<Route> {
        let source =
            crate::sources::PrefixSource::new(bucket, prefix, self.store.objects().clone());
        self.digest(&source, request).await
    }

    /// Digest files on local disk
    #[instrument(skip(self, files, request), fields(user_id = %request.user_id, files = files.len()))]
    pub async fn digest_local(
        &self,
        files: Vec<std::path::PathBuf>,
        request: &DigestRequest,
    ) -> Result<Route> {
        let source = crate::sources::LocalSource::new(files, self.store.objects().clone());
        self.digest(&source, request).await
    }

    /// Shared orchestration for every input shape
    pub async fn digest(&self, source: &dyn InputSource, request: &DigestRequest) -> Result<Route> {
        let route_id = Uuid::new_v4().to_string();
        let file_names = source.file_names().await?;

        let mut images = Vec::new();
        let mut position_log = None;
        for name in &file_names {
            match classify(name)? {
                FileKind::Image { timestamp } => images.push(Reading::image(
                    Uuid::new_v4().to_string(),
                    &route_id,
                    timestamp,
                    ImageRef::raw(name.as_str()),
                )),
                FileKind::PositionLog => {
                    if position_log.replace(name.as_str()).is_some() {
                        return Err(DigestError::DuplicatePositionLog);
                    }
                }
                FileKind::Ignored => info!(file = %name, "Ignoring unrecognized file"),
            }
        }
        let log_name = position_log.ok_or(DigestError::MissingPositionLog)?;

        let samples = parse_position_log(&source.read_log(log_name).await?)?;
        let positions: Vec<Reading> = samples
            .iter()
            .map(|s| {
                Reading::position(Uuid::new_v4().to_string(), &route_id, s.timestamp, s.coordinate)
            })
            .collect();

        info!(
            route_id = %route_id,
            images = images.len(),
            positions = positions.len(),
            snap_to_roads = request.snap_to_roads,
            "Input classified"
        );

        let mut predictions = if request.snap_to_roads {
            self.geolocator
                .generate_predictions(positions, &images)
                .await?
        } else {
            geolocator::interpolated(&positions, &images)?
        };
        if predictions.is_empty() {
            return Err(DigestError::NoLocatedImages);
        }

        self.upload_pending_images(source, &route_id, &mut predictions)
            .await?;

        let route = self
            .store
            .create_route(RouteSpec {
                route_id,
                user_id: request.user_id.clone(),
                name: request.route_name.clone(),
                readings: predictions,
            })
            .await?;

        Ok(route)
    }

    /// Resolve every raw image reference; resolved ones are left alone
    async fn upload_pending_images(
        &self,
        uploader: &dyn InputSource,
        route_id: &str,
        readings: &mut [Reading],
    ) -> Result<()> {
        let mut uploaded = 0;
        for reading in readings.iter_mut() {
            let Some(image) = reading.image_ref_mut() else {
                continue;
            };
            let ImageRef::Raw { file } = image else {
                continue;
            };

            let key = self.image_key(route_id, file);
            let locator = uploader.upload(file, &key).await?;
            *image = ImageRef::Stored(locator);
            uploaded += 1;
        }

        debug!(uploaded, "Images uploaded");
        Ok(())
    }

    /// `<prefix>/<route_id>/images/<file>`
    fn image_key(&self, route_id: &str, file: &str) -> String {
        format!(
            "{}/{}/images/{}",
            self.image_prefix.trim_end_matches('/'),
            sanitize_path_component(route_id),
            sanitize_path_component(base_name(file))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roads::{MockRoadSnapper, SnappedPoint};
    use parking_lot::Mutex;
    use roadsurvey_storage::config::LimitsConfig;
    use roadsurvey_storage::{Coordinate, MemoryObjectStore, MemoryStore, ReadingType};
    use std::collections::HashMap;

    #[test]
    fn test_wall_clock_image_timestamps() {
        assert_eq!(
            classify("2021_04_10_22_18_22_123-1.jpg").unwrap(),
            FileKind::Image {
                timestamp: 1_618_093_102_123
            }
        );
        assert_eq!(
            classify("2018_01_05_22_58_22_123-1.jpg").unwrap(),
            FileKind::Image {
                timestamp: 1_515_193_102_123
            }
        );
    }

    #[test]
    fn test_timestamps_monotonic_with_wall_clock() {
        let a = parse_image_timestamp("2021_04_10_22_18_22_123-1").unwrap();
        let b = parse_image_timestamp("2021_04_10_22_18_22_124-1").unwrap();
        let c = parse_image_timestamp("2021_04_10_22_18_23_000-2").unwrap();
        assert_eq!(b - a, 1);
        assert_eq!(c - b, 876);
    }

    #[test]
    fn test_millis_image_names() {
        assert_eq!(
            classify("uploads/u1/img_1618093102123-7.JPG").unwrap(),
            FileKind::Image {
                timestamp: 1_618_093_102_123
            }
        );
    }

    #[test]
    fn test_classify_other_files() {
        assert_eq!(classify("GPS.txt").unwrap(), FileKind::PositionLog);
        assert_eq!(classify("prefix/GPS.txt").unwrap(), FileKind::PositionLog);
        assert_eq!(classify("gps.txt").unwrap(), FileKind::Ignored);
        assert_eq!(classify("notes.md").unwrap(), FileKind::Ignored);
        assert_eq!(classify("dir/").unwrap(), FileKind::Ignored);

        for bad in ["holiday.jpg", "2021_13_10_22_18_22_123-1.jpg", "img_12ab-1.jpg", "img_5.jpg"] {
            assert!(
                matches!(classify(bad), Err(DigestError::UnrecognizedType(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_parse_position_log() {
        let text = "\
# time lat lng
1000, -27.0, 153.0

3000 -27.2 153.2
2000,-27.1,153.1
2000,-99.0,0.0
2021_04_10_22_18_22_123 -27.3 153.3
";
        // the duplicate 2000 line is out of range, so this errors first
        assert!(matches!(
            parse_position_log(text),
            Err(DigestError::MalformedPositionLog { line: 6, .. })
        ));

        let text = text.replace("-99.0", "-27.9");
        let samples = parse_position_log(&text).unwrap();
        let stamps: Vec<_> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![1000, 2000, 3000, 1_618_093_102_123]);
        assert_eq!(samples[1].coordinate, Coordinate::new(-27.1, 153.1));
    }

    #[test]
    fn test_position_log_rejects_garbage() {
        for text in ["1000 -27.0", "abc 1 2", "1000 north 153", "1 2 3 4"] {
            assert!(
                matches!(
                    parse_position_log(text),
                    Err(DigestError::MalformedPositionLog { line: 1, .. })
                ),
                "{text}"
            );
        }
    }

    /// In-memory input source over named blobs
    struct FakeSource {
        files: HashMap<String, Vec<u8>>,
        objects: Arc<MemoryObjectStore>,
    }

    #[async_trait]
    impl Uploader for FakeSource {
        async fn upload(&self, file: &str, key: &str) -> Result<ObjectLocator> {
            let data = self.files[file].clone();
            Ok(roadsurvey_storage::ObjectStore::upload(
                self.objects.as_ref(),
                roadsurvey_storage::UploadSource::Bytes(data.into()),
                key,
            )
            .await?)
        }
    }

    #[async_trait]
    impl LogReader for FakeSource {
        async fn read_log(&self, file: &str) -> Result<String> {
            String::from_utf8(self.files[file].clone()).map_err(|e| DigestError::Source(e.to_string()))
        }
    }

    #[async_trait]
    impl InputSource for FakeSource {
        async fn file_names(&self) -> Result<Vec<String>> {
            let mut names: Vec<_> = self.files.keys().cloned().collect();
            names.sort();
            Ok(names)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RouteNotifier for RecordingNotifier {
        async fn notify_route_ready(
            &self,
            user_id: &str,
            route_id: &str,
        ) -> std::result::Result<(), ProducerError> {
            self.sent
                .lock()
                .push((user_id.to_string(), route_id.to_string()));
            Ok(())
        }
    }

    fn digester(snapper: MockRoadSnapper) -> (Digester, Arc<MemoryObjectStore>) {
        let objects = Arc::new(MemoryObjectStore::new("survey"));
        let store = Arc::new(SurveyStore::new(
            Arc::new(MemoryStore::new()),
            objects.clone(),
            LimitsConfig::default(),
        ));
        let digester = Digester::new(
            store,
            Arc::new(snapper),
            Arc::new(RecordingNotifier::default()),
            "routes",
        );
        (digester, objects)
    }

    fn source(objects: Arc<MemoryObjectStore>, with_log: bool) -> FakeSource {
        let mut files = HashMap::from([
            ("img_1500-1.jpg".to_string(), b"a".to_vec()),
            ("img_2500-2.jpg".to_string(), b"b".to_vec()),
            ("img_9000-3.jpg".to_string(), b"c".to_vec()),
            ("readme.txt".to_string(), b"hello".to_vec()),
        ]);
        if with_log {
            files.insert(
                POSITION_LOG_NAME.to_string(),
                b"1000,-27.0,153.0\n2000,-27.1,153.1\n3000,-27.2,153.2\n".to_vec(),
            );
        }
        FakeSource { files, objects }
    }

    #[tokio::test]
    async fn test_digest_interpolated_run() {
        let mut snapper = MockRoadSnapper::new();
        snapper.expect_snap().never();
        let (digester, objects) = digester(snapper);
        let source = source(objects.clone(), true);

        let route = tokio_test::assert_ok!(
            digester.digest(&source, &DigestRequest::new("user-1")).await
        );

        let readings = digester
            .store()
            .get_route_readings(&route.route_id)
            .await
            .unwrap();
        assert_eq!(readings.len(), 2);
        for reading in &readings {
            assert_eq!(reading.reading_type(), ReadingType::Prediction);
            let locator = reading.image_ref().and_then(ImageRef::locator).unwrap();
            assert!(locator
                .key
                .starts_with(&format!("routes/{}/images/img_", route.route_id)));
            assert!(objects.contains(locator));
        }
        assert_eq!(route.name.len(), 21);
    }

    #[tokio::test]
    async fn test_digest_snapped_run() {
        let mut snapper = MockRoadSnapper::new();
        snapper
            .expect_snap()
            .times(1)
            .withf(|path, interpolate| path.len() == 3 && *interpolate)
            .returning(|path: &[Coordinate], _| {
                Ok(path
                    .iter()
                    .enumerate()
                    .map(|(i, c)| SnappedPoint {
                        coordinate: Coordinate::new(c.lat, c.lng + 0.001),
                        original_index: Some(i),
                    })
                    .collect())
            });
        let (digester, objects) = digester(snapper);

        let route = digester
            .digest(
                &source(objects, true),
                &DigestRequest::new("user-1")
                    .with_snap_to_roads(true)
                    .with_route_name(Some("Highway 1".to_string())),
            )
            .await
            .unwrap();

        assert_eq!(route.name, "Highway 1");
        let sample = &route.sample_data[&ReadingType::Prediction];
        assert!((sample.coordinate().unwrap().lng - 153.051).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_position_log_fails_whole_run() {
        let mut snapper = MockRoadSnapper::new();
        snapper.expect_snap().never();
        let (digester, objects) = digester(snapper);

        let result = digester
            .digest(&source(objects.clone(), false), &DigestRequest::new("user-1"))
            .await;

        assert!(matches!(result, Err(DigestError::MissingPositionLog)));
        assert!(objects.is_empty());
        assert!(digester
            .store()
            .list_user_routes("user-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_no_located_images_is_an_error() {
        let mut snapper = MockRoadSnapper::new();
        snapper.expect_snap().never();
        let (digester, objects) = digester(snapper);
        let mut source = source(objects, true);
        source.files.retain(|name, _| name == POSITION_LOG_NAME || name == "img_9000-3.jpg");

        assert!(matches!(
            digester.digest(&source, &DigestRequest::new("u")).await,
            Err(DigestError::NoLocatedImages)
        ));
    }
}
