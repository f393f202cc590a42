//! Road survey ingest - fuses a GPS position log with timestamped survey
//! photographs into geolocated prediction readings and persists them as a
//! route.
//!
//! # Architecture
//!
//! ```text
//! archive / prefix / local files
//!         │
//!         ▼
//!    ┌──────────┐  positions + images  ┌────────────┐   snap (optional)  ┌─────────────┐
//!    │ Digester │─────────────────────▶│ Geolocator │───────────────────▶│ RoadsClient │
//!    └──────────┘                      └────────────┘                    └─────────────┘
//!         │ predictions
//!         ▼
//!   SurveyStore (DynamoDB + S3) ──▶ SurveyProducer (Kafka)
//! ```

pub mod config;
pub mod digester;
pub mod geolocator;
pub mod interpolator;
pub mod roads;
pub mod sources;

pub use config::IngestConfig;
pub use digester::{DigestError, DigestRequest, Digester, FileKind, InputSource};
pub use geolocator::{GeolocateError, Geolocator};
pub use interpolator::{PathInterpolator, PathSample};
pub use roads::{RoadSnapper, RoadsClient, RoadsError, SnappedPoint};
pub use sources::{ArchiveSource, LocalSource, PrefixSource};
