//! Road Survey Storage
//!
//! Persistence for road-condition survey data: routes, their geolocated
//! readings (positions, images, defect predictions) and the organizational
//! hierarchy that scopes access to them.
//!
//! ## Features
//!
//! - **Reading codec**: typed readings to store items with fixed-precision
//!   floats and 0/1 booleans
//! - **Two-table key scheme**: an adjacency-list organization table and a
//!   readings table partitioned by spatial bucket
//! - **Paginated queries**: native continuation keys, surfaced to callers
//! - **Size-bounded reads**: oversized responses are written to S3 and
//!   returned as a pointer
//! - **Query API**: routes and readings with presigned image URLs
//!
//! ## Architecture
//!
//! ```text
//!  Ingestion / Query API
//!          │
//!          ▼
//! ┌──────────────┐   encode/decode   ┌──────────────┐
//! │ SurveyStore  │──────────────────▶│ codec, keys  │
//! └──────────────┘                   └──────────────┘
//!     │       │
//!     │       └──────────────┐
//!     ▼                      ▼
//! ┌──────────────┐    ┌──────────────┐
//! │ KeyValueStore│    │ ObjectStore  │
//! │  DynamoDB    │    │  S3          │
//! │  memory      │    │  memory      │
//! └──────────────┘    └──────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod dynamo;
pub mod error;
pub mod keys;
pub mod kv;
pub mod model;
pub mod object_store;
pub mod presigned_urls;
pub mod reading;
pub mod store;

pub use config::Config;
pub use dynamo::DynamoStore;
pub use error::{Result, StorageError};
pub use kv::{KeyValueStore, MemoryStore};
pub use model::{AccessGroup, Bounded, Layer, Organization, Route, RouteSpec, RouteStatus, User};
pub use object_store::{MemoryObjectStore, ObjectStore, S3ObjectStore, UploadSource};
pub use presigned_urls::{AppState, ReadingView};
pub use reading::{
    Coordinate, Entity, ImageRef, ObjectLocator, Prediction, Reading, ReadingData, ReadingRef,
    ReadingType, StoredReading,
};
pub use store::SurveyStore;
