//! Survey store: routes, readings and the organizational hierarchy over the
//! two-table key scheme in [`crate::keys`].

use crate::codec;
use crate::config::LimitsConfig;
use crate::error::{Result, StorageError};
use crate::keys::{self, OrgKey, GROUP_PREFIX, LAYER_PREFIX, ROUTE_PREFIX};
use crate::kv::{Item, ItemKey, KeyQuery, KeyValueStore, Table};
use crate::model::{
    default_route_name, AccessGroup, Bounded, Layer, Organization, Route, RouteSpec, RouteStatus,
    User,
};
use crate::object_store::{ObjectStore, UploadSource};
use crate::reading::{Reading, ReadingRef, ReadingType, StoredReading};
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Storage layer shared by ingestion and the query API
pub struct SurveyStore {
    kv: Arc<dyn KeyValueStore>,
    objects: Arc<dyn ObjectStore>,
    limits: LimitsConfig,
}

impl SurveyStore {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        objects: Arc<dyn ObjectStore>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            kv,
            objects,
            limits,
        }
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    // ---- routes ----

    /// Write the route record and its owner reference
    #[instrument(skip(self, route), fields(route_id = %route.route_id))]
    pub async fn put_route(&self, route: &Route) -> Result<()> {
        self.kv.put_item(Table::Organization, route.to_item()?).await?;
        self.kv
            .put_item(Table::Organization, route.user_ref_item())
            .await
    }

    pub async fn get_route(&self, route_id: &str) -> Result<Option<Route>> {
        let key = OrgKey::Route { route_id }.item_key();
        self.kv
            .get_item(Table::Organization, &key)
            .await?
            .map(|item| Route::from_item(&item))
            .transpose()
    }

    async fn require_route(&self, route_id: &str) -> Result<Route> {
        self.get_route(route_id)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("route {route_id}")))
    }

    #[instrument(skip(self))]
    pub async fn update_route_name(&self, route_id: &str, name: &str) -> Result<Route> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::precondition("route name must not be empty"));
        }

        let mut route = self.require_route(route_id).await?;
        route.name = name.to_string();
        route.updated_at = now();
        self.kv.put_item(Table::Organization, route.to_item()?).await?;
        Ok(route)
    }

    /// Move a route forward through its lifecycle. Setting the current
    /// status again changes nothing, including `updated_at`.
    #[instrument(skip(self))]
    pub async fn set_route_status(&self, route_id: &str, status: RouteStatus) -> Result<Route> {
        let mut route = self.require_route(route_id).await?;

        if route.status == status {
            debug!(status = %status, "Route already in requested status");
            return Ok(route);
        }
        if status < route.status {
            return Err(StorageError::InvalidTransition {
                from: route.status.to_string(),
                to: status.to_string(),
            });
        }

        route.status = status;
        route.updated_at = now();
        self.kv.put_item(Table::Organization, route.to_item()?).await?;

        info!(status = %status, "Route status updated");
        Ok(route)
    }

    /// Persist a finished ingestion run. Readings are written before the
    /// route record, so a route never references samples that are not stored.
    #[instrument(skip(self, spec), fields(route_id = %spec.route_id, readings = spec.readings.len()))]
    pub async fn create_route(&self, spec: RouteSpec) -> Result<Route> {
        if spec.readings.is_empty() {
            return Err(StorageError::precondition("route has no readings"));
        }

        let mut seen = HashSet::new();
        for reading in &spec.readings {
            if reading.route_id != spec.route_id {
                return Err(StorageError::precondition(format!(
                    "reading {} belongs to route {}",
                    reading.reading_id, reading.route_id
                )));
            }
            if !seen.insert(reading.reading_id.as_str()) {
                return Err(StorageError::precondition(format!(
                    "duplicate reading id {}",
                    reading.reading_id
                )));
            }
        }

        let mut sample_data: BTreeMap<ReadingType, Reading> = BTreeMap::new();
        for reading in &spec.readings {
            let earlier = sample_data
                .get(&reading.reading_type())
                .map_or(true, |sample| reading.timestamp < sample.timestamp);
            if earlier {
                sample_data.insert(reading.reading_type(), reading.clone());
            }
        }
        let bucket_keys: BTreeSet<String> = spec
            .readings
            .iter()
            .map(keys::reading_partition_key)
            .collect();

        self.put_readings(&spec.readings).await?;

        let created_at = now();
        let route = Route {
            name: spec
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| default_route_name(&spec.route_id)),
            route_id: spec.route_id,
            user_id: spec.user_id,
            status: RouteStatus::Uploaded,
            created_at,
            updated_at: created_at,
            sample_data,
            bucket_keys,
        };
        self.put_route(&route).await?;

        metrics::counter!("survey.routes.created").increment(1);
        info!(buckets = route.bucket_keys.len(), "Route created");
        Ok(route)
    }

    /// Routes owned by a user, newest first
    pub async fn list_user_routes(&self, user_id: &str) -> Result<Vec<Route>> {
        let query = KeyQuery::partition(keys::user_routes_partition(user_id))
            .with_prefix(keys::member_prefix(ROUTE_PREFIX));
        let refs = self.kv.query_all(Table::Organization, &query).await?;

        let mut routes = Vec::with_capacity(refs.len());
        for item in &refs {
            let key = ItemKey::of(item)?;
            let Some(route_id) = keys::member_id(ROUTE_PREFIX, &key.sk) else {
                continue;
            };
            match self.get_route(route_id).await? {
                Some(route) => routes.push(route),
                None => warn!(user_id, route_id, "Dangling user route reference"),
            }
        }

        routes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(routes)
    }

    /// Delete a route with all of its readings. Returns false if it did not
    /// exist.
    #[instrument(skip(self))]
    pub async fn delete_route(&self, route_id: &str) -> Result<bool> {
        let Some(route) = self.get_route(route_id).await? else {
            return Ok(false);
        };

        let readings = self.readings_in_buckets(&route).await?;
        let keys = readings.iter().map(StoredReading::item_key).collect();
        self.kv.batch_delete(Table::Readings, keys).await?;

        self.kv
            .delete_item(
                Table::Organization,
                &OrgKey::UserRoute {
                    user_id: &route.user_id,
                    route_id,
                }
                .item_key(),
            )
            .await?;
        self.kv
            .delete_item(Table::Organization, &OrgKey::Route { route_id }.item_key())
            .await?;

        info!(readings = readings.len(), "Route deleted");
        Ok(true)
    }

    // ---- readings ----

    /// Bulk write; batching limits are the key-value store's concern
    #[instrument(skip(self, readings), fields(count = readings.len()))]
    pub async fn put_readings(&self, readings: &[Reading]) -> Result<()> {
        let items = readings
            .iter()
            .map(codec::encode)
            .collect::<Result<Vec<_>>>()?;
        self.kv.batch_write(Table::Readings, items).await?;

        metrics::counter!("survey.readings.written").increment(readings.len() as u64);
        Ok(())
    }

    /// Point lookup of a reading within a known bucket; absence is an error
    pub async fn get_reading(
        &self,
        partition_key: &str,
        reading_type: ReadingType,
        reading_id: &str,
    ) -> Result<Reading> {
        let key = ItemKey::new(partition_key, keys::reading_sort_key(reading_type, reading_id));
        let item = self
            .kv
            .get_item(Table::Readings, &key)
            .await?
            .ok_or_else(|| {
                StorageError::not_found(format!("reading {reading_id} in {partition_key}"))
            })?;
        codec::decode(reading_type.as_str(), &item)
    }

    /// Delete readings by the keys they were encoded with. Readings decoded
    /// from the store go through [`StoredReading::item_key`] instead.
    pub async fn delete_reading_items(&self, readings: &[Reading]) -> Result<()> {
        let keys = readings.iter().map(keys::reading_item_key).collect();
        self.kv.batch_delete(Table::Readings, keys).await
    }

    /// All readings of a route in timestamp order. Empty if the route does
    /// not exist.
    #[instrument(skip(self))]
    pub async fn get_route_readings(&self, route_id: &str) -> Result<Vec<Reading>> {
        Ok(self
            .get_route_stored_readings(route_id)
            .await?
            .into_iter()
            .map(|stored| stored.reading)
            .collect())
    }

    /// Like [`Self::get_route_readings`], with each reading's stored partition
    #[instrument(skip(self))]
    pub async fn get_route_stored_readings(&self, route_id: &str) -> Result<Vec<StoredReading>> {
        match self.get_route(route_id).await? {
            Some(route) => self.readings_in_buckets(&route).await,
            None => {
                debug!("Route not found");
                Ok(Vec::new())
            }
        }
    }

    /// Query the route's cached buckets, keeping only its own readings
    async fn readings_in_buckets(&self, route: &Route) -> Result<Vec<StoredReading>> {
        let mut readings = Vec::new();

        for bucket_key in &route.bucket_keys {
            let items = self
                .kv
                .query_all(Table::Readings, &KeyQuery::partition(bucket_key))
                .await?;
            for item in &items {
                let stored = codec::decode_stored(item)?;
                if stored.reading.route_id == route.route_id {
                    readings.push(stored);
                }
            }
        }

        readings.sort_by_key(|s| s.reading.timestamp);
        Ok(readings)
    }

    /// One native page of a bucket, optionally restricted to one reading type.
    /// Loop while the returned key is `Some` for the full result.
    pub async fn query_readings_page(
        &self,
        bucket_key: &str,
        reading_type: Option<ReadingType>,
        start: Option<Item>,
        limit: Option<usize>,
    ) -> Result<(Vec<Reading>, Option<Item>)> {
        let mut query = KeyQuery::partition(bucket_key);
        if let Some(reading_type) = reading_type {
            query = query.with_prefix(keys::member_prefix(reading_type.as_str()));
        }
        if let Some(limit) = limit {
            query = query.with_limit(limit);
        }

        let page = self.kv.query(Table::Readings, &query, start).await?;
        let readings = page
            .items
            .iter()
            .map(codec::decode_item)
            .collect::<Result<Vec<_>>>()?;
        Ok((readings, page.next))
    }

    /// Return the payload inline, or write it to the object store when its
    /// serialized form exceeds the inline limit
    #[instrument(skip(self, payload))]
    pub async fn bound_payload<T: Serialize + Send>(&self, payload: T) -> Result<Bounded<T>> {
        let body = serde_json::to_vec(&payload)?;
        if body.len() <= self.limits.max_inline_payload_bytes {
            return Ok(Bounded::Inline { data: payload });
        }

        let key = format!("{}/{}.json", self.limits.offload_prefix, Uuid::new_v4());
        let size_bytes = body.len();
        let locator = self
            .objects
            .upload(UploadSource::Bytes(Bytes::from(body)), &key)
            .await?;

        metrics::counter!("survey.payloads.offloaded").increment(1);
        info!(size_bytes, locator = %locator, "Payload offloaded");
        Ok(Bounded::Offloaded {
            bucket: locator.bucket,
            key: locator.key,
        })
    }

    /// All readings of a route, size-bounded
    pub async fn get_route_readings_bounded(&self, route_id: &str) -> Result<Bounded<Vec<Reading>>> {
        let readings = self.get_route_readings(route_id).await?;
        self.bound_payload(readings).await
    }

    // ---- organizational hierarchy ----

    pub async fn put_organization(&self, org: &Organization) -> Result<()> {
        self.kv.put_item(Table::Organization, org.to_item()).await
    }

    pub async fn get_organization(&self, org_id: &str) -> Result<Option<Organization>> {
        self.get_entity(OrgKey::Organization { org_id }, Organization::from_item)
            .await
    }

    pub async fn delete_organization(&self, org_id: &str) -> Result<()> {
        self.delete_entity(OrgKey::Organization { org_id }).await
    }

    pub async fn put_group(&self, group: &AccessGroup) -> Result<()> {
        self.kv.put_item(Table::Organization, group.to_item()).await
    }

    pub async fn get_group(&self, org_id: &str, group_id: &str) -> Result<Option<AccessGroup>> {
        self.get_entity(OrgKey::OrgGroup { org_id, group_id }, AccessGroup::from_item)
            .await
    }

    pub async fn delete_group(&self, org_id: &str, group_id: &str) -> Result<()> {
        self.delete_entity(OrgKey::OrgGroup { org_id, group_id })
            .await
    }

    pub async fn list_groups(&self, org_id: &str) -> Result<Vec<AccessGroup>> {
        let query = KeyQuery::partition(keys::org_groups_partition(org_id))
            .with_prefix(keys::member_prefix(GROUP_PREFIX));
        self.kv
            .query_all(Table::Organization, &query)
            .await?
            .iter()
            .map(AccessGroup::from_item)
            .collect()
    }

    pub async fn put_layer(&self, layer: &Layer) -> Result<()> {
        self.kv.put_item(Table::Organization, layer.to_item()).await
    }

    pub async fn get_layer(&self, group_id: &str, layer_id: &str) -> Result<Option<Layer>> {
        self.get_entity(OrgKey::GroupLayer { group_id, layer_id }, Layer::from_item)
            .await
    }

    pub async fn delete_layer(&self, group_id: &str, layer_id: &str) -> Result<()> {
        self.delete_entity(OrgKey::GroupLayer { group_id, layer_id })
            .await
    }

    pub async fn list_layers(&self, group_id: &str) -> Result<Vec<Layer>> {
        let query = KeyQuery::partition(keys::group_layers_partition(group_id))
            .with_prefix(keys::member_prefix(LAYER_PREFIX));
        self.kv
            .query_all(Table::Organization, &query)
            .await?
            .iter()
            .map(Layer::from_item)
            .collect()
    }

    /// Read-modify-write merge into an existing layer. Concurrent updates to
    /// the same layer are last-writer-wins.
    #[instrument(skip(self, refs), fields(count = refs.len()))]
    pub async fn add_readings_to_layer(
        &self,
        group_id: &str,
        layer_id: &str,
        refs: Vec<ReadingRef>,
    ) -> Result<Layer> {
        let mut layer = self
            .get_layer(group_id, layer_id)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("layer {layer_id} in group {group_id}")))?;

        layer.merge_readings(refs);
        self.put_layer(&layer).await?;

        debug!(total = layer.readings.len(), "Layer updated");
        Ok(layer)
    }

    /// Replace the user's group memberships
    pub async fn put_user(&self, user: &User) -> Result<()> {
        self.delete_user(&user.user_id).await?;
        self.kv
            .batch_write(Table::Organization, user.membership_items())
            .await
    }

    /// A user exists while they belong to at least one group
    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let memberships = self.membership_items(user_id).await?;
        if memberships.is_empty() {
            return Ok(None);
        }

        let group_ids = memberships
            .iter()
            .map(User::group_id_of)
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(User {
            user_id: user_id.to_string(),
            group_ids,
        }))
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let keys = self
            .membership_items(user_id)
            .await?
            .iter()
            .map(ItemKey::of)
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            return Ok(());
        }
        self.kv.batch_delete(Table::Organization, keys).await
    }

    async fn membership_items(&self, user_id: &str) -> Result<Vec<Item>> {
        let query = KeyQuery::partition(keys::user_groups_partition(user_id))
            .with_prefix(keys::member_prefix(GROUP_PREFIX));
        self.kv.query_all(Table::Organization, &query).await
    }

    async fn get_entity<T>(
        &self,
        key: OrgKey<'_>,
        from_item: impl Fn(&Item) -> Result<T>,
    ) -> Result<Option<T>> {
        self.kv
            .get_item(Table::Organization, &key.item_key())
            .await?
            .map(|item| from_item(&item))
            .transpose()
    }

    async fn delete_entity(&self, key: OrgKey<'_>) -> Result<()> {
        self.kv
            .delete_item(Table::Organization, &key.item_key())
            .await
    }
}

/// Current time at the millisecond precision items are stored with
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::object_store::MemoryObjectStore;
    use crate::reading::{Coordinate, ImageRef, ObjectLocator, Prediction, ReadingData};

    fn prediction(id: &str, route_id: &str, timestamp: i64, lat: f64, lng: f64) -> Reading {
        Reading {
            reading_id: id.to_string(),
            route_id: route_id.to_string(),
            timestamp,
            data: ReadingData::Prediction(Prediction {
                position: Coordinate::new(lat, lng),
                image: ImageRef::Stored(ObjectLocator::new("images", format!("{id}.jpg"))),
                entities: Vec::new(),
                annotation_timestamp: 0,
                annotator_id: "automated".to_string(),
            }),
        }
    }

    fn store_with(kv: Arc<MemoryStore>, objects: Arc<MemoryObjectStore>) -> SurveyStore {
        SurveyStore::new(kv, objects, LimitsConfig::default())
    }

    fn store() -> SurveyStore {
        store_with(
            Arc::new(MemoryStore::with_page_size(3)),
            Arc::new(MemoryObjectStore::new("images")),
        )
    }

    fn spec(route_id: &str, readings: Vec<Reading>) -> RouteSpec {
        RouteSpec {
            route_id: route_id.to_string(),
            user_id: "user-1".to_string(),
            name: None,
            readings,
        }
    }

    #[tokio::test]
    async fn test_create_route_and_read_back() {
        let store = store();
        let readings: Vec<_> = (0..10)
            .map(|i| prediction(&format!("p{i}"), "route-1", 1000 - i, -27.47 + i as f64 * 0.004, 153.02))
            .collect();

        let route = store.create_route(spec("route-1", readings)).await.unwrap();
        assert_eq!(route.status, RouteStatus::Uploaded);
        assert_eq!(route.name, "route-1");
        assert!(route.bucket_keys.len() > 1);
        assert_eq!(route.sample_data[&ReadingType::Prediction].reading_id, "p9");

        let fetched = store.get_route("route-1").await.unwrap().unwrap();
        assert_eq!(fetched.bucket_keys, route.bucket_keys);

        let back = store.get_route_readings("route-1").await.unwrap();
        assert_eq!(back.len(), 10);
        assert!(back.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_stored_partition_survives_rounding_at_grid_edge() {
        let store = store();
        // rounds up to 0.31 at codec precision but belongs to the 0.30 cell
        let reading = prediction("edge", "route-1", 1, 0.309_999_999_999_995, 153.0);
        let original = reading.reference();
        assert_eq!(original.partition_key, "GEO#0.30#153.00");

        store.create_route(spec("route-1", vec![reading])).await.unwrap();

        let stored = store.get_route_stored_readings("route-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].reference(), original);
        assert!(store
            .get_reading(&stored[0].partition_key, ReadingType::Prediction, "edge")
            .await
            .is_ok());

        assert!(store.delete_route("route-1").await.unwrap());
        let left = store
            .kv
            .query_all(Table::Readings, &KeyQuery::partition(&original.partition_key))
            .await
            .unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn test_route_readings_filter_colocated_routes() {
        let store = store();
        store
            .create_route(spec("a", vec![prediction("a1", "a", 1, 10.0, 10.0)]))
            .await
            .unwrap();
        store
            .create_route(spec("b", vec![prediction("b1", "b", 2, 10.0, 10.0)]))
            .await
            .unwrap();

        let readings = store.get_route_readings("a").await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].route_id, "a");
    }

    #[tokio::test]
    async fn test_missing_route_is_empty_not_error() {
        let store = store();
        assert!(store.get_route("nope").await.unwrap().is_none());
        assert!(store.get_route_readings("nope").await.unwrap().is_empty());
        assert!(!store.delete_route("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_route_rejects_bad_specs() {
        let store = store();
        assert!(matches!(
            store.create_route(spec("r", Vec::new())).await,
            Err(StorageError::PreconditionViolation(_))
        ));

        let dup = vec![prediction("x", "r", 1, 0.0, 0.0), prediction("x", "r", 2, 0.0, 0.0)];
        assert!(matches!(
            store.create_route(spec("r", dup)).await,
            Err(StorageError::PreconditionViolation(_))
        ));

        let foreign = vec![prediction("x", "other", 1, 0.0, 0.0)];
        assert!(store.create_route(spec("r", foreign)).await.is_err());
        assert!(store.get_route("r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_transitions_only_move_forward() {
        let store = store();
        store
            .create_route(spec("r", vec![prediction("p", "r", 1, 0.0, 0.0)]))
            .await
            .unwrap();

        let predicting = store
            .set_route_status("r", RouteStatus::Predicting)
            .await
            .unwrap();
        let again = store
            .set_route_status("r", RouteStatus::Predicting)
            .await
            .unwrap();
        assert_eq!(again.updated_at, predicting.updated_at);

        assert!(matches!(
            store.set_route_status("r", RouteStatus::Uploaded).await,
            Err(StorageError::InvalidTransition { .. })
        ));

        let complete = store
            .set_route_status("r", RouteStatus::Complete)
            .await
            .unwrap();
        assert_eq!(complete.status, RouteStatus::Complete);
    }

    #[tokio::test]
    async fn test_rename_and_list_user_routes() {
        let store = store();
        for id in ["r1", "r2"] {
            store
                .create_route(spec(id, vec![prediction(&format!("{id}-p"), id, 1, 0.0, 0.0)]))
                .await
                .unwrap();
        }

        store.update_route_name("r1", "Main St").await.unwrap();
        assert!(store.update_route_name("r1", "  ").await.is_err());
        assert!(matches!(
            store.update_route_name("missing", "x").await,
            Err(StorageError::NotFound(_))
        ));

        let routes = store.list_user_routes("user-1").await.unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().any(|r| r.name == "Main St"));
        assert!(store.list_user_routes("user-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_route_removes_readings() {
        let kv = Arc::new(MemoryStore::new());
        let store = store_with(kv.clone(), Arc::new(MemoryObjectStore::new("images")));
        store
            .create_route(spec(
                "r",
                vec![prediction("p1", "r", 1, 0.0, 0.0), prediction("p2", "r", 2, 5.0, 5.0)],
            ))
            .await
            .unwrap();
        assert_eq!(kv.len(Table::Readings), 2);

        let deleted = tokio_test::assert_ok!(store.delete_route("r").await);
        assert!(deleted);
        assert!(kv.is_empty(Table::Readings));
        assert!(kv.is_empty(Table::Organization));
    }

    #[tokio::test]
    async fn test_get_reading_requires_existence() {
        let store = store();
        let reading = prediction("p1", "r", 1, 1.0, 1.0);
        store.put_readings(&[reading.clone()]).await.unwrap();

        let pk = keys::reading_partition_key(&reading);
        let found = store
            .get_reading(&pk, ReadingType::Prediction, "p1")
            .await
            .unwrap();
        assert_eq!(found.reading_id, "p1");

        assert!(matches!(
            store.get_reading(&pk, ReadingType::Prediction, "p2").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_paginated_query_loops_to_completion() {
        let store = store();
        let readings: Vec<_> = (0..8)
            .map(|i| prediction(&format!("p{i}"), "r", i, 1.0, 1.0))
            .collect();
        store.put_readings(&readings).await.unwrap();
        store
            .put_readings(&[Reading::position("pos", "r", 1, Coordinate::new(1.0, 1.0))])
            .await
            .unwrap();

        let bucket = keys::spatial_bucket(Coordinate::new(1.0, 1.0));
        let mut collected = Vec::new();
        let mut start = None;
        let mut pages = 0;
        loop {
            let (page, next) = store
                .query_readings_page(&bucket, Some(ReadingType::Prediction), start, None)
                .await
                .unwrap();
            collected.extend(page);
            pages += 1;
            match next {
                Some(next) => start = Some(next),
                None => break,
            }
        }

        assert_eq!(collected.len(), 8);
        assert!(pages >= 3);
        assert!(collected
            .iter()
            .all(|r| r.reading_type() == ReadingType::Prediction));
    }

    #[tokio::test]
    async fn test_bounded_payload_offloads_when_too_large() {
        let objects = Arc::new(MemoryObjectStore::new("images"));
        let store = SurveyStore::new(
            Arc::new(MemoryStore::new()),
            objects.clone(),
            LimitsConfig {
                max_inline_payload_bytes: 64,
                offload_prefix: "query-results".to_string(),
            },
        );

        let small = store.bound_payload(vec![1, 2, 3]).await.unwrap();
        assert_eq!(small, Bounded::Inline { data: vec![1, 2, 3] });

        let large = store.bound_payload(vec![0u32; 100]).await.unwrap();
        let Bounded::Offloaded { bucket, key } = large else {
            panic!("expected offloaded payload");
        };
        assert_eq!(bucket, "images");
        assert!(key.starts_with("query-results/"));
        assert!(objects.contains(&ObjectLocator::new(bucket, key)));
    }

    #[tokio::test]
    async fn test_org_hierarchy_crud() {
        let store = store();
        let org = Organization {
            org_id: "acme".to_string(),
            name: "Acme Roads".to_string(),
            default_group_id: "g1".to_string(),
        };
        store.put_organization(&org).await.unwrap();
        assert_eq!(store.get_organization("acme").await.unwrap(), Some(org));

        for group_id in ["g1", "g2"] {
            store
                .put_group(&AccessGroup {
                    org_id: "acme".to_string(),
                    group_id: group_id.to_string(),
                    name: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.list_groups("acme").await.unwrap().len(), 2);
        store.delete_group("acme", "g2").await.unwrap();
        assert!(store.get_group("acme", "g2").await.unwrap().is_none());

        let user = User {
            user_id: "u1".to_string(),
            group_ids: vec!["g1".to_string()],
        };
        store.put_user(&user).await.unwrap();
        assert_eq!(store.get_user("u1").await.unwrap(), Some(user));
        store.delete_user("u1").await.unwrap();
        assert!(store.get_user("u1").await.unwrap().is_none());

        store.delete_organization("acme").await.unwrap();
        assert!(store.get_organization("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_readings_to_layer() {
        let store = store();
        store
            .put_layer(&Layer {
                group_id: "g1".to_string(),
                layer_id: "potholes".to_string(),
                name: Some("Potholes".to_string()),
                readings: Vec::new(),
            })
            .await
            .unwrap();

        let a = prediction("a", "r", 1, 1.0, 1.0).reference();
        let b = prediction("b", "r", 2, 2.0, 2.0).reference();
        store
            .add_readings_to_layer("g1", "potholes", vec![a.clone(), b.clone()])
            .await
            .unwrap();
        let layer = store
            .add_readings_to_layer("g1", "potholes", vec![a.clone()])
            .await
            .unwrap();
        assert_eq!(layer.readings, vec![a, b]);
        assert_eq!(store.list_layers("g1").await.unwrap().len(), 1);

        assert!(matches!(
            store.add_readings_to_layer("g1", "missing", Vec::new()).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
