//! Routes and the organizational hierarchy, with their item mappings.

use crate::codec::{self, get_attr, get_int, get_str};
use crate::error::{Result, StorageError};
use crate::keys::OrgKey;
use crate::kv::{AttrValue, Item};
use crate::reading::{Reading, ReadingRef, ReadingType};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Longest generated default route name
pub const DEFAULT_NAME_LEN: usize = 21;

const ATTR_USER_ID: &str = "user_id";
const ATTR_NAME: &str = "name";
const ATTR_STATUS: &str = "status";
const ATTR_CREATED_AT: &str = "created_at";
const ATTR_UPDATED_AT: &str = "updated_at";
const ATTR_SAMPLE_DATA: &str = "sample_data";
const ATTR_BUCKET_KEYS: &str = "bucket_keys";
const ATTR_ORG_ID: &str = "org_id";
const ATTR_GROUP_ID: &str = "group_id";
const ATTR_LAYER_ID: &str = "layer_id";
const ATTR_DEFAULT_GROUP_ID: &str = "default_group_id";
const ATTR_READINGS: &str = "readings";
const ATTR_PARTITION_KEY: &str = "partition_key";

/// Route lifecycle; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Uploaded,
    Predicting,
    Complete,
}

impl RouteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStatus::Uploaded => "uploaded",
            RouteStatus::Predicting => "predicting",
            RouteStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uploaded" => Ok(RouteStatus::Uploaded),
            "predicting" => Ok(RouteStatus::Predicting),
            "complete" => Ok(RouteStatus::Complete),
            other => Err(StorageError::malformed(format!("unknown route status {other}"))),
        }
    }
}

/// One survey run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub route_id: String,
    pub user_id: String,
    pub name: String,
    pub status: RouteStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// One representative reading per type, for previews
    pub sample_data: BTreeMap<ReadingType, Reading>,
    /// Spatial buckets holding this route's readings
    pub bucket_keys: BTreeSet<String>,
}

impl Route {
    pub fn to_item(&self) -> Result<Item> {
        let mut item = OrgKey::Route {
            route_id: &self.route_id,
        }
        .item_key()
        .to_item();

        let sample_data = self
            .sample_data
            .iter()
            .map(|(reading_type, reading)| {
                Ok((
                    reading_type.as_str().to_string(),
                    AttrValue::M(codec::encode_fields(reading)?),
                ))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        item.extend([
            (codec::ATTR_ROUTE_ID.to_string(), AttrValue::S(self.route_id.clone())),
            (ATTR_USER_ID.to_string(), AttrValue::S(self.user_id.clone())),
            (ATTR_NAME.to_string(), AttrValue::S(self.name.clone())),
            (ATTR_STATUS.to_string(), AttrValue::S(self.status.as_str().to_string())),
            (ATTR_CREATED_AT.to_string(), millis(self.created_at)),
            (ATTR_UPDATED_AT.to_string(), millis(self.updated_at)),
            (ATTR_SAMPLE_DATA.to_string(), AttrValue::M(sample_data)),
            (
                ATTR_BUCKET_KEYS.to_string(),
                AttrValue::L(self.bucket_keys.iter().cloned().map(AttrValue::S).collect()),
            ),
        ]);
        Ok(item)
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        let sample_data = get_attr(item, ATTR_SAMPLE_DATA)?
            .as_m()
            .ok_or_else(|| StorageError::malformed("sample_data is not a map"))?
            .iter()
            .map(|(reading_type, fields)| {
                let fields = fields
                    .as_m()
                    .ok_or_else(|| StorageError::malformed("sample reading is not a map"))?;
                let reading = codec::decode(reading_type, fields)?;
                Ok((reading.reading_type(), reading))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let bucket_keys = get_attr(item, ATTR_BUCKET_KEYS)?
            .as_l()
            .ok_or_else(|| StorageError::malformed("bucket_keys is not a list"))?
            .iter()
            .map(|key| {
                key.as_s()
                    .map(String::from)
                    .ok_or_else(|| StorageError::malformed("bucket key is not a string"))
            })
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(Self {
            route_id: get_str(item, codec::ATTR_ROUTE_ID)?.to_string(),
            user_id: get_str(item, ATTR_USER_ID)?.to_string(),
            name: get_str(item, ATTR_NAME)?.to_string(),
            status: get_str(item, ATTR_STATUS)?.parse()?,
            created_at: get_time(item, ATTR_CREATED_AT)?,
            updated_at: get_time(item, ATTR_UPDATED_AT)?,
            sample_data,
            bucket_keys,
        })
    }

    /// Pointer item in the owner's route partition
    pub fn user_ref_item(&self) -> Item {
        let mut item = OrgKey::UserRoute {
            user_id: &self.user_id,
            route_id: &self.route_id,
        }
        .item_key()
        .to_item();
        item.insert(
            codec::ATTR_ROUTE_ID.to_string(),
            AttrValue::S(self.route_id.clone()),
        );
        item.insert(ATTR_CREATED_AT.to_string(), millis(self.created_at));
        item
    }
}

/// Default display name: the route id, truncated
pub fn default_route_name(route_id: &str) -> String {
    route_id.chars().take(DEFAULT_NAME_LEN).collect()
}

/// Everything needed to create a route from one ingestion run
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub route_id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub readings: Vec<Reading>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: String,
    pub name: String,
    pub default_group_id: String,
}

impl Organization {
    pub fn to_item(&self) -> Item {
        let mut item = OrgKey::Organization {
            org_id: &self.org_id,
        }
        .item_key()
        .to_item();
        item.extend([
            (ATTR_ORG_ID.to_string(), AttrValue::S(self.org_id.clone())),
            (ATTR_NAME.to_string(), AttrValue::S(self.name.clone())),
            (
                ATTR_DEFAULT_GROUP_ID.to_string(),
                AttrValue::S(self.default_group_id.clone()),
            ),
        ]);
        item
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        Ok(Self {
            org_id: get_str(item, ATTR_ORG_ID)?.to_string(),
            name: get_str(item, ATTR_NAME)?.to_string(),
            default_group_id: get_str(item, ATTR_DEFAULT_GROUP_ID)?.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGroup {
    pub org_id: String,
    pub group_id: String,
    pub name: Option<String>,
}

impl AccessGroup {
    pub fn to_item(&self) -> Item {
        let mut item = OrgKey::OrgGroup {
            org_id: &self.org_id,
            group_id: &self.group_id,
        }
        .item_key()
        .to_item();
        item.insert(ATTR_ORG_ID.to_string(), AttrValue::S(self.org_id.clone()));
        item.insert(ATTR_GROUP_ID.to_string(), AttrValue::S(self.group_id.clone()));
        if let Some(ref name) = self.name {
            item.insert(ATTR_NAME.to_string(), AttrValue::S(name.clone()));
        }
        item
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        Ok(Self {
            org_id: get_str(item, ATTR_ORG_ID)?.to_string(),
            group_id: get_str(item, ATTR_GROUP_ID)?.to_string(),
            name: optional_str(item, ATTR_NAME),
        })
    }
}

/// Named, mutable collection of reading references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub group_id: String,
    pub layer_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub readings: Vec<ReadingRef>,
}

impl Layer {
    pub fn to_item(&self) -> Item {
        let mut item = OrgKey::GroupLayer {
            group_id: &self.group_id,
            layer_id: &self.layer_id,
        }
        .item_key()
        .to_item();

        let readings = self
            .readings
            .iter()
            .map(|r| {
                AttrValue::M(HashMap::from([
                    (
                        codec::ATTR_READING_ID.to_string(),
                        AttrValue::S(r.reading_id.clone()),
                    ),
                    (
                        ATTR_PARTITION_KEY.to_string(),
                        AttrValue::S(r.partition_key.clone()),
                    ),
                ]))
            })
            .collect();

        item.insert(ATTR_GROUP_ID.to_string(), AttrValue::S(self.group_id.clone()));
        item.insert(ATTR_LAYER_ID.to_string(), AttrValue::S(self.layer_id.clone()));
        item.insert(ATTR_READINGS.to_string(), AttrValue::L(readings));
        if let Some(ref name) = self.name {
            item.insert(ATTR_NAME.to_string(), AttrValue::S(name.clone()));
        }
        item
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        let readings = match item.get(ATTR_READINGS) {
            Some(value) => value
                .as_l()
                .ok_or_else(|| StorageError::malformed("layer readings is not a list"))?
                .iter()
                .map(|entry| {
                    let map = entry
                        .as_m()
                        .ok_or_else(|| StorageError::malformed("reading reference is not a map"))?;
                    Ok(ReadingRef {
                        reading_id: get_str(map, codec::ATTR_READING_ID)?.to_string(),
                        partition_key: get_str(map, ATTR_PARTITION_KEY)?.to_string(),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            group_id: get_str(item, ATTR_GROUP_ID)?.to_string(),
            layer_id: get_str(item, ATTR_LAYER_ID)?.to_string(),
            name: optional_str(item, ATTR_NAME),
            readings,
        })
    }

    /// Merge references, deduplicated by reading id. Existing order is kept;
    /// a repeated id takes the newest partition key.
    pub fn merge_readings(&mut self, refs: impl IntoIterator<Item = ReadingRef>) {
        let mut index: HashMap<String, usize> = self
            .readings
            .iter()
            .enumerate()
            .map(|(i, r)| (r.reading_id.clone(), i))
            .collect();

        for reading_ref in refs {
            match index.get(&reading_ref.reading_id) {
                Some(&i) => self.readings[i] = reading_ref,
                None => {
                    index.insert(reading_ref.reading_id.clone(), self.readings.len());
                    self.readings.push(reading_ref);
                }
            }
        }
    }
}

/// A user and the access groups they belong to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub group_ids: Vec<String>,
}

impl User {
    /// One membership item per group
    pub fn membership_items(&self) -> Vec<Item> {
        self.group_ids
            .iter()
            .map(|group_id| {
                let mut item = OrgKey::UserGroup {
                    user_id: &self.user_id,
                    group_id,
                }
                .item_key()
                .to_item();
                item.insert(ATTR_USER_ID.to_string(), AttrValue::S(self.user_id.clone()));
                item.insert(ATTR_GROUP_ID.to_string(), AttrValue::S(group_id.clone()));
                item
            })
            .collect()
    }

    pub fn group_id_of(item: &Item) -> Result<String> {
        get_str(item, ATTR_GROUP_ID).map(String::from)
    }
}

/// Either the payload itself or where it was written instead
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Bounded<T> {
    Inline { data: T },
    Offloaded { bucket: String, key: String },
}

fn millis(time: DateTime<Utc>) -> AttrValue {
    AttrValue::N(time.timestamp_millis().to_string())
}

fn get_time(item: &Item, name: &str) -> Result<DateTime<Utc>> {
    let ms = get_int(item, name)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::malformed(format!("attribute {name} is out of range: {ms}")))
}

fn optional_str(item: &Item, name: &str) -> Option<String> {
    item.get(name).and_then(AttrValue::as_s).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{ATTR_PK, ATTR_SK};
    use crate::reading::{Coordinate, ImageRef, ObjectLocator};

    fn route() -> Route {
        let now = Utc.timestamp_millis_opt(1_618_093_102_123).unwrap();
        let reading = Reading::image(
            "img-1",
            "route-1",
            1_618_093_102_123,
            ImageRef::Stored(ObjectLocator::new("bucket", "routes/route-1/a.jpg")),
        );
        let position = Reading::position("pos-1", "route-1", 5, Coordinate::new(-27.5, 153.0));
        Route {
            route_id: "route-1".to_string(),
            user_id: "user-1".to_string(),
            name: "Morning run".to_string(),
            status: RouteStatus::Predicting,
            created_at: now,
            updated_at: now,
            sample_data: BTreeMap::from([
                (ReadingType::Image, reading),
                (ReadingType::Position, position),
            ]),
            bucket_keys: BTreeSet::from(["GEO#-27.50#153.00".to_string()]),
        }
    }

    #[test]
    fn test_status_order() {
        assert!(RouteStatus::Uploaded < RouteStatus::Predicting);
        assert!(RouteStatus::Predicting < RouteStatus::Complete);
        assert_eq!("complete".parse::<RouteStatus>().unwrap(), RouteStatus::Complete);
        assert!("archived".parse::<RouteStatus>().is_err());
    }

    #[test]
    fn test_route_item_round_trip() {
        let route = route();
        let item = route.to_item().unwrap();
        assert_eq!(item[ATTR_PK], AttrValue::S("Routes".to_string()));
        assert_eq!(item[ATTR_SK], AttrValue::S("Route#route-1".to_string()));
        assert_eq!(Route::from_item(&item).unwrap(), route);

        let reference = route.user_ref_item();
        assert_eq!(reference[ATTR_PK], AttrValue::S("User#user-1#Routes".to_string()));
    }

    #[test]
    fn test_default_route_name_truncates() {
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        assert_eq!(default_route_name(id), "0f8fad5b-d9cb-469f-a");
        assert_eq!(default_route_name(id).len(), DEFAULT_NAME_LEN);
        assert_eq!(default_route_name("short"), "short");
    }

    #[test]
    fn test_layer_merge_dedups_last_write_wins() {
        let r = |id: &str, pk: &str| ReadingRef {
            reading_id: id.to_string(),
            partition_key: pk.to_string(),
        };
        let mut layer = Layer {
            group_id: "g".to_string(),
            layer_id: "l".to_string(),
            name: None,
            readings: vec![r("a", "GEO#1"), r("b", "GEO#1")],
        };

        layer.merge_readings([r("b", "GEO#2"), r("c", "GEO#3"), r("c", "GEO#4")]);

        assert_eq!(
            layer.readings,
            vec![r("a", "GEO#1"), r("b", "GEO#2"), r("c", "GEO#4")]
        );
        assert_eq!(Layer::from_item(&layer.to_item()).unwrap(), layer);
    }

    #[test]
    fn test_user_membership_items() {
        let user = User {
            user_id: "u".to_string(),
            group_ids: vec!["g1".to_string(), "g2".to_string()],
        };
        let items = user.membership_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1][ATTR_SK], AttrValue::S("Group#g2".to_string()));
        assert_eq!(User::group_id_of(&items[0]).unwrap(), "g1");
    }
}
