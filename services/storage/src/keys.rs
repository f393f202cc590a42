//! Key scheme for both tables.
//!
//! ## Organization table
//!
//! Adjacency-list layout: the partition key names an entity *class* ("this
//! group's layers", "this user's groups") and the sort key names one member,
//! always `<EntityPrefix>#<id>`.
//!
//! ```text
//! pk                          sk                   entity
//! Orgs                        Org#<org>            organization
//! Org#<org>#Groups            Group#<group>        access group
//! Group#<group>#Layers        Layer#<layer>        layer
//! User#<user>#Groups          Group#<group>        group membership
//! Routes                      Route#<route>        route record
//! User#<user>#Routes          Route#<route>        route ownership ref
//! ```
//!
//! ## Readings table
//!
//! Partitioned by a spatial bucket so one partition query returns everything
//! recorded near a location; sorted by `<reading_type>#<reading_id>` so the
//! same query can be narrowed to one type by prefix.

use crate::kv::ItemKey;
use crate::reading::{Coordinate, Reading, ReadingType};

pub const SEPARATOR: char = '#';

/// Grid cell size of a spatial bucket, in degrees
pub const BUCKET_CELL_DEGREES: f64 = 0.01;

/// Bucket for readings that carry no location
pub const UNLOCATED_BUCKET: &str = "GEO#unlocated";

/// Organization-table key for one entity class member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrgKey<'a> {
    Organization { org_id: &'a str },
    OrgGroup { org_id: &'a str, group_id: &'a str },
    GroupLayer { group_id: &'a str, layer_id: &'a str },
    UserGroup { user_id: &'a str, group_id: &'a str },
    Route { route_id: &'a str },
    UserRoute { user_id: &'a str, route_id: &'a str },
}

impl<'a> OrgKey<'a> {
    /// Partition key: the entity class
    pub fn partition(&self) -> String {
        match self {
            OrgKey::Organization { .. } => ORGS_PARTITION.to_string(),
            OrgKey::OrgGroup { org_id, .. } => org_groups_partition(org_id),
            OrgKey::GroupLayer { group_id, .. } => group_layers_partition(group_id),
            OrgKey::UserGroup { user_id, .. } => user_groups_partition(user_id),
            OrgKey::Route { .. } => ROUTES_PARTITION.to_string(),
            OrgKey::UserRoute { user_id, .. } => user_routes_partition(user_id),
        }
    }

    /// Sort key: the member
    pub fn sort(&self) -> String {
        match self {
            OrgKey::Organization { org_id } => member(ORG_PREFIX, org_id),
            OrgKey::OrgGroup { group_id, .. } | OrgKey::UserGroup { group_id, .. } => {
                member(GROUP_PREFIX, group_id)
            }
            OrgKey::GroupLayer { layer_id, .. } => member(LAYER_PREFIX, layer_id),
            OrgKey::Route { route_id } | OrgKey::UserRoute { route_id, .. } => {
                member(ROUTE_PREFIX, route_id)
            }
        }
    }

    pub fn item_key(&self) -> ItemKey {
        ItemKey::new(self.partition(), self.sort())
    }
}

pub const ORG_PREFIX: &str = "Org";
pub const GROUP_PREFIX: &str = "Group";
pub const LAYER_PREFIX: &str = "Layer";
pub const USER_PREFIX: &str = "User";
pub const ROUTE_PREFIX: &str = "Route";

const ORGS_PARTITION: &str = "Orgs";
const ROUTES_PARTITION: &str = "Routes";

/// `<prefix>#<id>`
pub fn member(prefix: &str, id: &str) -> String {
    format!("{prefix}{SEPARATOR}{id}")
}

/// Sort-key prefix matching every member of one class, e.g. `Layer#`
pub fn member_prefix(prefix: &str) -> String {
    format!("{prefix}{SEPARATOR}")
}

/// Strip `<prefix>#` from a sort key
pub fn member_id<'s>(prefix: &str, sort_key: &'s str) -> Option<&'s str> {
    sort_key
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
}

pub fn org_groups_partition(org_id: &str) -> String {
    format!("{}{SEPARATOR}Groups", member(ORG_PREFIX, org_id))
}

pub fn group_layers_partition(group_id: &str) -> String {
    format!("{}{SEPARATOR}Layers", member(GROUP_PREFIX, group_id))
}

pub fn user_groups_partition(user_id: &str) -> String {
    format!("{}{SEPARATOR}Groups", member(USER_PREFIX, user_id))
}

pub fn user_routes_partition(user_id: &str) -> String {
    format!("{}{SEPARATOR}Routes", member(USER_PREFIX, user_id))
}

/// Spatial bucket for a coordinate: both axes floored to the grid.
///
/// Flooring (rather than rounding) keeps every point of a cell in the same
/// bucket, including negative coordinates.
pub fn spatial_bucket(coordinate: Coordinate) -> String {
    let cell = |v: f64| (v / BUCKET_CELL_DEGREES).floor() * BUCKET_CELL_DEGREES;
    format!(
        "GEO{SEPARATOR}{:.2}{SEPARATOR}{:.2}",
        cell(coordinate.lat) + 0.0,
        cell(coordinate.lng) + 0.0
    )
}

/// Partition key of a reading
pub fn reading_partition_key(reading: &Reading) -> String {
    reading
        .coordinate()
        .map(spatial_bucket)
        .unwrap_or_else(|| UNLOCATED_BUCKET.to_string())
}

/// `<reading_type>#<reading_id>`
pub fn reading_sort_key(reading_type: ReadingType, reading_id: &str) -> String {
    member(reading_type.as_str(), reading_id)
}

pub fn reading_item_key(reading: &Reading) -> ItemKey {
    ItemKey::new(
        reading_partition_key(reading),
        reading_sort_key(reading.reading_type(), &reading.reading_id),
    )
}

/// Split a reading sort key back into its type and id
pub fn parse_reading_sort_key(sort_key: &str) -> Option<(&str, &str)> {
    sort_key.split_once(SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ImageRef;

    #[test]
    fn test_org_keys() {
        let cases = [
            (OrgKey::Organization { org_id: "acme" }, "Orgs", "Org#acme"),
            (
                OrgKey::OrgGroup {
                    org_id: "acme",
                    group_id: "g1",
                },
                "Org#acme#Groups",
                "Group#g1",
            ),
            (
                OrgKey::GroupLayer {
                    group_id: "g1",
                    layer_id: "l1",
                },
                "Group#g1#Layers",
                "Layer#l1",
            ),
            (
                OrgKey::UserGroup {
                    user_id: "u1",
                    group_id: "g1",
                },
                "User#u1#Groups",
                "Group#g1",
            ),
            (OrgKey::Route { route_id: "r1" }, "Routes", "Route#r1"),
            (
                OrgKey::UserRoute {
                    user_id: "u1",
                    route_id: "r1",
                },
                "User#u1#Routes",
                "Route#r1",
            ),
        ];

        for (key, pk, sk) in cases {
            assert_eq!(key.partition(), pk, "{key:?}");
            assert_eq!(key.sort(), sk, "{key:?}");
        }
    }

    #[test]
    fn test_member_id() {
        assert_eq!(member_id(GROUP_PREFIX, "Group#g-7"), Some("g-7"));
        assert_eq!(member_id(GROUP_PREFIX, "Layer#g-7"), None);
        assert_eq!(member_id(GROUP_PREFIX, "Groupg-7"), None);
    }

    #[test]
    fn test_spatial_bucket_floors_both_axes() {
        assert_eq!(
            spatial_bucket(Coordinate::new(-27.4789, 153.0281)),
            "GEO#-27.48#153.02"
        );
        assert_eq!(spatial_bucket(Coordinate::new(0.004, 0.0)), "GEO#0.00#0.00");
        assert_eq!(
            spatial_bucket(Coordinate::new(-0.004, -0.001)),
            "GEO#-0.01#-0.01"
        );
    }

    #[test]
    fn test_nearby_readings_share_a_bucket() {
        let a = spatial_bucket(Coordinate::new(-27.47011, 153.02101));
        let b = spatial_bucket(Coordinate::new(-27.47099, 153.02999));
        assert_eq!(a, b);
    }

    #[test]
    fn test_reading_keys() {
        let reading = Reading::position("abc", "route", 1, Coordinate::new(10.0, 20.0));
        let key = reading_item_key(&reading);
        assert_eq!(key.sk, "position#abc");
        assert_eq!(parse_reading_sort_key(&key.sk), Some(("position", "abc")));

        let image = Reading::image("img", "route", 1, ImageRef::raw("a.jpg"));
        assert_eq!(reading_partition_key(&image), UNLOCATED_BUCKET);
    }
}
