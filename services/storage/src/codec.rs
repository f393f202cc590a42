//! Reading codec.
//!
//! Maps typed [`Reading`]s to persisted attribute maps and back. Each reading
//! type declares which of its fields are floats and which are booleans:
//! floats are written as fixed-precision decimal strings (the store's native
//! float handling would round them) and booleans as `0`/`1` numbers.

use crate::error::{Result, StorageError};
use crate::keys;
use crate::kv::{AttrValue, Item, ATTR_PK, ATTR_SK};
use crate::reading::{
    Coordinate, Entity, ImageRef, ObjectLocator, Prediction, Reading, ReadingData, ReadingType,
    StoredReading,
};
use std::collections::HashMap;

/// Decimal places kept for every float field
pub const FLOAT_PRECISION: usize = 10;

pub const ATTR_READING_ID: &str = "reading_id";
pub const ATTR_ROUTE_ID: &str = "route_id";
pub const ATTR_TIMESTAMP: &str = "timestamp";
pub const ATTR_READING_TYPE: &str = "reading_type";
pub const ATTR_LAT: &str = "lat";
pub const ATTR_LNG: &str = "lng";
pub const ATTR_IMAGE_FILE: &str = "image_file";
pub const ATTR_IMAGE_BUCKET: &str = "image_bucket";
pub const ATTR_IMAGE_KEY: &str = "image_key";
pub const ATTR_ENTITIES: &str = "entities";
pub const ATTR_ANNOTATION_TIMESTAMP: &str = "annotation_timestamp";
pub const ATTR_ANNOTATOR_ID: &str = "annotator_id";

const ENTITY_NAME: &str = "name";
const ENTITY_CONFIDENCE: &str = "confidence";
const ENTITY_PRESENT: &str = "present";
const ENTITY_SEVERITY: &str = "severity";

/// Float and boolean field names for one record shape
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub floats: &'static [&'static str],
    pub bools: &'static [&'static str],
}

const POSITION_FIELDS: FieldSpec = FieldSpec {
    floats: &[ATTR_LAT, ATTR_LNG],
    bools: &[],
};

const IMAGE_FIELDS: FieldSpec = FieldSpec {
    floats: &[],
    bools: &[],
};

const PREDICTION_FIELDS: FieldSpec = FieldSpec {
    floats: &[ATTR_LAT, ATTR_LNG],
    bools: &[],
};

const ENTITY_FIELDS: FieldSpec = FieldSpec {
    floats: &[ENTITY_CONFIDENCE, ENTITY_SEVERITY],
    bools: &[ENTITY_PRESENT],
};

pub fn field_spec(reading_type: ReadingType) -> FieldSpec {
    match reading_type {
        ReadingType::Position => POSITION_FIELDS,
        ReadingType::Image => IMAGE_FIELDS,
        ReadingType::Prediction => PREDICTION_FIELDS,
    }
}

/// Intermediate field values before precision rules apply
#[derive(Debug, Clone)]
enum Field {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<HashMap<String, Field>>),
}

/// Encode a reading, keys included, into a persistable item
pub fn encode(reading: &Reading) -> Result<Item> {
    let mut item = encode_fields(reading)?;
    let key = keys::reading_item_key(reading);
    item.insert(ATTR_PK.to_string(), AttrValue::S(key.pk));
    item.insert(ATTR_SK.to_string(), AttrValue::S(key.sk));
    Ok(item)
}

/// Encode the reading's own fields without table keys (used for
/// `sample_data` on route records)
pub fn encode_fields(reading: &Reading) -> Result<Item> {
    let reading_type = reading.reading_type();
    let mut fields: HashMap<String, Field> = HashMap::from([
        (ATTR_READING_ID.to_string(), Field::Str(reading.reading_id.clone())),
        (ATTR_ROUTE_ID.to_string(), Field::Str(reading.route_id.clone())),
        (ATTR_TIMESTAMP.to_string(), Field::Int(reading.timestamp)),
        (
            ATTR_READING_TYPE.to_string(),
            Field::Str(reading_type.as_str().to_string()),
        ),
    ]);

    match &reading.data {
        ReadingData::Position(coordinate) => insert_coordinate(&mut fields, coordinate),
        ReadingData::Image { image } => insert_image(&mut fields, image),
        ReadingData::Prediction(prediction) => {
            insert_coordinate(&mut fields, &prediction.position);
            insert_image(&mut fields, &prediction.image);
            fields.insert(
                ATTR_ANNOTATION_TIMESTAMP.to_string(),
                Field::Int(prediction.annotation_timestamp),
            );
            fields.insert(
                ATTR_ANNOTATOR_ID.to_string(),
                Field::Str(prediction.annotator_id.clone()),
            );
            for entity in &prediction.entities {
                check_entity(entity).map_err(StorageError::precondition)?;
            }
            let entities = prediction.entities.iter().map(entity_fields).collect();
            fields.insert(ATTR_ENTITIES.to_string(), Field::List(entities));
        }
    }

    apply_spec(fields, field_spec(reading_type))
}

/// Decode a persisted item of the given type
pub fn decode(reading_type: &str, item: &Item) -> Result<Reading> {
    let reading_type: ReadingType = reading_type.parse()?;
    let spec = field_spec(reading_type);

    let stored_type = get_str(item, ATTR_READING_TYPE)?;
    if stored_type != reading_type.as_str() {
        return Err(StorageError::malformed(format!(
            "item has reading_type {stored_type}, expected {reading_type}"
        )));
    }

    let data = match reading_type {
        ReadingType::Position => ReadingData::Position(get_coordinate(item, spec)?),
        ReadingType::Image => ReadingData::Image {
            image: get_image(item)?,
        },
        ReadingType::Prediction => {
            let entities = match item.get(ATTR_ENTITIES) {
                Some(value) => value
                    .as_l()
                    .ok_or_else(|| StorageError::malformed("entities is not a list"))?
                    .iter()
                    .map(decode_entity)
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            ReadingData::Prediction(Prediction {
                position: get_coordinate(item, spec)?,
                image: get_image(item)?,
                entities,
                annotation_timestamp: get_int(item, ATTR_ANNOTATION_TIMESTAMP)?,
                annotator_id: get_str(item, ATTR_ANNOTATOR_ID)?.to_string(),
            })
        }
    };

    Ok(Reading {
        reading_id: get_str(item, ATTR_READING_ID)?.to_string(),
        route_id: get_str(item, ATTR_ROUTE_ID)?.to_string(),
        timestamp: get_int(item, ATTR_TIMESTAMP)?,
        data,
    })
}

/// Decode using the type recorded on the item itself
pub fn decode_item(item: &Item) -> Result<Reading> {
    let reading_type = get_str(item, ATTR_READING_TYPE)?;
    decode(reading_type, item)
}

/// Decode a full table item, keeping the partition key it was stored under
pub fn decode_stored(item: &Item) -> Result<StoredReading> {
    Ok(StoredReading {
        partition_key: get_str(item, ATTR_PK)?.to_string(),
        reading: decode_item(item)?,
    })
}

pub fn encode_float(value: f64) -> AttrValue {
    AttrValue::N(format!("{:.*}", FLOAT_PRECISION, value))
}

pub fn encode_bool(value: bool) -> AttrValue {
    AttrValue::N(if value { "1" } else { "0" }.to_string())
}

fn insert_coordinate(fields: &mut HashMap<String, Field>, coordinate: &Coordinate) {
    fields.insert(ATTR_LAT.to_string(), Field::Float(coordinate.lat));
    fields.insert(ATTR_LNG.to_string(), Field::Float(coordinate.lng));
}

fn insert_image(fields: &mut HashMap<String, Field>, image: &ImageRef) {
    match image {
        ImageRef::Raw { file } => {
            fields.insert(ATTR_IMAGE_FILE.to_string(), Field::Str(file.clone()));
        }
        ImageRef::Stored(locator) => {
            fields.insert(
                ATTR_IMAGE_BUCKET.to_string(),
                Field::Str(locator.bucket.clone()),
            );
            fields.insert(ATTR_IMAGE_KEY.to_string(), Field::Str(locator.key.clone()));
        }
    }
}

/// Confidence in `[0, 1]`, severity finite and non-negative
fn check_entity(entity: &Entity) -> std::result::Result<(), String> {
    if !(0.0..=1.0).contains(&entity.confidence) {
        return Err(format!(
            "entity {} confidence {} outside [0, 1]",
            entity.name, entity.confidence
        ));
    }
    if !entity.severity.is_finite() || entity.severity < 0.0 {
        return Err(format!(
            "entity {} severity {} is not a non-negative number",
            entity.name, entity.severity
        ));
    }
    Ok(())
}

fn entity_fields(entity: &Entity) -> HashMap<String, Field> {
    HashMap::from([
        (ENTITY_NAME.to_string(), Field::Str(entity.name.clone())),
        (ENTITY_CONFIDENCE.to_string(), Field::Float(entity.confidence)),
        (ENTITY_PRESENT.to_string(), Field::Bool(entity.present)),
        (ENTITY_SEVERITY.to_string(), Field::Float(entity.severity)),
    ])
}

/// Apply the float/bool rules of `spec` and lower every field to an attribute
fn apply_spec(fields: HashMap<String, Field>, spec: FieldSpec) -> Result<Item> {
    fields
        .into_iter()
        .map(|(name, field)| {
            let value = match field {
                Field::Float(v) if spec.floats.contains(&name.as_str()) => encode_float(v),
                Field::Bool(v) if spec.bools.contains(&name.as_str()) => encode_bool(v),
                Field::Float(_) | Field::Bool(_) => {
                    return Err(StorageError::precondition(format!(
                        "field {name} is not declared for this record shape"
                    )))
                }
                Field::Str(s) => AttrValue::S(s),
                Field::Int(i) => AttrValue::N(i.to_string()),
                Field::List(entries) => AttrValue::L(
                    entries
                        .into_iter()
                        .map(|entry| apply_spec(entry, ENTITY_FIELDS).map(AttrValue::M))
                        .collect::<Result<Vec<_>>>()?,
                ),
            };
            Ok((name, value))
        })
        .collect()
}

pub(crate) fn get_attr<'a>(item: &'a HashMap<String, AttrValue>, name: &str) -> Result<&'a AttrValue> {
    item.get(name)
        .ok_or_else(|| StorageError::malformed(format!("missing attribute {name}")))
}

pub(crate) fn get_str<'a>(item: &'a HashMap<String, AttrValue>, name: &str) -> Result<&'a str> {
    get_attr(item, name)?
        .as_s()
        .ok_or_else(|| StorageError::malformed(format!("attribute {name} is not a string")))
}

pub(crate) fn get_int(item: &HashMap<String, AttrValue>, name: &str) -> Result<i64> {
    let raw = get_number(item, name)?;
    raw.parse()
        .map_err(|_| StorageError::malformed(format!("attribute {name} is not an integer: {raw}")))
}

fn get_number<'a>(item: &'a HashMap<String, AttrValue>, name: &str) -> Result<&'a str> {
    get_attr(item, name)?
        .as_n()
        .ok_or_else(|| StorageError::malformed(format!("attribute {name} is not a number")))
}

fn get_float(item: &HashMap<String, AttrValue>, name: &str, spec: FieldSpec) -> Result<f64> {
    if !spec.floats.contains(&name) {
        return Err(StorageError::precondition(format!(
            "field {name} is not a declared float"
        )));
    }
    let raw = get_number(item, name)?;
    raw.parse()
        .map_err(|_| StorageError::malformed(format!("attribute {name} is not a decimal: {raw}")))
}

fn get_bool(item: &HashMap<String, AttrValue>, name: &str, spec: FieldSpec) -> Result<bool> {
    if !spec.bools.contains(&name) {
        return Err(StorageError::precondition(format!(
            "field {name} is not a declared boolean"
        )));
    }
    match get_number(item, name)? {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(StorageError::malformed(format!(
            "attribute {name} is not 0/1: {other}"
        ))),
    }
}

fn get_coordinate(item: &Item, spec: FieldSpec) -> Result<Coordinate> {
    Ok(Coordinate::new(
        get_float(item, ATTR_LAT, spec)?,
        get_float(item, ATTR_LNG, spec)?,
    ))
}

fn get_image(item: &Item) -> Result<ImageRef> {
    let bucket = item.get(ATTR_IMAGE_BUCKET).and_then(AttrValue::as_s);
    let key = item.get(ATTR_IMAGE_KEY).and_then(AttrValue::as_s);
    let file = item.get(ATTR_IMAGE_FILE).and_then(AttrValue::as_s);

    match (bucket, key, file) {
        (Some(bucket), Some(key), None) => Ok(ImageRef::Stored(ObjectLocator::new(bucket, key))),
        (None, None, Some(file)) => Ok(ImageRef::raw(file)),
        (None, None, None) => Err(StorageError::precondition(
            "image reading has neither a raw file nor a stored locator",
        )),
        _ => Err(StorageError::malformed(
            "image reading must carry exactly one of raw file or bucket+key",
        )),
    }
}

fn decode_entity(value: &AttrValue) -> Result<Entity> {
    let map = value
        .as_m()
        .ok_or_else(|| StorageError::malformed("entity is not a map"))?;

    let entity = Entity {
        name: get_str(map, ENTITY_NAME)?.to_string(),
        confidence: get_float(map, ENTITY_CONFIDENCE, ENTITY_FIELDS)?,
        present: get_bool(map, ENTITY_PRESENT, ENTITY_FIELDS)?,
        severity: get_float(map, ENTITY_SEVERITY, ENTITY_FIELDS)?,
    };
    check_entity(&entity).map_err(StorageError::malformed)?;
    Ok(entity)
}
