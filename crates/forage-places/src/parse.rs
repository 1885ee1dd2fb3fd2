//! Tolerant decoding of the OSM server's tool payloads.
//!
//! The server returns coordinates as strings or numbers and geocode results
//! as either a list of matches or a single object.

use std::collections::BTreeMap;

use serde_json::Value;

use forage_core::error::{ForageError, Result};
use forage_core::geo::{GeocodeHit, NearbyPlaces, PlaceRecord};

fn number(value: Option<&Value>) -> Option<f64> {
    let parsed: Option<f64> = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn coordinate(obj: &Value, short: &str, long: &str) -> Option<f64> {
    number(obj.get(short)).or_else(|| number(obj.get(long)))
}

fn decode(text: &str, tool: &str) -> Result<Value> {
    serde_json::from_str(text.trim())
        .map_err(|e| ForageError::Places(format!("{tool} returned malformed JSON: {e}")))
}

/// Decode a `geocode_address` payload. An empty list or an object without
/// coordinates means no match.
pub fn parse_geocode(text: &str) -> Result<Option<GeocodeHit>> {
    let value = decode(text, "geocode_address")?;
    let first = match value {
        Value::Array(items) => match items.into_iter().next() {
            Some(item) => item,
            None => return Ok(None),
        },
        other => other,
    };
    if !first.is_object() {
        return Ok(None);
    }

    let (Some(latitude), Some(longitude)) = (
        coordinate(&first, "lat", "latitude"),
        coordinate(&first, "lon", "longitude"),
    ) else {
        return Ok(None);
    };

    let name = first
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    let display_name = first
        .get("display_name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| name.clone())
        .unwrap_or_default();

    Ok(Some(GeocodeHit {
        name,
        display_name,
        latitude,
        longitude,
    }))
}

fn tag_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(tags)) = value else {
        return BTreeMap::new();
    };
    tags.iter()
        .filter_map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Null => return None,
                other => other.to_string(),
            };
            Some((k.clone(), text))
        })
        .collect()
}

fn place(value: &Value) -> PlaceRecord {
    PlaceRecord {
        name: value
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string),
        latitude: coordinate(value, "latitude", "lat"),
        longitude: coordinate(value, "longitude", "lon"),
        tags: tag_map(value.get("tags")),
    }
}

/// Decode a `find_nearby_places` payload into the nested
/// category -> subcategory -> places structure.
pub fn parse_nearby(text: &str) -> Result<NearbyPlaces> {
    let value = decode(text, "find_nearby_places")?;
    let Some(obj) = value.as_object() else {
        return Err(ForageError::Places(
            "find_nearby_places returned a non-object payload".into(),
        ));
    };

    let mut categories = BTreeMap::new();
    if let Some(Value::Object(cats)) = obj.get("categories") {
        for (category, subs) in cats {
            let Value::Object(subs) = subs else { continue };
            let mut by_sub = BTreeMap::new();
            for (sub, places) in subs {
                let records = match places {
                    Value::Array(items) => items.iter().map(place).collect(),
                    _ => Vec::new(),
                };
                by_sub.insert(sub.clone(), records);
            }
            categories.insert(category.clone(), by_sub);
        }
    }

    let counted: usize = categories
        .values()
        .flat_map(|subs: &BTreeMap<String, Vec<PlaceRecord>>| subs.values())
        .map(Vec::len)
        .sum();
    let total_count = obj
        .get("total_count")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(counted);

    Ok(NearbyPlaces {
        categories,
        total_count,
    })
}
