use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A successful geocode lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeHit {
    /// Short place name, when the service reports one.
    #[serde(default)]
    pub name: Option<String>,
    /// Full address-style name.
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Parameters of a nearby-places search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: u32,
    pub categories: Vec<String>,
    pub limit: u32,
}

/// One place as reported by the places service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Nearby-places response: category -> subcategory -> places.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NearbyPlaces {
    #[serde(default)]
    pub categories: BTreeMap<String, BTreeMap<String, Vec<PlaceRecord>>>,
    #[serde(default)]
    pub total_count: usize,
}
