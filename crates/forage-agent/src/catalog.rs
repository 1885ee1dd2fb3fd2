//! Venue catalog: geocode the target city and collect nearby food venues.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use forage_core::domain::VenueCandidate;
use forage_core::error::{ForageError, Result};
use forage_core::geo::{GeocodeHit, NearbyPlaces, NearbyQuery};
use forage_core::traits::PlacesService;

/// Subcategories of `amenity` kept as food venues.
pub const FOOD_SUBCATEGORIES: [&str; 7] = [
    "restaurant",
    "pub",
    "bar",
    "cafe",
    "fast_food",
    "bistro",
    "food_court",
];

/// Top-level category requested from the places service.
pub const AMENITY: &str = "amenity";

/// Number of usable venues in one subcategory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStat {
    pub category: String,
    pub count: usize,
}

impl fmt::Display for CategoryStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} places", self.category, self.count)
    }
}

/// The venues a run may choose from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub centre: Option<GeocodeHit>,
    pub venues: Vec<VenueCandidate>,
    pub stats: Vec<CategoryStat>,
    /// Places the service reported before filtering.
    pub total_returned: usize,
}

impl Catalog {
    pub fn stat_lines(&self) -> Vec<String> {
        self.stats.iter().map(ToString::to_string).collect()
    }
}

/// Flatten a nearby-places response into food venues.
///
/// Keeps whitelisted `amenity` subcategories only, and only places with a
/// non-empty `name` tag and both coordinates.
pub fn flatten_nearby(nearby: &NearbyPlaces) -> (Vec<VenueCandidate>, Vec<CategoryStat>) {
    let mut venues = Vec::new();
    let mut stats = Vec::new();

    let Some(amenities) = nearby.categories.get(AMENITY) else {
        return (venues, stats);
    };

    for (subcategory, places) in amenities {
        let category = subcategory.to_lowercase();
        if !FOOD_SUBCATEGORIES.contains(&category.as_str()) {
            continue;
        }

        let before = venues.len();
        for place in places {
            let tagged = place
                .tags
                .get("name")
                .map(|n| n.trim())
                .filter(|n| !n.is_empty());
            let (Some(tagged), Some(latitude), Some(longitude)) =
                (tagged, place.latitude, place.longitude)
            else {
                continue;
            };
            let name = place
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(tagged);

            venues.push(VenueCandidate {
                name: name.to_string(),
                category: category.clone(),
                latitude,
                longitude,
                tags: place.tags.clone(),
            });
        }

        let count = venues.len() - before;
        if count > 0 {
            stats.push(CategoryStat { category, count });
        }
    }

    (venues, stats)
}

/// Builds the catalog with one geocode and one nearby-search call.
pub struct CatalogBuilder<'a> {
    places: &'a dyn PlacesService,
    city: String,
    radius_m: u32,
    limit: u32,
    timeout: Duration,
}

impl<'a> CatalogBuilder<'a> {
    pub fn new(places: &'a dyn PlacesService, city: impl Into<String>, timeout: Duration) -> Self {
        Self {
            places,
            city: city.into(),
            radius_m: 2000,
            limit: 1000,
            timeout,
        }
    }

    pub fn radius(mut self, radius_m: u32) -> Self {
        self.radius_m = radius_m;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ForageError::PlacesTimeout {
                operation: operation.to_string(),
                timeout_secs: self.timeout.as_secs(),
            })?
    }

    /// Errors when the city cannot be geocoded or the search fails; callers
    /// degrade to an empty catalog.
    pub async fn build(&self) -> Result<Catalog> {
        let centre = self
            .bounded("geocode city", self.places.geocode(&self.city))
            .await?
            .ok_or_else(|| {
                ForageError::Places(format!("city '{}' could not be geocoded", self.city))
            })?;
        debug!(city = %self.city, lat = centre.latitude, lon = centre.longitude, "City centre");

        let query = NearbyQuery {
            latitude: centre.latitude,
            longitude: centre.longitude,
            radius_m: self.radius_m,
            categories: vec![AMENITY.to_string()],
            limit: self.limit,
        };
        let nearby = self
            .bounded("find nearby places", self.places.find_nearby(query))
            .await?;

        let (venues, stats) = flatten_nearby(&nearby);
        info!(
            city = %self.city,
            returned = nearby.total_count,
            venues = venues.len(),
            "Catalog built"
        );

        Ok(Catalog {
            centre: Some(centre),
            venues,
            stats,
            total_returned: nearby.total_count,
        })
    }
}
