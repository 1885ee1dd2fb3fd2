//! Location extraction: calendar entries to time-stamped geographic anchors.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use forage_core::domain::{CalendarEntry, LocationAnchor};
use forage_core::error::ForageError;
use forage_core::traits::PlacesService;

/// Generic activities that name no place unless a locating preposition is present.
pub const DENY_TERMS: [&str; 11] = [
    "breakfast",
    "lunch",
    "dinner",
    "coffee break",
    "meeting",
    "call",
    "run",
    "phone call",
    "zoom",
    "online",
    "virtual",
];

/// Words that mark the whole description as a venue.
pub const VENUE_TERMS: [&str; 9] = [
    "pub",
    "restaurant",
    "café",
    "cafe",
    "bar",
    "hotel",
    "office",
    "center",
    "centre",
];

// Phrase characters: letters, digits, spaces, & and apostrophes, with
// comma-joined continuations ("Trinity College, Cambridge").
const PHRASE: &str = r"([\p{L}\p{N}\s&'’]+(?:\s*,\s*[\p{L}\p{N}\s&'’]+)*)";

struct Patterns {
    locator: Regex,
    deny: Vec<Regex>,
    at: Regex,
    inside: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        locator: Regex::new(r"(?i)\b(?:at|in)\s").unwrap(),
        deny: DENY_TERMS
            .iter()
            .map(|t| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(t))).unwrap())
            .collect(),
        at: Regex::new(&format!(r"(?i)\bat\s+{PHRASE}")).unwrap(),
        inside: Regex::new(&format!(r"(?i)\bin\s+{PHRASE}")).unwrap(),
    })
}

fn captured(re: &Regex, text: &str) -> Option<String> {
    let phrase = re.captures(text)?.get(1)?.as_str().trim();
    let phrase = phrase.trim_end_matches(',').trim();
    (!phrase.is_empty()).then(|| phrase.to_string())
}

/// Pull a location phrase out of a calendar description.
///
/// Rules, in order: deny-listed activities without `at`/`in` are rejected;
/// the phrase after `at` wins, then the phrase after `in`; a word containing
/// a venue keyword makes the whole description the phrase; finally the text
/// after `@`.
pub fn classify_location(description: &str) -> Option<String> {
    let p = patterns();
    let description = description.trim();
    let has_locator = p.locator.is_match(description);

    if !has_locator && p.deny.iter().any(|re| re.is_match(description)) {
        return None;
    }

    if let Some(phrase) = captured(&p.at, description) {
        return Some(phrase);
    }
    if let Some(phrase) = captured(&p.inside, description) {
        return Some(phrase);
    }

    let venue_word = description.split_whitespace().any(|word| {
        let lower = word.to_lowercase();
        VENUE_TERMS.iter().any(|term| lower.contains(term))
    });
    if venue_word {
        return Some(description.to_string());
    }

    description
        .split_once('@')
        .map(|(_, venue)| venue.trim().to_string())
        .filter(|venue| !venue.is_empty())
}

/// Qualify a phrase with the target city unless it already names it.
pub fn qualify_query(phrase: &str, city: &str) -> String {
    let town = city.split(',').next().unwrap_or(city).trim();
    if !town.is_empty() && phrase.to_lowercase().contains(&town.to_lowercase()) {
        phrase.to_string()
    } else {
        format!("{phrase}, {city}")
    }
}

/// Why a calendar entry produced no anchor.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoLocation,
    NotFound { query: String },
    LookupFailed { query: String, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntry {
    pub description: String,
    pub reason: SkipReason,
}

/// Anchors plus a record of every entry that yielded none.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub anchors: Vec<LocationAnchor>,
    pub skipped: Vec<SkippedEntry>,
}

impl Extraction {
    /// Entries whose geocode call failed outright (transport, timeout, bad payload).
    pub fn lookup_failures(&self) -> impl Iterator<Item = &SkippedEntry> {
        self.skipped
            .iter()
            .filter(|s| matches!(s.reason, SkipReason::LookupFailed { .. }))
    }
}

/// Turns calendar entries into anchors via one geocode call per located entry.
pub struct LocationExtractor<'a> {
    places: &'a dyn PlacesService,
    city: String,
    timeout: Duration,
}

impl<'a> LocationExtractor<'a> {
    pub fn new(places: &'a dyn PlacesService, city: impl Into<String>, timeout: Duration) -> Self {
        Self {
            places,
            city: city.into(),
            timeout,
        }
    }

    /// Never fails: entries that cannot be resolved are skipped.
    /// Anchors come back ordered by start time.
    pub async fn extract(&self, entries: &[CalendarEntry]) -> Extraction {
        let mut out = Extraction::default();

        for entry in entries {
            let Some(phrase) = classify_location(&entry.description) else {
                debug!(entry = %entry.description, "No location in calendar entry");
                out.skipped.push(SkippedEntry {
                    description: entry.description.clone(),
                    reason: SkipReason::NoLocation,
                });
                continue;
            };

            let query = qualify_query(&phrase, &self.city);
            let lookup = tokio::time::timeout(self.timeout, self.places.geocode(&query))
                .await
                .unwrap_or_else(|_| {
                    Err(ForageError::PlacesTimeout {
                        operation: format!("geocode '{query}'"),
                        timeout_secs: self.timeout.as_secs(),
                    })
                });

            match lookup {
                Ok(Some(hit)) => {
                    debug!(
                        phrase = %phrase,
                        lat = hit.latitude,
                        lon = hit.longitude,
                        "Resolved anchor"
                    );
                    out.anchors.push(LocationAnchor {
                        time_range: entry.time_range(),
                        source_description: entry.description.clone(),
                        display_name: hit.name.unwrap_or_else(|| phrase.clone()),
                        location_phrase: phrase,
                        latitude: hit.latitude,
                        longitude: hit.longitude,
                    });
                }
                Ok(None) => {
                    debug!(query = %query, "Geocode found no match");
                    out.skipped.push(SkippedEntry {
                        description: entry.description.clone(),
                        reason: SkipReason::NotFound { query },
                    });
                }
                Err(e) => {
                    warn!(query = %query, error = %e, "Geocode failed, skipping entry");
                    out.skipped.push(SkippedEntry {
                        description: entry.description.clone(),
                        reason: SkipReason::LookupFailed {
                            query,
                            error: e.to_string(),
                        },
                    });
                }
            }
        }

        out.anchors.sort_by_key(|a| a.time_range.start);
        out
    }
}
