//! Mocks and fixtures shared by the Forage test suites.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveTime;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use forage_core::calendar::parse_calendar_text;
use forage_core::config::{AppConfig, ModelConfig};
use forage_core::domain::CalendarEntry;
use forage_core::error::{ForageError, Result};
use forage_core::geo::{GeocodeHit, NearbyPlaces, NearbyQuery, PlaceRecord};
use forage_core::traits::{CalendarSource, LlmClient, PlacesService};
use forage_core::types::*;

// ---- LLM ----

/// One scripted LLM reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Stream this text, then stop.
    Text(String),
    /// Fail the request with `LlmRequest(msg)`.
    Error(String),
    /// Wait, then stream the text.
    Delayed(Duration, String),
}

/// A request the mock received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub format: Option<ResponseFormat>,
}

impl RecordedRequest {
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    requests: Vec<RecordedRequest>,
}

/// Scripted LLM. Clones share the same script and request log.
#[derive(Clone, Default)]
pub struct MockLlm {
    state: Arc<Mutex<MockState>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.push(MockReply::Text(text.into()));
        self
    }

    pub fn with_json(self, value: serde_json::Value) -> Self {
        self.with_text(value.to_string())
    }

    pub fn with_error(self, msg: impl Into<String>) -> Self {
        self.push(MockReply::Error(msg.into()));
        self
    }

    pub fn with_delay(self, delay: Duration, text: impl Into<String>) -> Self {
        self.push(MockReply::Delayed(delay, text.into()));
        self
    }

    pub fn push(&self, reply: MockReply) {
        self.state.lock().unwrap().replies.push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().replies.len()
    }
}

/// Split text into two deltas so consumers must concatenate.
fn text_deltas(text: String) -> Vec<Result<StreamDelta>> {
    let mid = (0..=text.len() / 2)
        .rev()
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(0);
    let (a, b) = text.split_at(mid);
    let mut deltas = Vec::new();
    for part in [a, b] {
        if !part.is_empty() {
            deltas.push(Ok(StreamDelta::TextDelta(part.to_string())));
        }
    }
    deltas.push(Ok(StreamDelta::Usage {
        input_tokens: 100,
        output_tokens: text.len() as u64 / 4,
    }));
    deltas.push(Ok(StreamDelta::Stop(StopReason::EndTurn)));
    deltas
}

impl LlmClient for MockLlm {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        format: Option<&ResponseFormat>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(RecordedRequest {
                model_id: config.model_id.clone(),
                messages,
                format: format.cloned(),
            });
            state.replies.pop_front()
        };

        Box::pin(async move {
            let text = match reply {
                Some(MockReply::Text(text)) => text,
                Some(MockReply::Delayed(delay, text)) => {
                    tokio::time::sleep(delay).await;
                    text
                }
                Some(MockReply::Error(msg)) => return Err(ForageError::LlmRequest(msg)),
                None => return Err(ForageError::LlmRequest("mock script exhausted".into())),
            };
            let deltas = futures::stream::iter(text_deltas(text));
            Ok(Box::pin(deltas) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

// ---- Places ----

#[derive(Default)]
struct PlacesState {
    geocodes: Vec<(String, GeocodeHit)>,
    nearby: Option<NearbyPlaces>,
    geocode_queries: Vec<String>,
    nearby_queries: Vec<NearbyQuery>,
}

/// In-memory places service.
///
/// Geocode lookups match a registered key case-insensitively, either
/// exactly or as a prefix of the query (longest key wins).
#[derive(Clone, Default)]
pub struct StaticPlaces {
    state: Arc<Mutex<PlacesState>>,
    fail_geocode: Arc<AtomicBool>,
    fail_nearby: Arc<AtomicBool>,
}

impl StaticPlaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places service with the Cambridge centroid and venue fixture.
    pub fn cambridge() -> Self {
        Self::new()
            .with_geocode("Cambridge, England", cambridge_centre())
            .with_nearby(cambridge_nearby())
    }

    pub fn with_geocode(self, key: &str, hit: GeocodeHit) -> Self {
        self.state
            .lock()
            .unwrap()
            .geocodes
            .push((key.to_lowercase(), hit));
        self
    }

    /// Shorthand for a named point.
    pub fn with_point(self, key: &str, name: &str, latitude: f64, longitude: f64) -> Self {
        self.with_geocode(
            key,
            GeocodeHit {
                name: Some(name.to_string()),
                display_name: format!("{name}, Cambridge, Cambridgeshire, England"),
                latitude,
                longitude,
            },
        )
    }

    pub fn with_nearby(self, nearby: NearbyPlaces) -> Self {
        self.state.lock().unwrap().nearby = Some(nearby);
        self
    }

    /// Make every geocode call fail with a places error.
    pub fn failing_geocode(self) -> Self {
        self.fail_geocode.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_nearby(self) -> Self {
        self.fail_nearby.store(true, Ordering::SeqCst);
        self
    }

    pub fn geocode_queries(&self) -> Vec<String> {
        self.state.lock().unwrap().geocode_queries.clone()
    }

    pub fn nearby_queries(&self) -> Vec<NearbyQuery> {
        self.state.lock().unwrap().nearby_queries.clone()
    }
}

impl PlacesService for StaticPlaces {
    fn geocode(&self, query: &str) -> BoxFuture<'_, Result<Option<GeocodeHit>>> {
        let query = query.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.geocode_queries.push(query.clone());
            if self.fail_geocode.load(Ordering::SeqCst) {
                return Err(ForageError::Places("geocoder unavailable".into()));
            }
            let lower = query.to_lowercase();
            let hit = state
                .geocodes
                .iter()
                .filter(|(key, _)| lower == *key || lower.starts_with(key.as_str()))
                .max_by_key(|(key, _)| key.len())
                .map(|(_, hit)| hit.clone());
            Ok(hit)
        })
    }

    fn find_nearby(&self, query: NearbyQuery) -> BoxFuture<'_, Result<NearbyPlaces>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.nearby_queries.push(query);
            if self.fail_nearby.load(Ordering::SeqCst) {
                return Err(ForageError::PlacesTimeout {
                    operation: "find_nearby_places".into(),
                    timeout_secs: 30,
                });
            }
            Ok(state.nearby.clone().unwrap_or_default())
        })
    }
}

// ---- Calendar ----

/// Calendar over a fixed list of entries.
pub struct StaticCalendar {
    entries: Vec<CalendarEntry>,
    fail: bool,
}

impl StaticCalendar {
    pub fn new(entries: Vec<CalendarEntry>) -> Self {
        Self {
            entries,
            fail: false,
        }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(parse_calendar_text(text))
    }

    /// A calendar whose backing store is unreachable.
    pub fn failing() -> Self {
        Self {
            entries: Vec::new(),
            fail: true,
        }
    }
}

impl CalendarSource for StaticCalendar {
    fn describe(&self) -> String {
        format!("static calendar ({} entries)", self.entries.len())
    }

    fn entries(&self) -> BoxFuture<'_, Result<Vec<CalendarEntry>>> {
        Box::pin(async move {
            if self.fail {
                return Err(ForageError::Calendar("calendar backend unreachable".into()));
            }
            Ok(self.entries.clone())
        })
    }
}

// ---- Fixtures ----

pub fn cambridge_centre() -> GeocodeHit {
    GeocodeHit {
        name: Some("Cambridge".into()),
        display_name: "Cambridge, Cambridgeshire, Cambridgeshire and Peterborough, England, United Kingdom".into(),
        latitude: 52.2055314,
        longitude: 0.1186637,
    }
}

fn record(name: Option<&str>, lat: f64, lon: f64, extra: &[(&str, &str)]) -> PlaceRecord {
    let mut tags = BTreeMap::new();
    if let Some(name) = name {
        tags.insert("name".to_string(), name.to_string());
    }
    for (k, v) in extra {
        tags.insert(k.to_string(), v.to_string());
    }
    PlaceRecord {
        name: name.map(str::to_string),
        latitude: Some(lat),
        longitude: Some(lon),
        tags,
    }
}

/// Nearby-places response around central Cambridge.
///
/// Food venues: 2 cafes, 2 pubs, 2 restaurants, 1 fast_food. Also an unnamed
/// cafe, a bank and a shop category that the catalog must drop.
pub fn cambridge_nearby() -> NearbyPlaces {
    let mut amenity = BTreeMap::new();
    amenity.insert(
        "cafe".to_string(),
        vec![
            record(Some("Fitzbillies"), 52.2002, 0.1175, &[("cuisine", "coffee_shop")]),
            record(Some("Bould Brothers Coffee"), 52.2072, 0.1188, &[]),
            record(None, 52.2010, 0.1200, &[]),
        ],
    );
    amenity.insert(
        "pub".to_string(),
        vec![
            record(Some("The Eagle"), 52.2039, 0.1182, &[("real_ale", "yes")]),
            record(Some("The Mill"), 52.2005, 0.1148, &[]),
        ],
    );
    amenity.insert(
        "restaurant".to_string(),
        vec![
            record(Some("Midsummer House"), 52.2115, 0.1270, &[("cuisine", "british")]),
            record(Some("Dishoom"), 52.2064, 0.1197, &[("cuisine", "indian")]),
        ],
    );
    amenity.insert(
        "fast_food".to_string(),
        vec![record(Some("Gardenia"), 52.2045, 0.1170, &[("cuisine", "greek")])],
    );
    amenity.insert(
        "bank".to_string(),
        vec![record(Some("Barclays"), 52.2050, 0.1210, &[])],
    );

    let mut shop = BTreeMap::new();
    shop.insert(
        "bakery".to_string(),
        vec![record(Some("Chelsea Bun Co"), 52.2030, 0.1190, &[])],
    );

    let mut categories = BTreeMap::new();
    categories.insert("amenity".to_string(), amenity);
    categories.insert("shop".to_string(), shop);

    NearbyPlaces {
        categories,
        total_count: 10,
    }
}

pub const SAMPLE_CALENDAR: &str = "\
# Thursday
07:30 - 08:15  Morning Run
08:30 - 09:00  Breakfast at The Breakfast Club
10:00 - 11:30  Team meeting
14:00 - 15:00  Lecture in Mill Lane
16:00 - 16:30  Zoom call with Boston
";

pub fn sample_calendar() -> Vec<CalendarEntry> {
    parse_calendar_text(SAMPLE_CALENDAR)
}

/// Places service that resolves the sample calendar's two locations.
pub fn sample_places() -> StaticPlaces {
    StaticPlaces::cambridge()
        .with_point("The Breakfast Club", "The Breakfast Club", 52.2020, 0.1300)
        .with_point("Mill Lane", "Mill Lane", 52.2008, 0.1160)
}

/// Canned stage replies in the shapes the validators accept.
pub mod replies {
    use serde_json::{json, Value};

    /// Select reply choosing `venue` for each `(meal, venue)` pick.
    pub fn selection(picks: &[(&str, &str)]) -> Value {
        json!({
            "selected_meals": picks.iter().map(|(m, _)| *m).collect::<Vec<_>>(),
            "selections": picks.iter().map(|(meal, venue)| json!({
                "meal": meal,
                "venue": {"name": venue, "category": "restaurant", "latitude": 0.0, "longitude": 0.0},
                "justification": format!("{venue} suits {meal}"),
            })).collect::<Vec<_>>(),
            "selection_reasoning": "Chosen for being close to the day's appointments.",
        })
    }

    /// Select reply that chooses nothing.
    pub fn empty_selection(reason: &str) -> Value {
        json!({"selected_meals": [], "selections": [], "selection_reasoning": reason})
    }

    /// Plan reply covering `legs` in order.
    pub fn route(meals: &[&str], legs: &[(&str, &str)]) -> Value {
        json!({
            "route_overview": "An easy day on foot through the centre.",
            "selected_meals": meals,
            "segments": legs.iter().map(|(from, to)| json!({
                "from": from,
                "to": to,
                "distance": "600 m",
                "directions": format!("Walk from {from} to {to} along the main road."),
                "travel_time": "8 minutes",
            })).collect::<Vec<_>>(),
            "transport_recommendations": ["Walking is quickest in the centre."],
        })
    }

    pub fn narrative() -> Value {
        json!({
            "greeting": "Good morning!",
            "day_overview": "A relaxed day of good food between your appointments.",
            "restaurant_highlights": "Expect a cosy lunch spot with great coffee.",
            "route_guidance": "Everything is a short walk apart.",
            "closing_remarks": "Enjoy your day!",
        })
    }
}

pub fn hhmm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// Minimal config rooted in `workspace`.
pub fn test_config(workspace: &Path) -> AppConfig {
    let toml_str = format!(
        r#"
[model]
model_id = "gpt-4o"
api_key = "sk-test"

[workflow]
workspace = "{}"
max_stage_retries = 2
stage_timeout_secs = 5
"#,
        workspace.display()
    );
    toml::from_str(&toml_str).unwrap()
}
