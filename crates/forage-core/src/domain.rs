use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::ForageError;

/// A meal the user can ask to have planned.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealTag {
    Breakfast,
    Lunch,
    Dinner,
}

impl MealTag {
    pub const ALL: [MealTag; 3] = [MealTag::Breakfast, MealTag::Lunch, MealTag::Dinner];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Breakfast => "breakfast",
            Self::Lunch => "lunch",
            Self::Dinner => "dinner",
        }
    }

    /// Time of day used to place the meal among calendar anchors.
    pub fn nominal_time(&self) -> NaiveTime {
        let (h, m) = match self {
            Self::Breakfast => (8, 0),
            Self::Lunch => (12, 30),
            Self::Dinner => (18, 30),
        };
        NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default()
    }
}

impl fmt::Display for MealTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealTag {
    type Err = ForageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "breakfast" => Ok(Self::Breakfast),
            "lunch" => Ok(Self::Lunch),
            "dinner" => Ok(Self::Dinner),
            other => Err(ForageError::InvalidInput(format!("unknown meal '{other}'"))),
        }
    }
}

/// `HH:MM` serde representation for calendar times.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(serde::de::Error::custom)
    }
}

/// One line of the user's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEntry {
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub description: String,
}

impl CalendarEntry {
    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            start: self.start_time,
            end: self.end_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Where the user probably is during a calendar entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationAnchor {
    pub time_range: TimeRange,
    pub source_description: String,
    /// The phrase the classifier pulled out of the description.
    pub location_phrase: String,
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// A food or drink venue from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueCandidate {
    pub name: String,
    pub category: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// The venue chosen for a meal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub name: String,
    pub category: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealSelection {
    pub meal: MealTag,
    pub venue: Option<Venue>,
    pub justification: String,
}

/// Structured result of the Select stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub selected_meals: Vec<MealTag>,
    pub selections: Vec<MealSelection>,
    pub selection_reasoning: String,
}

impl SelectionResult {
    pub fn venue_for(&self, meal: MealTag) -> Option<&Venue> {
        self.selections
            .iter()
            .find(|s| s.meal == meal)
            .and_then(|s| s.venue.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSegment {
    /// Meal tag or `anchor:N` label of the origin.
    pub from: String,
    pub to: String,
    pub distance: String,
    pub directions: String,
    pub travel_time: String,
}

/// Structured result of the Plan stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlan {
    pub route_overview: String,
    pub selected_meals: Vec<MealTag>,
    pub segments: Vec<RouteSegment>,
    #[serde(default)]
    pub transport_recommendations: Vec<String>,
}

/// Structured result of the Present stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub greeting: String,
    pub day_overview: String,
    pub restaurant_highlights: String,
    pub route_guidance: String,
    pub closing_remarks: String,
}

impl Narrative {
    pub const FIELDS: [&'static str; 5] = [
        "greeting",
        "day_overview",
        "restaurant_highlights",
        "route_guidance",
        "closing_remarks",
    ];

    /// Render as a sectioned text report.
    pub fn format(&self, city: &str) -> String {
        let town = city.split(',').next().unwrap_or(city).trim();
        format!(
            "**Hello!** {}\n\n**Your {} Food Day:**\n{}\n\n**Restaurant Highlights:**\n{}\n\n**Getting Around:**\n{}\n\n{}",
            self.greeting,
            town,
            self.day_overview,
            self.restaurant_highlights,
            self.route_guidance,
            self.closing_remarks
        )
    }
}

/// A stop on the day's route: a selected meal or a calendar anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub label: String,
    pub time: NaiveTime,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub is_anchor: bool,
}

/// Chronological stops for the selected meals and anchors.
///
/// Meals sit at their nominal time; anchors at their start time. On equal
/// times anchors come first.
pub fn waypoints(selection: Option<&SelectionResult>, anchors: &[LocationAnchor]) -> Vec<Waypoint> {
    let mut points: Vec<Waypoint> = anchors
        .iter()
        .enumerate()
        .map(|(i, a)| Waypoint {
            label: format!("anchor:{}", i + 1),
            time: a.time_range.start,
            name: a.display_name.clone(),
            latitude: a.latitude,
            longitude: a.longitude,
            is_anchor: true,
        })
        .collect();

    if let Some(selection) = selection {
        let mut meals = selection.selected_meals.clone();
        meals.sort();
        meals.dedup();
        for meal in meals {
            if let Some(venue) = selection.venue_for(meal) {
                points.push(Waypoint {
                    label: meal.to_string(),
                    time: meal.nominal_time(),
                    name: venue.name.clone(),
                    latitude: venue.latitude,
                    longitude: venue.longitude,
                    is_anchor: false,
                });
            }
        }
    }

    // stable sort keeps anchor order for equal start times
    points.sort_by(|a, b| a.time.cmp(&b.time).then(b.is_anchor.cmp(&a.is_anchor)));
    points
}
