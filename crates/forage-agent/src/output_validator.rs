use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;

use forage_core::domain::{
    waypoints, LocationAnchor, MealSelection, MealTag, Narrative, RoutePlan, RouteSegment,
    SelectionResult, Venue, VenueCandidate,
};
use forage_core::types::Stage;

use crate::workflow::{ContextSnapshot, StageOutput};

/// Largest reply the validator will look at.
pub const MAX_REPLY_CHARS: usize = 100_000;

/// Result of validating one stage reply.
#[derive(Debug, Clone)]
pub enum ValidationResult {
    /// A conformant, typed stage result.
    Valid(StageOutput),
    /// The reply carried no JSON object at all.
    NoResult,
    /// The reply carried a JSON object that does not conform.
    Invalid { issues: Vec<String> },
}

/// Validates stage replies against the shape each stage must produce and
/// against the context the stage was given.
pub struct OutputValidator {
    stage: Stage,
    requested: Vec<MealTag>,
    venues: Vec<VenueCandidate>,
    selection: Option<SelectionResult>,
    anchors: Vec<LocationAnchor>,
    max_length: usize,
}

impl OutputValidator {
    /// Validator for `stage`, checking against the context snapshot the
    /// stage's instructions were rendered from.
    pub fn for_stage(stage: Stage, snapshot: &ContextSnapshot) -> Self {
        Self {
            stage,
            requested: snapshot.requested_meals(),
            venues: snapshot.venues(),
            selection: snapshot.selection(),
            anchors: snapshot.anchors(),
            max_length: MAX_REPLY_CHARS,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn validate(&self, reply: &str) -> ValidationResult {
        if reply.len() > self.max_length {
            return ValidationResult::Invalid {
                issues: vec![format!(
                    "Output exceeds max length: {} > {}",
                    reply.len(),
                    self.max_length
                )],
            };
        }

        let Some(value) = OutputCleaner::extract_json(reply) else {
            return ValidationResult::NoResult;
        };

        let outcome = match self.stage {
            Stage::Select => {
                validate_selection(&value, &self.requested, &self.venues)
                    .map(StageOutput::Selection)
            }
            Stage::Plan => {
                let empty = SelectionResult {
                    selected_meals: vec![],
                    selections: vec![],
                    selection_reasoning: String::new(),
                };
                let selection = self.selection.as_ref().unwrap_or(&empty);
                validate_route(&value, selection, &self.anchors).map(StageOutput::Route)
            }
            Stage::Present => validate_narrative(&value).map(StageOutput::Narrative),
        };

        match outcome {
            Ok(output) => ValidationResult::Valid(output),
            Err(issues) => ValidationResult::Invalid { issues },
        }
    }
}

fn non_blank(s: &str) -> bool {
    !s.trim().is_empty()
}

#[derive(Deserialize)]
struct RawSelection {
    selected_meals: Vec<String>,
    selections: Vec<RawMealSelection>,
    #[serde(default)]
    selection_reasoning: String,
}

#[derive(Deserialize)]
struct RawMealSelection {
    meal: String,
    venue: Option<Venue>,
    #[serde(default)]
    justification: String,
}

fn parse_meal(raw: &str, requested: &[MealTag], issues: &mut Vec<String>) -> Option<MealTag> {
    let Ok(meal) = raw.parse::<MealTag>() else {
        issues.push(format!("unknown meal '{raw}'"));
        return None;
    };
    if !requested.contains(&meal) {
        let wanted: Vec<_> = requested.iter().map(MealTag::as_str).collect();
        issues.push(format!(
            "meal '{meal}' was not requested (requested: {})",
            wanted.join(", ")
        ));
        return None;
    }
    Some(meal)
}

/// Check a Select reply. Chosen venues are replaced by the matching catalog
/// entry so coordinates come from the catalog, not the model.
pub fn validate_selection(
    value: &Value,
    requested: &[MealTag],
    venues: &[VenueCandidate],
) -> Result<SelectionResult, Vec<String>> {
    let raw: RawSelection = serde_json::from_value(value.clone())
        .map_err(|e| vec![format!("reply does not match the selection shape: {e}")])?;
    let mut issues = Vec::new();

    let mut listed = BTreeSet::new();
    for name in &raw.selected_meals {
        if let Some(meal) = parse_meal(name, requested, &mut issues) {
            listed.insert(meal);
        }
    }

    let mut seen = BTreeSet::new();
    let mut selections = Vec::new();
    for choice in raw.selections {
        let Some(meal) = parse_meal(&choice.meal, requested, &mut issues) else {
            continue;
        };
        if !seen.insert(meal) {
            issues.push(format!("meal '{meal}' is selected more than once"));
            continue;
        }

        let venue = match choice.venue {
            None => {
                if listed.contains(&meal) {
                    issues.push(format!(
                        "meal '{meal}' is listed in selected_meals but has no venue"
                    ));
                }
                None
            }
            Some(venue) => {
                if !listed.contains(&meal) {
                    issues.push(format!(
                        "meal '{meal}' has a venue but is not listed in selected_meals"
                    ));
                }
                if !non_blank(&venue.name) {
                    issues.push(format!("venue for '{meal}' has an empty name"));
                    None
                } else if venues.is_empty() {
                    issues.push(format!(
                        "no venues are available, so '{meal}' cannot have one; select nothing"
                    ));
                    None
                } else {
                    let wanted = venue.name.trim().to_lowercase();
                    match venues.iter().find(|v| v.name.trim().to_lowercase() == wanted) {
                        Some(found) => Some(Venue {
                            name: found.name.clone(),
                            category: found.category.clone(),
                            latitude: found.latitude,
                            longitude: found.longitude,
                        }),
                        None => {
                            issues.push(format!(
                                "venue '{}' for '{meal}' is not in the venue list",
                                venue.name
                            ));
                            None
                        }
                    }
                }
            }
        };

        selections.push(MealSelection {
            meal,
            venue,
            justification: choice.justification,
        });
    }

    for meal in &listed {
        if !seen.contains(meal) {
            issues.push(format!(
                "meal '{meal}' is listed in selected_meals but has no selection entry"
            ));
        }
    }
    if !non_blank(&raw.selection_reasoning) {
        issues.push("selection_reasoning must not be empty".to_string());
    }

    if !issues.is_empty() {
        return Err(issues);
    }
    selections.sort_by_key(|s| s.meal);
    Ok(SelectionResult {
        selected_meals: listed.into_iter().collect(),
        selections,
        selection_reasoning: raw.selection_reasoning,
    })
}

#[derive(Deserialize)]
struct RawRoutePlan {
    #[serde(default)]
    route_overview: String,
    selected_meals: Vec<String>,
    segments: Vec<RouteSegment>,
    #[serde(default)]
    transport_recommendations: Vec<String>,
}

/// The `(from, to)` labels a route must cover, in order.
///
/// Consecutive pairs of chronological waypoints. Anchors are routed
/// between even when no meal was selected.
pub fn expected_legs(
    selection: Option<&SelectionResult>,
    anchors: &[LocationAnchor],
) -> Vec<(String, String)> {
    waypoints(selection, anchors)
        .windows(2)
        .map(|pair| (pair[0].label.clone(), pair[1].label.clone()))
        .collect()
}

fn same_label(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Check a Plan reply against the selection and anchors it was planned from.
pub fn validate_route(
    value: &Value,
    selection: &SelectionResult,
    anchors: &[LocationAnchor],
) -> Result<RoutePlan, Vec<String>> {
    let raw: RawRoutePlan = serde_json::from_value(value.clone())
        .map_err(|e| vec![format!("reply does not match the route plan shape: {e}")])?;
    let mut issues = Vec::new();

    if !non_blank(&raw.route_overview) {
        issues.push("route_overview must not be empty".to_string());
    }

    let expected: BTreeSet<MealTag> = selection.selected_meals.iter().copied().collect();
    let mut listed = BTreeSet::new();
    for name in &raw.selected_meals {
        match name.parse::<MealTag>() {
            Ok(meal) => {
                listed.insert(meal);
            }
            Err(_) => issues.push(format!("unknown meal '{name}'")),
        }
    }
    if listed != expected {
        let names: Vec<_> = expected.iter().map(MealTag::as_str).collect();
        issues.push(format!(
            "selected_meals must be exactly the selected meals: [{}]",
            names.join(", ")
        ));
    }

    let legs = expected_legs(Some(selection), anchors);
    if raw.segments.len() != legs.len() {
        let wanted: Vec<_> = legs.iter().map(|(a, b)| format!("{a} -> {b}")).collect();
        issues.push(format!(
            "expected {} segments ({}), got {}",
            legs.len(),
            if wanted.is_empty() { "none".to_string() } else { wanted.join(", ") },
            raw.segments.len()
        ));
    } else {
        for (i, (segment, (from, to))) in raw.segments.iter().zip(&legs).enumerate() {
            if !same_label(&segment.from, from) || !same_label(&segment.to, to) {
                issues.push(format!(
                    "segment {} must go from '{from}' to '{to}', got '{}' -> '{}'",
                    i + 1,
                    segment.from,
                    segment.to
                ));
            }
            if !non_blank(&segment.directions) {
                issues.push(format!("segment {} has no directions", i + 1));
            }
        }
    }

    if !issues.is_empty() {
        return Err(issues);
    }

    let segments = raw
        .segments
        .into_iter()
        .zip(legs)
        .map(|(segment, (from, to))| RouteSegment { from, to, ..segment })
        .collect();
    Ok(RoutePlan {
        route_overview: raw.route_overview,
        selected_meals: expected.into_iter().collect(),
        segments,
        transport_recommendations: raw.transport_recommendations,
    })
}

/// Check a Present reply: all five narrative fields present and non-empty.
pub fn validate_narrative(value: &Value) -> Result<Narrative, Vec<String>> {
    let Some(obj) = value.as_object() else {
        return Err(vec!["Expected JSON object but got non-object".to_string()]);
    };
    let issues: Vec<String> = Narrative::FIELDS
        .iter()
        .filter(|field| !obj.get(**field).and_then(Value::as_str).is_some_and(non_blank))
        .map(|field| format!("'{field}' must be a non-empty string"))
        .collect();
    if !issues.is_empty() {
        return Err(issues);
    }
    serde_json::from_value(value.clone())
        .map_err(|e| vec![format!("reply does not match the narrative shape: {e}")])
}

/// Cleans and repairs malformed output.
pub struct OutputCleaner;

impl OutputCleaner {
    /// Apply heuristic repairs to output.
    /// - Strips markdown code fences
    /// - Balances JSON braces
    /// - Trims whitespace
    pub fn heuristic_repair(output: &str) -> String {
        let mut result = output.to_string();

        result = strip_code_fences(&result);
        result = result.trim().to_string();

        if result.starts_with('{') || result.starts_with('[') {
            result = balance_braces(&result);
        }

        result
    }

    /// Locate the JSON object in a reply that may wrap it in prose.
    ///
    /// Tries the repaired reply as a whole, then the last balanced top-level
    /// object, then an unterminated trailing object with its closers restored.
    pub fn extract_json(output: &str) -> Option<Value> {
        let repaired = Self::heuristic_repair(output);
        if repaired.starts_with('{') {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str(&repaired) {
                return Some(value);
            }
        }

        let text = strip_code_fences(output);
        let (objects, open_tail) = top_level_objects(&text);
        for span in objects.iter().rev() {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str(&text[span.clone()]) {
                return Some(value);
            }
        }

        let tail = balance_braces(&text[open_tail?..]);
        match serde_json::from_str(&tail) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => None,
        }
    }
}

/// Byte spans of balanced top-level `{...}` objects, plus the start of a
/// trailing object that never closed.
fn top_level_objects(text: &str) -> (Vec<std::ops::Range<usize>>, Option<usize>) {
    let mut spans = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if depth == 0 && ch != '{' {
            continue;
        }
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    spans.push(start..i + 1);
                }
            }
            _ => {}
        }
    }

    (spans, (depth > 0).then_some(start))
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    // Try ```json ... ``` first
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    // Try ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Balance JSON braces/brackets by appending missing closers.
fn balance_braces(text: &str) -> String {
    let mut brace_depth: i32 = 0;
    let mut bracket_depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => brace_depth += 1,
            '}' => brace_depth -= 1,
            '[' => bracket_depth += 1,
            ']' => bracket_depth -= 1,
            _ => {}
        }
    }

    let mut result = text.to_string();
    for _ in 0..bracket_depth {
        result.push(']');
    }
    for _ in 0..brace_depth {
        result.push('}');
    }
    result
}
