//! Stage instruction rendering.
//!
//! Pure functions of a [`ContextSnapshot`]: the same snapshot always renders
//! byte-identical text, and nothing here reads shared state.

use std::fmt::Write as _;

use forage_core::domain::{waypoints, MealTag, SelectionResult};
use forage_core::types::Stage;

use crate::output_validator::expected_legs;

use super::context::ContextSnapshot;

const NONE: &str = "None";

/// Instruction text for `stage`, built from `snapshot`.
pub fn render(stage: Stage, snapshot: &ContextSnapshot) -> String {
    match stage {
        Stage::Select => render_select(snapshot),
        Stage::Plan => render_plan(snapshot),
        Stage::Present => render_present(snapshot),
    }
}

/// The opening user message for a stage.
pub fn kickoff(stage: Stage, snapshot: &ContextSnapshot) -> String {
    match stage {
        Stage::Select => format!(
            "Choose where I should eat {} in {}. Answer with the JSON object only.",
            meal_list(&snapshot.requested_meals()),
            snapshot.city()
        ),
        Stage::Plan => {
            "Plan the route between the stops in your instructions. Answer with the JSON object only."
                .to_string()
        }
        Stage::Present => {
            "Write up my food day from the plan in your instructions. Answer with the JSON object only."
                .to_string()
        }
    }
}

/// Follow-up when a reply carried no JSON result.
pub fn nudge() -> String {
    "You have not given a result yet. Reply now with only the JSON object described in your instructions."
        .to_string()
}

/// Follow-up when a reply's JSON did not conform.
pub fn corrective(issues: &[String]) -> String {
    let mut text = String::from("Your last answer was not accepted:\n");
    for issue in issues {
        let _ = writeln!(text, "- {issue}");
    }
    text.push_str("Fix these problems and reply with the corrected JSON object only.");
    text
}

fn meal_list(meals: &[MealTag]) -> String {
    if meals.is_empty() {
        return NONE.to_string();
    }
    meals.iter().map(MealTag::as_str).collect::<Vec<_>>().join(", ")
}

fn or_none(lines: Vec<String>) -> String {
    if lines.is_empty() {
        NONE.to_string()
    } else {
        lines.join("\n")
    }
}

fn coords(latitude: f64, longitude: f64) -> String {
    format!("{latitude:.5}, {longitude:.5}")
}

fn text_or_none(text: &str) -> &str {
    if text.trim().is_empty() {
        NONE
    } else {
        text
    }
}

fn anchor_lines(snapshot: &ContextSnapshot) -> String {
    let lines = snapshot
        .anchors()
        .iter()
        .enumerate()
        .map(|(i, a)| {
            format!(
                "- anchor:{} {} {} ({}), from \"{}\"",
                i + 1,
                a.time_range,
                a.display_name,
                coords(a.latitude, a.longitude),
                a.source_description
            )
        })
        .collect();
    or_none(lines)
}

fn selection_lines(requested: &[MealTag], selection: Option<&SelectionResult>) -> String {
    let lines = requested
        .iter()
        .map(|meal| {
            let time = meal.nominal_time().format("%H:%M");
            let chosen = selection.and_then(|s| s.selections.iter().find(|c| c.meal == *meal));
            match chosen {
                Some(choice) => match &choice.venue {
                    Some(v) => format!(
                        "- {meal} ({time}): {} [{}] at {}. {}",
                        v.name,
                        v.category,
                        coords(v.latitude, v.longitude),
                        choice.justification
                    ),
                    None => format!("- {meal} ({time}): None. {}", choice.justification),
                },
                None => format!("- {meal} ({time}): None"),
            }
        })
        .collect();
    or_none(lines)
}

const ANSWER_SELECT: &str = r#"{"selected_meals": ["lunch"], "selections": [{"meal": "lunch", "venue": {"name": "...", "category": "...", "latitude": 0.0, "longitude": 0.0}, "justification": "..."}], "selection_reasoning": "..."}"#;

const ANSWER_PLAN: &str = r#"{"route_overview": "...", "selected_meals": ["lunch"], "segments": [{"from": "anchor:1", "to": "lunch", "distance": "...", "directions": "...", "travel_time": "..."}], "transport_recommendations": ["..."]}"#;

const ANSWER_PRESENT: &str = r#"{"greeting": "...", "day_overview": "...", "restaurant_highlights": "...", "route_guidance": "...", "closing_remarks": "..."}"#;

fn render_select(snapshot: &ContextSnapshot) -> String {
    let requested = snapshot.requested_meals();
    let venues = snapshot.venues();

    let venue_lines = venues
        .iter()
        .map(|v| {
            let tags: Vec<String> = v
                .tags
                .iter()
                .filter(|(k, _)| k.as_str() != "name")
                .map(|(k, val)| format!("{k}={val}"))
                .collect();
            let mut line = format!(
                "- {} [{}] at {}",
                v.name,
                v.category,
                coords(v.latitude, v.longitude)
            );
            if !tags.is_empty() {
                let _ = write!(line, " ({})", tags.join(", "));
            }
            line
        })
        .collect();

    let times = MealTag::ALL
        .iter()
        .map(|m| format!("{m} {}", m.nominal_time().format("%H:%M")))
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::new();
    let _ = writeln!(
        out,
        "You are {}, a local food guide choosing where to eat in {}.",
        Stage::Select.agent_name(),
        snapshot.city()
    );
    let _ = writeln!(out, "\n## Diner");
    let _ = writeln!(out, "Food preferences: {}", text_or_none(&snapshot.food_preferences()));
    let _ = writeln!(out, "Constraints: {}", text_or_none(&snapshot.constraints()));
    let _ = writeln!(out, "Meals to plan: {}", meal_list(&requested));
    let _ = writeln!(out, "\n## Available venues ({})", venues.len());
    let _ = writeln!(
        out,
        "Category counts:\n{}",
        or_none(snapshot.venue_stats().iter().map(|s| format!("- {s}")).collect())
    );
    let _ = writeln!(out, "Venues:\n{}", or_none(venue_lines));
    let _ = writeln!(out, "\n## Where the diner will be\n{}", anchor_lines(snapshot));
    let _ = writeln!(out, "\n## Rules");
    let _ = writeln!(
        out,
        "- Choose only venues from the list above and copy their exact names and coordinates."
    );
    let _ = writeln!(
        out,
        "- Choose at most one venue per requested meal and never add meals that were not requested."
    );
    let _ = writeln!(
        out,
        "- When nothing suitable exists for a meal, leave it out of selected_meals and give it a null venue with a reason."
    );
    let _ = writeln!(
        out,
        "- Prefer venues near where the diner will be around each meal time ({times})."
    );
    let _ = writeln!(
        out,
        "- If no venues are listed, select nothing and explain why in selection_reasoning."
    );
    let _ = writeln!(
        out,
        "\n## Answer\nReply with one JSON object of this shape:\n{ANSWER_SELECT}"
    );
    out
}

fn render_plan(snapshot: &ContextSnapshot) -> String {
    let requested = snapshot.requested_meals();
    let anchors = snapshot.anchors();
    let selection = snapshot.selection();

    let stop_lines = waypoints(selection.as_ref(), &anchors)
        .iter()
        .enumerate()
        .map(|(i, w)| {
            format!(
                "{}. {} [{}] {} ({})",
                i + 1,
                w.time.format("%H:%M"),
                w.label,
                w.name,
                coords(w.latitude, w.longitude)
            )
        })
        .collect();

    let legs: Vec<String> = expected_legs(selection.as_ref(), &anchors)
        .into_iter()
        .map(|(from, to)| format!("- {from} -> {to}"))
        .collect();
    let leg_text = if legs.is_empty() {
        "None. Return an empty segments list.".to_string()
    } else {
        legs.join("\n")
    };

    let selected = selection
        .as_ref()
        .map(|s| meal_list(&s.selected_meals))
        .unwrap_or_else(|| NONE.to_string());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "You are {}, planning how to get between meals and appointments in {}.",
        Stage::Plan.agent_name(),
        snapshot.city()
    );
    let _ = writeln!(out, "\n## Selected meals: {selected}");
    let _ = writeln!(out, "{}", selection_lines(&requested, selection.as_ref()));
    let _ = writeln!(out, "\n## Calendar anchors\n{}", anchor_lines(snapshot));
    let _ = writeln!(out, "\n## Stops in order\n{}", or_none(stop_lines));
    let _ = writeln!(out, "\n## Segments to plan, in this order\n{leg_text}");
    let _ = writeln!(out, "\n## Rules");
    let _ = writeln!(out, "- Use the stop labels in brackets as segment from/to values.");
    let _ = writeln!(
        out,
        "- Give a walking or public transport route for each segment with distance, directions and travel time."
    );
    let _ = writeln!(out, "- selected_meals must list exactly the selected meals above.");
    let _ = writeln!(out, "- Do not plan routes to meals shown as None.");
    let _ = writeln!(out, "\n## Answer\nReply with one JSON object of this shape:\n{ANSWER_PLAN}");
    out
}

fn render_present(snapshot: &ContextSnapshot) -> String {
    let requested = snapshot.requested_meals();
    let selection = snapshot.selection();

    let calendar_lines = snapshot
        .calendar_entries()
        .iter()
        .map(|e| format!("- {} {}", e.time_range(), e.description))
        .collect();

    let route = match snapshot.route_plan() {
        Some(plan) => {
            let mut text = format!("Overview: {}", plan.route_overview);
            for seg in &plan.segments {
                let _ = write!(
                    text,
                    "\n- {} -> {}: {}, {}. {}",
                    seg.from, seg.to, seg.distance, seg.travel_time, seg.directions
                );
            }
            if !plan.transport_recommendations.is_empty() {
                let _ = write!(text, "\nTransport: {}", plan.transport_recommendations.join("; "));
            }
            text
        }
        None => NONE.to_string(),
    };

    let reasoning = selection
        .as_ref()
        .map(|s| s.selection_reasoning.clone())
        .unwrap_or_default();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "You are {}, a friendly guide presenting the day's food plan in {}.",
        Stage::Present.agent_name(),
        snapshot.city()
    );
    let _ = writeln!(out, "\n## Meals\n{}", selection_lines(&requested, selection.as_ref()));
    let _ = writeln!(out, "Why these: {}", text_or_none(&reasoning));
    let _ = writeln!(out, "\n## Calendar\n{}", or_none(calendar_lines));
    let _ = writeln!(out, "\n## Calendar anchors\n{}", anchor_lines(snapshot));
    let _ = writeln!(out, "\n## Route\n{route}");
    let _ = writeln!(out, "\n## Rules");
    let _ = writeln!(
        out,
        "- Speak to the diner directly and keep each field to a short paragraph."
    );
    let _ = writeln!(
        out,
        "- Only mention venues and routes listed above. Say plainly when a meal has no venue."
    );
    let _ = writeln!(
        out,
        "\n## Answer\nReply with one JSON object of this shape:\n{ANSWER_PRESENT}"
    );
    out
}
