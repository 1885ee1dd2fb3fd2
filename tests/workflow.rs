//! End-to-end runs of the coordinator against scripted collaborators.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use forage_agent::{RunInputs, RunLogger, WorkflowCoordinator};
use forage_core::domain::MealTag;
use forage_core::types::{Stage, WorkflowState};
use forage_test_utils::{
    replies, sample_calendar, sample_places, test_config, MockLlm, StaticCalendar,
};

fn coordinator(llm: &MockLlm, dir: &std::path::Path) -> WorkflowCoordinator {
    WorkflowCoordinator::new(
        Arc::new(llm.clone()),
        Arc::new(sample_places()),
        &test_config(dir),
    )
}

/// Breakfast before the first appointment, dinner after the last.
fn two_meal_llm() -> MockLlm {
    MockLlm::new()
        .with_json(replies::selection(&[
            ("breakfast", "fitzbillies"),
            ("dinner", "Midsummer House"),
        ]))
        .with_json(replies::route(
            &["breakfast", "dinner"],
            &[
                ("breakfast", "anchor:1"),
                ("anchor:1", "anchor:2"),
                ("anchor:2", "dinner"),
            ],
        ))
        .with_json(replies::narrative())
}

#[tokio::test]
async fn test_two_meal_day_orders_route_around_calendar() {
    let dir = tempfile::tempdir().unwrap();
    let llm = two_meal_llm();
    let mut coord = coordinator(&llm, dir.path());
    let calendar = StaticCalendar::new(sample_calendar());

    let inputs = RunInputs::new(vec![MealTag::Dinner, MealTag::Breakfast])
        .with_preferences("good coffee, then something special")
        .with_constraints("walking only");
    let report = coord.run(inputs, Some(&calendar)).await.unwrap();

    assert!(report.is_done(), "{}", report.summary());
    assert_eq!(report.anchors.len(), 2);
    assert_eq!(report.anchors[0].location_phrase, "The Breakfast Club");
    assert_eq!(report.anchors[1].location_phrase, "Mill Lane");

    // venue names are canonicalised to the catalog entry
    let selection = report.selection.as_ref().unwrap();
    let breakfast = selection.venue_for(MealTag::Breakfast).unwrap();
    assert_eq!(breakfast.name, "Fitzbillies");
    assert_eq!(breakfast.category, "cafe");
    assert_eq!(
        selection.venue_for(MealTag::Dinner).unwrap().category,
        "restaurant"
    );

    let labels: Vec<(String, String)> = report
        .route_plan
        .as_ref()
        .unwrap()
        .segments
        .iter()
        .map(|s| (s.from.clone(), s.to.clone()))
        .collect();
    assert_eq!(labels.len(), 3);
    assert_eq!(labels[0], ("breakfast".to_string(), "anchor:1".to_string()));
    assert_eq!(labels[2], ("anchor:2".to_string(), "dinner".to_string()));

    // the user's wording reaches the first stage
    let requests = llm.requests();
    let select_prompt = requests[0].system_prompt().unwrap();
    assert!(select_prompt.contains("good coffee, then something special"));
    assert!(select_prompt.contains("walking only"));
    assert!(select_prompt.contains("Fitzbillies"));

    let summary = report.summary();
    assert!(summary.contains("venues selected for breakfast, dinner"));
    assert!(summary.contains("route planned with 3 segment(s)"));
    assert!(!summary.contains("Blocked"));
}

#[tokio::test]
async fn test_report_serializes_for_json_output() {
    let dir = tempfile::tempdir().unwrap();
    let llm = two_meal_llm();
    let mut coord = coordinator(&llm, dir.path());
    let calendar = StaticCalendar::new(sample_calendar());

    let report = coord
        .run(
            RunInputs::new(vec![MealTag::Breakfast, MealTag::Dinner]),
            Some(&calendar),
        )
        .await
        .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["state"], "DONE");
    assert_eq!(json["city"], "Cambridge, England");
    assert_eq!(json["venue_count"], 7);
    assert_eq!(json["stages"].as_array().unwrap().len(), 3);
    assert!(json["failure"].is_null());
    assert_eq!(json["narrative"]["greeting"], "Good morning!");
}

#[tokio::test]
async fn test_plan_failure_keeps_selection_in_failure_context() {
    let dir = tempfile::tempdir().unwrap();
    // the route never covers the second leg
    let bad_route = replies::route(&["lunch"], &[("anchor:1", "lunch")]);
    let llm = MockLlm::new()
        .with_json(replies::selection(&[("lunch", "The Eagle")]))
        .with_json(bad_route.clone())
        .with_json(bad_route.clone())
        .with_json(bad_route);
    let mut coord = coordinator(&llm, dir.path());
    let calendar = StaticCalendar::new(sample_calendar());

    let report = coord
        .run(RunInputs::new(vec![MealTag::Lunch]), Some(&calendar))
        .await
        .unwrap();

    assert_eq!(report.state, WorkflowState::Failed);
    assert!(report.route_plan.is_none());
    assert!(report.narrative.is_none());
    assert_eq!(llm.call_count(), 4);

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Some(Stage::Plan));
    let selection = failure.context.selection().unwrap();
    assert_eq!(
        selection.venue_for(MealTag::Lunch).unwrap().name,
        "The Eagle"
    );
    assert_eq!(failure.context.anchors().len(), 2);
    assert!(report.summary().contains("Blocked: the plan stage failed"));
}

#[tokio::test]
async fn test_run_logger_records_whole_run() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");
    let llm = two_meal_llm();
    let mut coord = coordinator(&llm, dir.path());
    let calendar = StaticCalendar::new(sample_calendar());

    let inputs = RunInputs::new(vec![MealTag::Breakfast, MealTag::Dinner]);
    let run_id = inputs.run_id.clone();
    let handle = RunLogger::new(log_dir.clone(), 2).spawn(
        &coord.event_bus(),
        run_id.clone(),
        CancellationToken::new(),
    );

    let report = coord.run(inputs, Some(&calendar)).await.unwrap();
    assert!(report.is_done());
    handle.await.unwrap();

    let run_dir = log_dir.join(&run_id.0);
    let file = std::fs::read_dir(&run_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let entries: Vec<serde_json::Value> = std::fs::read_to_string(file)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(entries.first().unwrap()["event_type"], "run_started");
    assert_eq!(entries.last().unwrap()["event_type"], "run_complete");
    let completed: Vec<&str> = entries
        .iter()
        .filter(|e| e["event_type"] == "stage_completed")
        .map(|e| e["stage"].as_str().unwrap())
        .collect();
    assert_eq!(completed, vec!["select", "plan", "present"]);
    assert!(entries.iter().all(|e| e["run_id"] == run_id.0.as_str()));
}

#[tokio::test]
async fn test_calendar_without_locations_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new()
        .with_json(replies::selection(&[("lunch", "Dishoom")]))
        .with_json(replies::route(&["lunch"], &[]))
        .with_json(replies::narrative());
    let mut coord = coordinator(&llm, dir.path());
    let calendar = StaticCalendar::from_text(
        "07:30 - 08:15  Morning Run\n10:00 - 11:00  Zoom call with Boston\n",
    );

    let report = coord
        .run(RunInputs::new(vec![MealTag::Lunch]), Some(&calendar))
        .await
        .unwrap();

    assert!(report.is_done(), "{}", report.summary());
    assert!(report.anchors.is_empty());
    assert!(report.degradations.is_empty());
    assert!(report.route_plan.as_ref().unwrap().segments.is_empty());

    let requests = llm.requests();
    assert!(requests[0]
        .system_prompt()
        .unwrap()
        .contains("## Where the diner will be\nNone"));
    assert!(requests[2].system_prompt().unwrap().contains("Morning Run"));
}
