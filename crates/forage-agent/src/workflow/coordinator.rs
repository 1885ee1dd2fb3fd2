use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use forage_core::config::{AppConfig, ModelConfig, WorkflowConfig};
use forage_core::domain::{
    CalendarEntry, LocationAnchor, MealTag, Narrative, RoutePlan, SelectionResult,
};
use forage_core::error::{ForageError, Result};
use forage_core::event::EventBus;
use forage_core::traits::{CalendarSource, LlmClient, PlacesService};
use forage_core::types::{RunId, Stage, WorkflowEvent, WorkflowState};
use forage_llm::ResponseCache;

use crate::catalog::CatalogBuilder;
use crate::locate::LocationExtractor;
use crate::output_validator::{OutputValidator, ValidationResult};

use super::context::{keys, ContextSnapshot, SharedContext, WorkflowContext};
use super::prompts;
use super::stage::{StageAgent, StageOutput};

/// What the user asked for.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub run_id: RunId,
    /// Overrides the configured city.
    pub city: Option<String>,
    pub food_preferences: Option<String>,
    pub constraints: Option<String>,
    pub meals: Vec<MealTag>,
}

impl RunInputs {
    pub fn new(meals: Vec<MealTag>) -> Self {
        Self {
            run_id: RunId::new(),
            city: None,
            food_preferences: None,
            constraints: None,
            meals,
        }
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_preferences(mut self, preferences: impl Into<String>) -> Self {
        self.food_preferences = Some(preferences.into());
        self
    }

    pub fn with_constraints(mut self, constraints: impl Into<String>) -> Self {
        self.constraints = Some(constraints.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: WorkflowState,
    pub to: WorkflowState,
}

/// A collaborator failure the run continued past.
#[derive(Debug, Clone, Serialize)]
pub struct Degradation {
    pub component: String,
    pub reason: String,
}

/// Per-stage bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub stage: Stage,
    pub attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Why a run ended in FAILED, with the context as it stood.
#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub stage: Option<Stage>,
    pub error: String,
    pub context: ContextSnapshot,
}

/// Result of executing one run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub run_id: RunId,
    pub city: String,
    pub state: WorkflowState,
    pub transitions: Vec<Transition>,
    pub degradations: Vec<Degradation>,
    pub stages: Vec<StageRun>,
    pub anchors: Vec<LocationAnchor>,
    pub venue_count: usize,
    pub selection: Option<SelectionResult>,
    pub route_plan: Option<RoutePlan>,
    pub narrative: Option<Narrative>,
    pub failure: Option<StageFailure>,
    pub elapsed_ms: u64,
}

impl WorkflowReport {
    fn new(run_id: RunId, city: String) -> Self {
        Self {
            run_id,
            city,
            state: WorkflowState::Init,
            transitions: Vec::new(),
            degradations: Vec::new(),
            stages: Vec::new(),
            anchors: Vec::new(),
            venue_count: 0,
            selection: None,
            route_plan: None,
            narrative: None,
            failure: None,
            elapsed_ms: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == WorkflowState::Done
    }

    /// The narrative as a sectioned text report.
    pub fn formatted_narrative(&self) -> Option<String> {
        self.narrative.as_ref().map(|n| n.format(&self.city))
    }

    /// Plain-language account of what succeeded, what degraded and what
    /// blocked completion.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();

        let mut done = vec![
            format!("{} calendar anchor(s) located", self.anchors.len()),
            format!("{} venue(s) catalogued", self.venue_count),
        ];
        if let Some(selection) = &self.selection {
            let meals: Vec<_> = selection.selected_meals.iter().map(MealTag::as_str).collect();
            if meals.is_empty() {
                done.push("no meals could be matched to a venue".to_string());
            } else {
                done.push(format!("venues selected for {}", meals.join(", ")));
            }
        }
        if let Some(plan) = &self.route_plan {
            done.push(format!("route planned with {} segment(s)", plan.segments.len()));
        }
        if self.narrative.is_some() {
            done.push("day plan written".to_string());
        }
        lines.push(format!("Succeeded: {}.", done.join("; ")));

        for d in &self.degradations {
            lines.push(format!("Degraded: {}: {}", d.component, d.reason));
        }

        if let Some(failure) = &self.failure {
            let at = failure
                .stage
                .map(|s| format!("the {s} stage"))
                .unwrap_or_else(|| "the run".to_string());
            lines.push(format!("Blocked: {at} failed: {}", failure.error));
        }

        lines.join("\n")
    }
}

/// Tracks the state machine for one run and publishes its events.
struct RunTracker {
    run_id: RunId,
    bus: Arc<EventBus>,
    report: WorkflowReport,
}

impl RunTracker {
    /// Move to the successor state.
    fn advance(&mut self) {
        if let Some(to) = self.report.state.next() {
            self.transition(to);
        }
    }

    fn transition(&mut self, to: WorkflowState) {
        let from = self.report.state;
        info!(run_id = %self.run_id, from = %from, to = %to, "State transition");
        self.report.transitions.push(Transition { from, to });
        self.report.state = to;
        self.bus.publish(WorkflowEvent::StateChanged {
            run_id: self.run_id.clone(),
            from,
            to,
        });
    }

    fn degrade(&mut self, component: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(run_id = %self.run_id, component, reason = %reason, "Continuing with reduced data");
        self.bus.publish(WorkflowEvent::Degraded {
            run_id: self.run_id.clone(),
            component: component.to_string(),
            reason: reason.clone(),
        });
        self.report.degradations.push(Degradation {
            component: component.to_string(),
            reason,
        });
    }
}

/// Drives one run through INIT → LOCATING → CATALOGING → SELECTING →
/// PLANNING → PRESENTING → DONE, or into FAILED.
///
/// Owns one agent per stage; a coordinator runs one workflow at a time.
pub struct WorkflowCoordinator {
    llm: Arc<dyn LlmClient>,
    places: Arc<dyn PlacesService>,
    model: ModelConfig,
    workflow: WorkflowConfig,
    places_timeout: Duration,
    calendar_timeout: Duration,
    cache: Option<Arc<ResponseCache>>,
    event_bus: Arc<EventBus>,
    agents: [StageAgent; 3],
}

fn slot(stage: Stage) -> usize {
    match stage {
        Stage::Select => 0,
        Stage::Plan => 1,
        Stage::Present => 2,
    }
}

impl WorkflowCoordinator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        places: Arc<dyn PlacesService>,
        config: &AppConfig,
    ) -> Self {
        let stage_timeout = Duration::from_secs(config.workflow.stage_timeout_secs);
        Self {
            llm,
            places,
            model: config.model.clone(),
            workflow: config.workflow.clone(),
            places_timeout: Duration::from_secs(config.places.timeout_secs),
            calendar_timeout: Duration::from_secs(
                config.calendar.as_ref().map_or(10, |c| c.timeout_secs),
            ),
            cache: None,
            event_bus: Arc::new(EventBus::default()),
            agents: Stage::ALL.map(|s| StageAgent::new(s, stage_timeout)),
        }
    }

    /// Response cache to purge at the start of every run.
    pub fn with_cache(mut self, cache: Option<Arc<ResponseCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn agent(&self, stage: Stage) -> &StageAgent {
        &self.agents[slot(stage)]
    }

    /// Execute one run.
    ///
    /// Collaborator failures before the first stage degrade the run; a
    /// stage that cannot produce a conformant result ends it in FAILED.
    /// Both outcomes come back as `Ok(report)`. `Err` means the inputs were
    /// unusable and nothing ran.
    pub async fn run(
        &mut self,
        inputs: RunInputs,
        calendar: Option<&dyn CalendarSource>,
    ) -> Result<WorkflowReport> {
        let mut meals = inputs.meals.clone();
        meals.sort();
        meals.dedup();
        if meals.is_empty() {
            return Err(ForageError::InvalidInput(
                "at least one meal must be requested".into(),
            ));
        }
        let city = inputs
            .city
            .as_deref()
            .unwrap_or(&self.workflow.city)
            .trim()
            .to_string();
        if city.is_empty() {
            return Err(ForageError::InvalidInput("city must not be empty".into()));
        }

        let start = Instant::now();
        let run_id = inputs.run_id.clone();
        let mut tracker = RunTracker {
            run_id: run_id.clone(),
            bus: self.event_bus.clone(),
            report: WorkflowReport::new(run_id.clone(), city.clone()),
        };

        info!(run_id = %run_id, city = %city, meals = ?meals, "Starting workflow run");
        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
        });

        // INIT: nothing from a previous run may leak into this one.
        for agent in &mut self.agents {
            agent.reset();
        }
        if let Some(cache) = &self.cache {
            match cache.purge().await {
                Ok(n) => debug!(entries = n, "Response cache cleared"),
                Err(e) => tracker.degrade("cache", e.to_string()),
            }
        }

        let mut ctx = WorkflowContext::with_defaults(&self.workflow);
        ctx.set(keys::CITY, json!(city));
        if let Some(p) = inputs.food_preferences.filter(|p| !p.trim().is_empty()) {
            ctx.set(keys::FOOD_PREFERENCES, json!(p));
        }
        if let Some(c) = inputs.constraints.filter(|c| !c.trim().is_empty()) {
            ctx.set(keys::CONSTRAINTS, json!(c));
        }
        ctx.set_typed(keys::REQUESTED_MEALS, &meals);
        let shared = SharedContext::new(ctx);

        // LOCATING
        tracker.advance();
        let (entries, anchors) = self.locate(&city, calendar, &mut tracker).await;
        shared.set_typed(keys::CALENDAR_ENTRIES, &entries).await;
        shared.set_typed(keys::ANCHORS, &anchors).await;
        tracker.report.anchors = anchors;

        // CATALOGING
        tracker.advance();
        let catalog = CatalogBuilder::new(self.places.as_ref(), city.clone(), self.places_timeout)
            .radius(self.workflow.search_radius_m)
            .limit(self.workflow.venue_limit)
            .build()
            .await;
        match catalog {
            Ok(catalog) => {
                if catalog.venues.is_empty() {
                    tracker.degrade("catalog", format!("no food venues found near {city}"));
                }
                shared.set_typed(keys::VENUES, &catalog.venues).await;
                shared.set_typed(keys::VENUE_STATS, &catalog.stat_lines()).await;
                tracker.report.venue_count = catalog.venues.len();
            }
            Err(e) => tracker.degrade("catalog", e.to_string()),
        }

        // SELECTING, PLANNING, PRESENTING
        for stage in Stage::ALL {
            tracker.advance();
            let (run, outcome) = self.run_stage(stage, &shared).await;
            tracker.report.stages.push(run);
            match outcome {
                Ok(output) => shared.apply(&output).await,
                Err(e) => {
                    error!(run_id = %run_id, stage = %stage, error = %e, "Stage failed");
                    tracker.transition(WorkflowState::Failed);
                    self.event_bus.publish(WorkflowEvent::RunFailed {
                        run_id: run_id.clone(),
                        stage: Some(stage),
                        error: e.to_string(),
                    });
                    let mut report = tracker.report;
                    report.failure = Some(StageFailure {
                        stage: Some(stage),
                        error: e.to_string(),
                        context: shared.snapshot().await,
                    });
                    report.elapsed_ms = start.elapsed().as_millis() as u64;
                    return Ok(report);
                }
            }
        }

        tracker.advance();
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let snapshot = shared.snapshot().await;
        let mut report = tracker.report;
        report.selection = snapshot.selection();
        report.route_plan = snapshot.route_plan();
        report.narrative = snapshot.narrative();
        report.elapsed_ms = elapsed_ms;

        info!(run_id = %run_id, elapsed_ms, "Workflow run complete");
        self.event_bus.publish(WorkflowEvent::RunComplete { run_id, elapsed_ms });
        Ok(report)
    }

    async fn locate(
        &self,
        city: &str,
        calendar: Option<&dyn CalendarSource>,
        tracker: &mut RunTracker,
    ) -> (Vec<CalendarEntry>, Vec<LocationAnchor>) {
        let Some(calendar) = calendar else {
            debug!("No calendar configured");
            return (Vec::new(), Vec::new());
        };

        let entries = match tokio::time::timeout(self.calendar_timeout, calendar.entries()).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                tracker.degrade("calendar", e.to_string());
                return (Vec::new(), Vec::new());
            }
            Err(_) => {
                tracker.degrade(
                    "calendar",
                    format!(
                        "{} timed out after {}s",
                        calendar.describe(),
                        self.calendar_timeout.as_secs()
                    ),
                );
                return (Vec::new(), Vec::new());
            }
        };

        let extraction = LocationExtractor::new(self.places.as_ref(), city, self.places_timeout)
            .extract(&entries)
            .await;
        for skipped in extraction.lookup_failures() {
            tracker.degrade(
                "geocoder",
                format!("could not look up \"{}\"", skipped.description),
            );
        }
        info!(
            entries = entries.len(),
            anchors = extraction.anchors.len(),
            "Calendar anchors located"
        );
        (entries, extraction.anchors)
    }

    /// Rebuild the stage's instruction from the current context, invoke it,
    /// and validate, sending corrective follow-ups within the retry budget.
    async fn run_stage(
        &mut self,
        stage: Stage,
        shared: &SharedContext,
    ) -> (StageRun, Result<StageOutput>) {
        let snapshot = shared.snapshot().await;
        let instruction = prompts::render(stage, &snapshot);
        let validator = OutputValidator::for_stage(stage, &snapshot);
        let max_attempts = 1 + self.workflow.max_stage_retries;
        let llm = self.llm.clone();
        let model = self.model.clone();
        let bus = self.event_bus.clone();

        bus.publish(WorkflowEvent::InstructionRendered {
            stage,
            chars: instruction.len(),
        });
        let agent = &mut self.agents[slot(stage)];
        agent.set_instruction(instruction);

        let mut run = StageRun {
            stage,
            attempts: 0,
            input_tokens: 0,
            output_tokens: 0,
        };
        let mut message = prompts::kickoff(stage, &snapshot);
        let mut last_issues = Vec::new();

        for attempt in 1..=max_attempts {
            run.attempts = attempt;
            bus.publish(WorkflowEvent::StageAttempt { stage, attempt });
            info!(agent = agent.name(), attempt, "Running stage");

            let reply = match agent.invoke(llm.as_ref(), &model, &message, &bus).await {
                Ok(reply) => reply,
                Err(e) => return (run, Err(e)),
            };
            run.input_tokens += reply.input_tokens;
            run.output_tokens += reply.output_tokens;

            match validator.validate(&reply.text) {
                ValidationResult::Valid(output) => {
                    info!(agent = agent.name(), attempts = attempt, "Stage completed");
                    bus.publish(WorkflowEvent::StageCompleted {
                        stage,
                        attempts: attempt,
                    });
                    return (run, Ok(output));
                }
                ValidationResult::NoResult => {
                    last_issues = vec!["the reply contained no JSON result".to_string()];
                    message = prompts::nudge();
                }
                ValidationResult::Invalid { issues } => {
                    message = prompts::corrective(&issues);
                    last_issues = issues;
                }
            }

            warn!(agent = agent.name(), attempt, issues = ?last_issues, "Stage reply rejected");
            bus.publish(WorkflowEvent::StageRejected {
                stage,
                attempt,
                issues: last_issues.clone(),
            });
        }

        (
            run,
            Err(ForageError::Validation {
                stage: stage.to_string(),
                issues: last_issues,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forage_core::types::Role;
    use forage_test_utils::{
        replies, sample_calendar, sample_places, test_config, MockLlm, StaticCalendar,
        StaticPlaces,
    };

    fn coordinator(
        llm: &MockLlm,
        places: StaticPlaces,
        dir: &std::path::Path,
    ) -> WorkflowCoordinator {
        WorkflowCoordinator::new(Arc::new(llm.clone()), Arc::new(places), &test_config(dir))
    }

    fn happy_llm() -> MockLlm {
        MockLlm::new()
            .with_json(replies::selection(&[("lunch", "Fitzbillies")]))
            .with_json(replies::route(&["lunch"], &[("anchor:1", "lunch"), ("lunch", "anchor:2")]))
            .with_json(replies::narrative())
    }

    #[tokio::test]
    async fn test_full_run_reaches_done() {
        let dir = tempfile::tempdir().unwrap();
        let llm = happy_llm();
        let mut coord = coordinator(&llm, sample_places(), dir.path());
        let calendar = StaticCalendar::new(sample_calendar());

        let report = coord
            .run(RunInputs::new(vec![MealTag::Lunch]), Some(&calendar))
            .await
            .unwrap();

        assert!(report.is_done(), "{}", report.summary());
        let states: Vec<_> = report.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                WorkflowState::Locating,
                WorkflowState::Cataloging,
                WorkflowState::Selecting,
                WorkflowState::Planning,
                WorkflowState::Presenting,
                WorkflowState::Done
            ]
        );
        assert_eq!(report.anchors.len(), 2);
        assert_eq!(report.venue_count, 7);
        assert!(report.degradations.is_empty());
        let selection = report.selection.as_ref().unwrap();
        assert_eq!(selection.venue_for(MealTag::Lunch).unwrap().category, "cafe");
        assert_eq!(report.route_plan.as_ref().unwrap().segments.len(), 2);
        assert!(report.formatted_narrative().unwrap().contains("**Your Cambridge Food Day:**"));
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_plan_instruction_sees_merged_selection() {
        let dir = tempfile::tempdir().unwrap();
        let llm = happy_llm();
        let mut coord = coordinator(&llm, sample_places(), dir.path());
        let calendar = StaticCalendar::new(sample_calendar());
        coord
            .run(RunInputs::new(vec![MealTag::Lunch]), Some(&calendar))
            .await
            .unwrap();

        let requests = llm.requests();
        let plan_prompt = requests[1].system_prompt().unwrap();
        assert!(plan_prompt.contains("- lunch (12:30): Fitzbillies [cafe]"));
        assert!(plan_prompt.contains("- anchor:1 -> lunch"));
        // stages do not share conversation history
        assert_eq!(requests[1].messages.len(), 2);
        assert_eq!(coord.agent(Stage::Plan).instruction(), plan_prompt);
    }

    #[tokio::test]
    async fn test_invalid_selection_gets_corrected() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new()
            .with_json(replies::selection(&[("dinner", "Dishoom")]))
            .with_json(replies::selection(&[("lunch", "Dishoom")]))
            .with_json(replies::route(&["lunch"], &[]))
            .with_json(replies::narrative());
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path());

        let report = coord
            .run(RunInputs::new(vec![MealTag::Lunch]), None)
            .await
            .unwrap();

        assert!(report.is_done());
        assert_eq!(report.stages[0].attempts, 2);
        let retry = &llm.requests()[1];
        assert!(retry.last_user().unwrap().contains("'dinner' was not requested"));
        assert_eq!(retry.messages[2].role, Role::Assistant);
        let selection = report.selection.unwrap();
        assert_eq!(selection.selected_meals, vec![MealTag::Lunch]);
    }

    #[tokio::test]
    async fn test_chatter_gets_nudged() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new()
            .with_json(replies::selection(&[("lunch", "The Eagle")]))
            .with_json(replies::route(&["lunch"], &[]))
            .with_text("Let me think about how to describe this day...")
            .with_json(replies::narrative());
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path());

        let report = coord
            .run(RunInputs::new(vec![MealTag::Lunch]), None)
            .await
            .unwrap();
        assert!(report.is_done());
        assert_eq!(report.stages[2].attempts, 2);
        assert!(llm.requests()[3].last_user().unwrap().contains("not given a result"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let bad = replies::selection(&[("breakfast", "Fitzbillies")]);
        let llm = MockLlm::new()
            .with_json(bad.clone())
            .with_json(bad.clone())
            .with_json(bad);
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path());
        let bus = coord.event_bus();
        let mut rx = bus.subscribe();

        let report = coord
            .run(RunInputs::new(vec![MealTag::Lunch]), None)
            .await
            .unwrap();

        assert_eq!(report.state, WorkflowState::Failed);
        assert_eq!(llm.call_count(), 3);
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.stage, Some(Stage::Select));
        assert!(failure.error.contains("not requested"));
        assert!(failure.context.selection().is_none());
        assert!(report.narrative.is_none());
        assert!(report.summary().contains("Blocked: the select stage failed"));

        let mut rejected = 0;
        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WorkflowEvent::StageRejected { .. } => rejected += 1,
                WorkflowEvent::RunFailed { stage, .. } => failed = stage == Some(Stage::Select),
                _ => {}
            }
        }
        assert_eq!(rejected, 3);
        assert!(failed);
    }

    #[tokio::test]
    async fn test_transport_error_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new()
            .with_json(replies::selection(&[("lunch", "The Eagle")]))
            .with_error("connection refused");
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path());

        let report = coord
            .run(RunInputs::new(vec![MealTag::Lunch]), None)
            .await
            .unwrap();

        assert_eq!(report.state, WorkflowState::Failed);
        assert_eq!(llm.call_count(), 2);
        let failure = report.failure.unwrap();
        assert_eq!(failure.stage, Some(Stage::Plan));
        // the completed selection survives in the failure snapshot
        let selection = failure.context.selection().unwrap();
        assert_eq!(selection.venue_for(MealTag::Lunch).unwrap().name, "The Eagle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new().with_delay(Duration::from_secs(30), "{}");
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path());
        let report = coord
            .run(RunInputs::new(vec![MealTag::Dinner]), None)
            .await
            .unwrap();
        assert_eq!(report.state, WorkflowState::Failed);
        assert!(report.failure.unwrap().error.contains("timed out after 5s"));
    }

    #[tokio::test]
    async fn test_unknown_city_degrades_to_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new()
            .with_json(replies::empty_selection("No venues were found."))
            .with_json(replies::route(&[], &[]))
            .with_json(replies::narrative());
        let mut coord = coordinator(&llm, StaticPlaces::new(), dir.path());

        let report = coord
            .run(RunInputs::new(vec![MealTag::Lunch]).with_city("Atlantis"), None)
            .await
            .unwrap();

        assert!(report.is_done());
        assert_eq!(report.venue_count, 0);
        assert_eq!(report.degradations[0].component, "catalog");
        assert!(report.selection.unwrap().selected_meals.is_empty());
        assert!(llm.requests()[0].system_prompt().unwrap().contains("Venues:\nNone"));
    }

    #[tokio::test]
    async fn test_calendar_failure_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new()
            .with_json(replies::selection(&[("lunch", "The Eagle")]))
            .with_json(replies::route(&["lunch"], &[]))
            .with_json(replies::narrative());
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path());
        let calendar = StaticCalendar::failing();

        let report = coord
            .run(RunInputs::new(vec![MealTag::Lunch]), Some(&calendar))
            .await
            .unwrap();
        assert!(report.is_done());
        assert!(report.anchors.is_empty());
        assert_eq!(report.degradations[0].component, "calendar");
        assert!(report.summary().contains("Degraded: calendar"));
    }

    #[tokio::test]
    async fn test_no_meals_still_routes_between_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new()
            .with_json(replies::empty_selection("Nothing suits a vegan breakfast."))
            .with_json(replies::route(&[], &[("anchor:1", "anchor:2")]))
            .with_json(replies::narrative());
        let mut coord = coordinator(&llm, sample_places(), dir.path());
        let calendar = StaticCalendar::new(sample_calendar());

        let report = coord
            .run(RunInputs::new(vec![MealTag::Breakfast]), Some(&calendar))
            .await
            .unwrap();

        assert!(report.is_done(), "{}", report.summary());
        assert!(report.selection.as_ref().unwrap().selected_meals.is_empty());
        let segments = &report.route_plan.as_ref().unwrap().segments;
        assert_eq!(segments.len(), 1);
        assert_eq!((segments[0].from.as_str(), segments[0].to.as_str()), ("anchor:1", "anchor:2"));
        assert_eq!(report.stages[1].attempts, 1);
        let plan_prompt = llm.requests()[1].system_prompt().unwrap().to_string();
        assert!(plan_prompt.contains("- anchor:1 -> anchor:2"));
    }

    #[tokio::test]
    async fn test_rejects_empty_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new();
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path());
        assert!(matches!(
            coord.run(RunInputs::new(vec![]), None).await,
            Err(ForageError::InvalidInput(_))
        ));
        assert!(matches!(
            coord.run(RunInputs::new(vec![MealTag::Lunch]).with_city("  "), None).await,
            Err(ForageError::InvalidInput(_))
        ));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_second_run_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let llm = MockLlm::new()
            .with_json(replies::selection(&[("lunch", "The Eagle")]))
            .with_json(replies::route(&["lunch"], &[]))
            .with_json(replies::narrative())
            .with_error("HTTP 500: boom");
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path());

        let first = coord.run(RunInputs::new(vec![MealTag::Lunch]), None).await.unwrap();
        assert!(first.is_done());

        let second = coord.run(RunInputs::new(vec![MealTag::Lunch]), None).await.unwrap();
        assert_eq!(second.state, WorkflowState::Failed);
        let ctx = &second.failure.unwrap().context;
        assert!(ctx.selection().is_none());
        assert!(ctx.route_plan().is_none());
        // fresh agent history: system prompt plus the kickoff message only
        assert_eq!(llm.requests()[3].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_purged_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join(".cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("stale.json"), "{}").unwrap();

        let llm = MockLlm::new().with_error("offline");
        let mut coord = coordinator(&llm, StaticPlaces::cambridge(), dir.path())
            .with_cache(Some(Arc::new(ResponseCache::new(&cache_dir))));
        coord.run(RunInputs::new(vec![MealTag::Lunch]), None).await.unwrap();
        assert!(!cache_dir.join("stale.json").exists());
    }
}
