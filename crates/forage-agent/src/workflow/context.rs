use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::warn;

use forage_core::config::WorkflowConfig;
use forage_core::domain::{
    CalendarEntry, LocationAnchor, MealSelection, MealTag, Narrative, RoutePlan, SelectionResult,
    VenueCandidate,
};

use super::stage::StageOutput;

/// Well-known context keys.
pub mod keys {
    pub const CITY: &str = "city";
    pub const FOOD_PREFERENCES: &str = "food_preferences";
    pub const CONSTRAINTS: &str = "constraints";
    pub const REQUESTED_MEALS: &str = "requested_meals";
    pub const VENUES: &str = "venues";
    pub const VENUE_STATS: &str = "venue_stats";
    pub const ANCHORS: &str = "anchors";
    pub const CALENDAR_ENTRIES: &str = "calendar_entries";
    /// Meal tag -> selection, for every requested meal the selector answered.
    pub const SELECTED_RESTAURANTS: &str = "selected_restaurants";
    pub const SELECTED_MEALS: &str = "selected_meals";
    pub const SELECTION_REASONING: &str = "selection_reasoning";
    pub const ROUTE_PLAN: &str = "route_plan";
    pub const NARRATIVE: &str = "narrative";
}

/// The run's shared key/value context.
///
/// Every stage reads its inputs from here and merges its outputs back.
/// Values are JSON; typed views are available through [`ContextSnapshot`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowContext {
    data: BTreeMap<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with the workflow defaults and empty collections.
    pub fn with_defaults(workflow: &WorkflowConfig) -> Self {
        let mut ctx = Self::new();
        ctx.set(keys::CITY, json!(workflow.city));
        ctx.set(keys::FOOD_PREFERENCES, json!(workflow.food_preferences));
        ctx.set(keys::CONSTRAINTS, json!(workflow.constraints));
        ctx.set(keys::REQUESTED_MEALS, json!([]));
        ctx.set(keys::VENUES, json!([]));
        ctx.set(keys::VENUE_STATS, json!([]));
        ctx.set(keys::ANCHORS, json!([]));
        ctx.set(keys::CALENDAR_ENTRIES, json!([]));
        ctx.set(keys::SELECTED_RESTAURANTS, json!({}));
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Value for `key`, or `default` when absent or null.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        match self.data.get(key) {
            Some(Value::Null) | None => default,
            Some(v) => v.clone(),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Store any serializable value.
    pub fn set_typed<T: Serialize>(&mut self, key: impl Into<String>, value: &T) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.data.insert(key.into(), value);
    }

    /// Shallow merge: each top-level key in `partial` replaces the existing value.
    pub fn update(&mut self, partial: Map<String, Value>) {
        for (k, v) in partial {
            self.data.insert(k, v);
        }
    }

    pub fn merge(&mut self, other: &WorkflowContext) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    /// Merge a stage's result. Selection entries are keyed by meal, so a
    /// later result for the same meal replaces the earlier one.
    pub fn apply(&mut self, output: &StageOutput) {
        let mut partial = Map::new();
        match output {
            StageOutput::Selection(selection) => {
                let mut by_meal = match self.get(keys::SELECTED_RESTAURANTS) {
                    Some(Value::Object(existing)) => existing.clone(),
                    _ => Map::new(),
                };
                for choice in &selection.selections {
                    let value = serde_json::to_value(choice).unwrap_or(Value::Null);
                    by_meal.insert(choice.meal.as_str().to_string(), value);
                }
                partial.insert(keys::SELECTED_RESTAURANTS.into(), Value::Object(by_meal));
                partial.insert(keys::SELECTED_MEALS.into(), json!(selection.selected_meals));
                partial.insert(
                    keys::SELECTION_REASONING.into(),
                    json!(selection.selection_reasoning),
                );
            }
            StageOutput::Route(plan) => {
                partial.insert(
                    keys::ROUTE_PLAN.into(),
                    serde_json::to_value(plan).unwrap_or(Value::Null),
                );
            }
            StageOutput::Narrative(narrative) => {
                partial.insert(
                    keys::NARRATIVE.into(),
                    serde_json::to_value(narrative).unwrap_or(Value::Null),
                );
            }
        }
        self.update(partial);
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            data: Arc::new(self.data.clone()),
        }
    }
}

/// Handle shared by the coordinator and completion handlers.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    inner: Arc<RwLock<WorkflowContext>>,
}

impl SharedContext {
    pub fn new(ctx: WorkflowContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ctx)),
        }
    }

    pub async fn snapshot(&self) -> ContextSnapshot {
        self.inner.read().await.snapshot()
    }

    pub async fn update(&self, partial: Map<String, Value>) {
        self.inner.write().await.update(partial);
    }

    pub async fn set_typed<T: Serialize>(&self, key: &str, value: &T) {
        self.inner.write().await.set_typed(key, value);
    }

    /// Read-modify-write under a single write lock.
    pub async fn apply(&self, output: &StageOutput) {
        self.inner.write().await.apply(output);
    }
}

/// Immutable view of the context at one point in time.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    data: Arc<BTreeMap<String, Value>>,
}

impl Serialize for ContextSnapshot {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        self.data.as_ref().serialize(serializer)
    }
}

impl ContextSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    fn typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.data.get(key).filter(|v| !v.is_null())?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "Context value has unexpected shape");
                None
            }
        }
    }

    fn text(&self, key: &str) -> String {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn city(&self) -> String {
        self.text(keys::CITY)
    }

    pub fn food_preferences(&self) -> String {
        self.text(keys::FOOD_PREFERENCES)
    }

    pub fn constraints(&self) -> String {
        self.text(keys::CONSTRAINTS)
    }

    pub fn requested_meals(&self) -> Vec<MealTag> {
        self.typed(keys::REQUESTED_MEALS).unwrap_or_default()
    }

    pub fn venues(&self) -> Vec<VenueCandidate> {
        self.typed(keys::VENUES).unwrap_or_default()
    }

    pub fn venue_stats(&self) -> Vec<String> {
        self.typed(keys::VENUE_STATS).unwrap_or_default()
    }

    pub fn anchors(&self) -> Vec<LocationAnchor> {
        self.typed(keys::ANCHORS).unwrap_or_default()
    }

    pub fn calendar_entries(&self) -> Vec<CalendarEntry> {
        self.typed(keys::CALENDAR_ENTRIES).unwrap_or_default()
    }

    /// The merged selection, once the Select stage has completed.
    pub fn selection(&self) -> Option<SelectionResult> {
        let selected_meals: Vec<MealTag> = self.typed(keys::SELECTED_MEALS)?;
        let by_meal: BTreeMap<String, MealSelection> =
            self.typed(keys::SELECTED_RESTAURANTS).unwrap_or_default();
        let mut selections: Vec<MealSelection> = by_meal.into_values().collect();
        selections.sort_by_key(|s| s.meal);
        Some(SelectionResult {
            selected_meals,
            selections,
            selection_reasoning: self.text(keys::SELECTION_REASONING),
        })
    }

    pub fn route_plan(&self) -> Option<RoutePlan> {
        self.typed(keys::ROUTE_PLAN)
    }

    pub fn narrative(&self) -> Option<Narrative> {
        self.typed(keys::NARRATIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forage_core::domain::Venue;

    fn selection(meal: MealTag, venue: &str) -> SelectionResult {
        SelectionResult {
            selected_meals: vec![meal],
            selections: vec![MealSelection {
                meal,
                venue: Some(Venue {
                    name: venue.into(),
                    category: "pub".into(),
                    latitude: 52.2039,
                    longitude: 0.1182,
                }),
                justification: "close by".into(),
            }],
            selection_reasoning: "nearest".into(),
        }
    }

    #[test]
    fn test_defaults() {
        let ctx = WorkflowContext::with_defaults(&WorkflowConfig::default());
        let snap = ctx.snapshot();
        assert_eq!(snap.city(), "Cambridge, England");
        assert_eq!(snap.constraints(), "no specific constraints");
        assert!(snap.venues().is_empty());
        assert!(snap.anchors().is_empty());
        assert!(snap.selection().is_none());
        assert!(snap.route_plan().is_none());
    }

    #[test]
    fn test_shallow_update_replaces_top_level_keys() {
        let mut ctx = WorkflowContext::new();
        ctx.set("a", json!({"x": 1, "y": 2}));
        ctx.set("b", json!("keep"));
        let mut partial = Map::new();
        partial.insert("a".into(), json!({"x": 3}));
        ctx.update(partial);
        assert_eq!(ctx.get("a"), Some(&json!({"x": 3})));
        assert_eq!(ctx.get_str("b"), Some("keep"));
    }

    #[test]
    fn test_get_or_treats_null_as_missing() {
        let mut ctx = WorkflowContext::new();
        ctx.set("k", Value::Null);
        assert_eq!(ctx.get_or("k", json!(7)), json!(7));
        assert_eq!(ctx.get_or("missing", json!("d")), json!("d"));
    }

    #[test]
    fn test_apply_selection_is_last_write_wins_per_meal() {
        let mut ctx = WorkflowContext::with_defaults(&WorkflowConfig::default());
        ctx.apply(&StageOutput::Selection(selection(MealTag::Lunch, "The Eagle")));
        ctx.apply(&StageOutput::Selection(selection(MealTag::Lunch, "The Mill")));

        let snap = ctx.snapshot();
        let merged = snap.selection().unwrap();
        assert_eq!(merged.selected_meals, vec![MealTag::Lunch]);
        assert_eq!(merged.selections.len(), 1);
        assert_eq!(merged.venue_for(MealTag::Lunch).unwrap().name, "The Mill");
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let mut ctx = WorkflowContext::with_defaults(&WorkflowConfig::default());
        let before = ctx.snapshot();
        ctx.set(keys::CITY, json!("Oxford, England"));
        assert_eq!(before.city(), "Cambridge, England");
        assert_eq!(ctx.snapshot().city(), "Oxford, England");
    }

    #[tokio::test]
    async fn test_shared_context_apply() {
        let shared = SharedContext::new(WorkflowContext::with_defaults(&WorkflowConfig::default()));
        let handle = shared.clone();
        handle
            .apply(&StageOutput::Selection(selection(MealTag::Dinner, "Dishoom")))
            .await;
        let snap = shared.snapshot().await;
        assert_eq!(
            snap.selection().unwrap().venue_for(MealTag::Dinner).unwrap().name,
            "Dishoom"
        );
    }
}
