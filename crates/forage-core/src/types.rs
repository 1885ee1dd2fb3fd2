use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message in a stage conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text)
    }

    fn with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ContentFilter,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// JSON-schema response format requested from the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: serde_json::Value,
}

/// One of the three ordered units of LLM work.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Select,
    Plan,
    Present,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Select, Stage::Plan, Stage::Present];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Plan => "plan",
            Self::Present => "present",
        }
    }

    /// The agent persona name used in logs and reports.
    pub fn agent_name(&self) -> &'static str {
        match self {
            Self::Select => "restaurant_selector",
            Self::Plan => "route_planner",
            Self::Present => "companion",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinator state machine states.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Init,
    Locating,
    Cataloging,
    Selecting,
    Planning,
    Presenting,
    Done,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The LLM stage driven while in this state, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Selecting => Some(Stage::Select),
            Self::Planning => Some(Stage::Plan),
            Self::Presenting => Some(Stage::Present),
            _ => None,
        }
    }

    /// The only legal successor on the success path.
    pub fn next(&self) -> Option<WorkflowState> {
        match self {
            Self::Init => Some(Self::Locating),
            Self::Locating => Some(Self::Cataloging),
            Self::Cataloging => Some(Self::Selecting),
            Self::Selecting => Some(Self::Planning),
            Self::Planning => Some(Self::Presenting),
            Self::Presenting => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Locating => "LOCATING",
            Self::Cataloging => "CATALOGING",
            Self::Selecting => "SELECTING",
            Self::Planning => "PLANNING",
            Self::Presenting => "PRESENTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Run started.
    RunStarted { run_id: RunId },
    /// Coordinator moved between states.
    StateChanged {
        run_id: RunId,
        from: WorkflowState,
        to: WorkflowState,
    },
    /// A collaborator failed and the run continues with reduced data.
    Degraded {
        run_id: RunId,
        component: String,
        reason: String,
    },
    /// Stage instructions were rebuilt from the current context.
    InstructionRendered { stage: Stage, chars: usize },
    /// A stage invocation is about to be made.
    StageAttempt { stage: Stage, attempt: u32 },
    /// A stage reply did not conform and will be corrected or abandoned.
    StageRejected {
        stage: Stage,
        attempt: u32,
        issues: Vec<String>,
    },
    /// A stage produced a conformant result that was merged into the context.
    StageCompleted { stage: Stage, attempts: u32 },
    /// Text streaming from the LLM.
    TextDelta(String),
    /// Token usage update.
    UsageUpdate { input_tokens: u64, output_tokens: u64 },
    /// Run reached DONE.
    RunComplete { run_id: RunId, elapsed_ms: u64 },
    /// Run reached FAILED.
    RunFailed {
        run_id: RunId,
        stage: Option<Stage>,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_successors_are_linear() {
        let mut state = WorkflowState::Init;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            visited.push(next);
            state = next;
        }
        assert_eq!(
            visited,
            vec![
                WorkflowState::Init,
                WorkflowState::Locating,
                WorkflowState::Cataloging,
                WorkflowState::Selecting,
                WorkflowState::Planning,
                WorkflowState::Presenting,
                WorkflowState::Done,
            ]
        );
        assert!(WorkflowState::Failed.next().is_none());
    }

    #[test]
    fn test_stage_for_state() {
        assert_eq!(WorkflowState::Selecting.stage(), Some(Stage::Select));
        assert_eq!(WorkflowState::Presenting.stage(), Some(Stage::Present));
        assert_eq!(WorkflowState::Locating.stage(), None);
    }

    #[test]
    fn test_state_serializes_screaming() {
        let json = serde_json::to_string(&WorkflowState::Cataloging).unwrap();
        assert_eq!(json, "\"CATALOGING\"");
        assert_eq!(WorkflowState::Done.to_string(), "DONE");
    }
}
