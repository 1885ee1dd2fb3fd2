use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use forage_core::config::ModelConfig;
use forage_core::domain::{MealTag, Narrative, RoutePlan, SelectionResult};
use forage_core::error::{ForageError, Result};
use forage_core::event::EventBus;
use forage_core::traits::LlmClient;
use forage_core::types::{
    ChatMessage, ResponseFormat, Stage, StopReason, StreamDelta, WorkflowEvent,
};

/// The typed result of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Selection(SelectionResult),
    Route(RoutePlan),
    Narrative(Narrative),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Selection(_) => Stage::Select,
            Self::Route(_) => Stage::Plan,
            Self::Narrative(_) => Stage::Present,
        }
    }
}

fn venue_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "category": {"type": "string"},
            "latitude": {"type": "number"},
            "longitude": {"type": "number"}
        },
        "required": ["name", "category", "latitude", "longitude"],
        "additionalProperties": false
    })
}

/// Strict JSON schema the model is asked to answer in for `stage`.
pub fn response_format(stage: Stage) -> ResponseFormat {
    let meals: Vec<&str> = MealTag::ALL.iter().map(MealTag::as_str).collect();
    let schema = match stage {
        Stage::Select => json!({
            "type": "object",
            "properties": {
                "selected_meals": {"type": "array", "items": {"type": "string", "enum": meals}},
                "selections": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "meal": {"type": "string", "enum": meals},
                            "venue": {"anyOf": [venue_schema(), {"type": "null"}]},
                            "justification": {"type": "string"}
                        },
                        "required": ["meal", "venue", "justification"],
                        "additionalProperties": false
                    }
                },
                "selection_reasoning": {"type": "string"}
            },
            "required": ["selected_meals", "selections", "selection_reasoning"],
            "additionalProperties": false
        }),
        Stage::Plan => json!({
            "type": "object",
            "properties": {
                "route_overview": {"type": "string"},
                "selected_meals": {"type": "array", "items": {"type": "string", "enum": meals}},
                "segments": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "from": {"type": "string"},
                            "to": {"type": "string"},
                            "distance": {"type": "string"},
                            "directions": {"type": "string"},
                            "travel_time": {"type": "string"}
                        },
                        "required": ["from", "to", "distance", "directions", "travel_time"],
                        "additionalProperties": false
                    }
                },
                "transport_recommendations": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["route_overview", "selected_meals", "segments", "transport_recommendations"],
            "additionalProperties": false
        }),
        Stage::Present => {
            let properties: serde_json::Map<String, Value> = Narrative::FIELDS
                .iter()
                .map(|f| (f.to_string(), json!({"type": "string"})))
                .collect();
            json!({
                "type": "object",
                "properties": properties,
                "required": Narrative::FIELDS,
                "additionalProperties": false
            })
        }
    };

    let name = match stage {
        Stage::Select => "restaurant_selection",
        Stage::Plan => "route_plan",
        Stage::Present => "narrative",
    };
    ResponseFormat {
        name: name.to_string(),
        schema,
    }
}

/// Text and usage collected from one invocation.
#[derive(Debug, Clone, Default)]
pub struct StageReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub stop_reason: Option<StopReason>,
}

/// One stage's conversational unit.
///
/// Holds the current instruction text and this stage's own message history.
/// The instruction is replaced right before each stage runs; `reset` clears
/// everything a previous run left behind.
#[derive(Debug, Clone)]
pub struct StageAgent {
    stage: Stage,
    instruction: String,
    history: Vec<ChatMessage>,
    timeout: Duration,
}

impl StageAgent {
    pub fn new(stage: Stage, timeout: Duration) -> Self {
        Self {
            stage,
            instruction: String::new(),
            history: Vec::new(),
            timeout,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn name(&self) -> &'static str {
        self.stage.agent_name()
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn set_instruction(&mut self, instruction: String) {
        self.instruction = instruction;
    }

    pub fn reset(&mut self) {
        self.instruction.clear();
        self.history.clear();
    }

    fn messages(&self, user_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.instruction.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(user_message));
        messages
    }

    /// Send `user_message` under the current instruction and collect the reply.
    ///
    /// The whole call, request and stream, is bounded by the stage timeout.
    /// Both sides of the exchange are appended to the history on success.
    pub async fn invoke(
        &mut self,
        llm: &dyn LlmClient,
        config: &ModelConfig,
        user_message: &str,
        events: &EventBus,
    ) -> Result<StageReply> {
        let messages = self.messages(user_message);
        let format = response_format(self.stage);
        debug!(
            agent = self.name(),
            messages = messages.len(),
            instruction_chars = self.instruction.len(),
            "Invoking stage"
        );

        let call = async {
            let mut stream = llm.chat_stream(config, messages, Some(&format)).await?;
            let mut reply = StageReply::default();
            while let Some(delta) = stream.next().await {
                match delta? {
                    StreamDelta::TextDelta(text) => {
                        events.publish(WorkflowEvent::TextDelta(text.clone()));
                        reply.text.push_str(&text);
                    }
                    StreamDelta::Usage {
                        input_tokens,
                        output_tokens,
                    } => {
                        reply.input_tokens += input_tokens;
                        reply.output_tokens += output_tokens;
                    }
                    StreamDelta::Stop(reason) => reply.stop_reason = Some(reason),
                }
            }
            Ok::<_, ForageError>(reply)
        };

        let reply = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ForageError::StageTimeout {
                stage: self.stage.to_string(),
                timeout_secs: self.timeout.as_secs(),
            })??;

        if reply.stop_reason == Some(StopReason::MaxTokens) {
            warn!(agent = self.name(), "Reply truncated at max tokens");
        }
        events.publish(WorkflowEvent::UsageUpdate {
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
        });

        self.history.push(ChatMessage::user(user_message));
        self.history.push(ChatMessage::assistant(reply.text.clone()));
        Ok(reply)
    }
}
