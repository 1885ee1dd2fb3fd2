use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use forage_core::config::ModelConfig;
use forage_core::error::{ForageError, Result};
use forage_core::traits::LlmClient;
use forage_core::types::*;

use super::presets;
use crate::streaming::{SseEvent, SseStream};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, Groq, OpenRouter, etc.
///
/// When a [`ResponseFormat`] is given the request asks for strict
/// JSON-schema output.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OaiResponseFormat>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize, Debug, PartialEq)]
pub(crate) struct OaiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OaiResponseFormat {
    r#type: &'static str,
    json_schema: OaiJsonSchema,
}

#[derive(Serialize)]
struct OaiJsonSchema {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

// Response types
#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|msg| OaiMessage {
            role: match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: msg.content,
        })
        .collect()
}

fn is_o_series(model_id: &str) -> bool {
    model_id.starts_with("o1") || model_id.starts_with("o3") || model_id.starts_with("o4")
}

fn build_request(
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
    format: Option<ResponseFormat>,
) -> ChatRequest {
    // o-series models reject sampling parameters
    let sampling = !is_o_series(&config.model_id);
    ChatRequest {
        model: config.model_id.clone(),
        messages: convert_messages(messages),
        max_tokens: config.max_tokens,
        temperature: (sampling && config.temperature > 0.0).then_some(config.temperature),
        top_p: (sampling && config.top_p > 0.0 && config.top_p < 1.0).then_some(config.top_p),
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        response_format: format.map(|f| OaiResponseFormat {
            r#type: "json_schema",
            json_schema: OaiJsonSchema {
                name: f.name,
                schema: f.schema,
                strict: true,
            },
        }),
    }
}

pub(crate) fn parse_chunk(event: SseEvent) -> Vec<Result<StreamDelta>> {
    if event.data.trim() == "[DONE]" {
        return vec![];
    }

    let chunk: StreamChunk = match serde_json::from_str(&event.data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse SSE chunk");
            return vec![];
        }
    };

    let mut deltas = Vec::new();

    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(text) = choice.delta.and_then(|d| d.content) {
            if !text.is_empty() {
                deltas.push(Ok(StreamDelta::TextDelta(text)));
            }
        }
        if let Some(reason) = choice.finish_reason {
            let stop = match reason.as_str() {
                "length" => StopReason::MaxTokens,
                "content_filter" => StopReason::ContentFilter,
                "stop_sequence" => StopReason::StopSequence,
                _ => StopReason::EndTurn,
            };
            deltas.push(Ok(StreamDelta::Stop(stop)));
        }
    }

    // with include_usage the final chunk carries usage and no choices
    if let Some(usage) = chunk.usage {
        deltas.push(Ok(StreamDelta::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }));
    }

    deltas
}

impl LlmClient for OpenAiClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        format: Option<&ResponseFormat>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        let format = format.cloned();

        Box::pin(async move {
            let preset = presets::get_preset(&config.provider);
            let base_url = config
                .base_url
                .clone()
                .or_else(|| preset.as_ref().map(|p| p.default_base_url.to_string()))
                .unwrap_or_else(|| OPENAI_API_URL.to_string());

            let body = build_request(&config, messages, format);
            debug!(
                model = %config.model_id,
                messages = body.messages.len(),
                structured = body.response_format.is_some(),
                "Sending chat request"
            );

            let mut req = self.http.post(&base_url).json(&body);

            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let headers = match preset {
                Some(ref p) => presets::build_extra_headers(p, &config.extra_headers),
                None => config
                    .extra_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            };
            for (k, v) in &headers {
                req = req.header(k.as_str(), v.as_str());
            }

            let response = req
                .send()
                .await
                .map_err(|e| ForageError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(ForageError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let sse_stream = SseStream::new(response.bytes_stream());

            let delta_stream = sse_stream
                .map(|event| match event {
                    Ok(event) => futures::stream::iter(parse_chunk(event)),
                    Err(e) => futures::stream::iter(vec![Err(e)]),
                })
                .flatten();

            Ok(Box::pin(delta_stream) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(model_id: &str) -> ModelConfig {
        toml::from_str(&format!("model_id = \"{model_id}\"")).unwrap()
    }

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_request_carries_strict_schema() {
        let format = ResponseFormat {
            name: "route_plan".into(),
            schema: json!({"type": "object"}),
        };
        let req = build_request(&model("gpt-4o"), vec![ChatMessage::user("hi")], Some(format));
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "route_plan");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!((body["top_p"].as_f64().unwrap() - 0.95).abs() < 1e-6);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_o_series_drops_sampling() {
        let req = build_request(&model("o3-mini"), vec![], None);
        let body = serde_json::to_value(&req).unwrap();
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_p").is_none());
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_parse_chunk_text_and_stop() {
        let deltas = parse_chunk(event(
            r#"{"choices":[{"delta":{"content":"{\"a\""},"finish_reason":null}]}"#,
        ));
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "{\"a\""));

        let deltas = parse_chunk(event(r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#));
        assert!(matches!(&deltas[0], Ok(StreamDelta::Stop(StopReason::MaxTokens))));
    }

    #[test]
    fn test_parse_chunk_usage_and_done() {
        let deltas = parse_chunk(event(
            r#"{"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":30}}"#,
        ));
        assert!(matches!(
            deltas[0],
            Ok(StreamDelta::Usage { input_tokens: 120, output_tokens: 30 })
        ));
        assert!(parse_chunk(event("[DONE]")).is_empty());
        assert!(parse_chunk(event("not json")).is_empty());
    }
}
