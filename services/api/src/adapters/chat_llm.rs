//! services/api/src/adapters/chat_llm.rs
//!
//! This module contains the adapter for the assistant's chat model. It implements
//! the `ModelClient` port against an OpenAI-compatible `chat/completions`
//! endpoint, streaming text as it arrives and running the tool loop until the
//! model produces a reply without tool calls.

use async_stream::try_stream;
use async_trait::async_trait;
use ecokids_core::domain::{ChatMessage, MessageRole, ModelMessage};
use ecokids_core::ports::{
    ChatRequest, ChatTool, ModelClient, ModelStream, PortError, PortResult, StreamEvent,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::openai_http::{OpenAiEndpoint, SseDecoder};

/// Upper bound on model round-trips in one turn.
const MAX_TOOL_STEPS: usize = 5;

//=========================================================================================
// Wire Types
//=========================================================================================

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Value],
    stream: bool,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [Value],
}

fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

//=========================================================================================
// Step Accumulation
//=========================================================================================

#[derive(Debug, Default, Clone, PartialEq)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Collects one streamed completion: its text and any tool calls.
#[derive(Debug, Default)]
struct StepAccumulator {
    content: String,
    tool_calls: Vec<PendingToolCall>,
    done: bool,
}

impl StepAccumulator {
    /// Applies one `data:` payload and returns the text delta it carried.
    fn apply(&mut self, payload: &str) -> Option<String> {
        if payload == "[DONE]" {
            self.done = true;
            return None;
        }
        let chunk: CompletionChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Skipping unreadable completion chunk: {}", e);
                return None;
            }
        };
        let choice = chunk.choices.into_iter().next()?;

        for call in choice.delta.tool_calls.unwrap_or_default() {
            if self.tool_calls.len() <= call.index {
                self.tool_calls.resize(call.index + 1, PendingToolCall::default());
            }
            let slot = &mut self.tool_calls[call.index];
            if let Some(id) = call.id {
                slot.id = id;
            }
            if let Some(function) = call.function {
                slot.name.push_str(function.name.as_deref().unwrap_or_default());
                slot.arguments.push_str(function.arguments.as_deref().unwrap_or_default());
            }
        }
        if choice.finish_reason.is_some() {
            self.done = true;
        }

        let text = choice.delta.content.filter(|t| !t.is_empty())?;
        self.content.push_str(&text);
        Some(text)
    }

    fn assistant_message(&self) -> Value {
        let content = if self.content.is_empty() {
            Value::Null
        } else {
            Value::String(self.content.clone())
        };
        let mut message = json!({ "role": "assistant", "content": content });
        if !self.tool_calls.is_empty() {
            message["tool_calls"] = self
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments }
                    })
                })
                .collect();
        }
        message
    }
}

//=========================================================================================
// History
//=========================================================================================

fn tool_call_ids(message: &Value) -> Vec<String> {
    message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| c["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Converts the persisted log into chat messages the API accepts.
///
/// A turn cancelled while it was being written can leave tool calls without
/// results (or results without calls); those are dropped.
fn wire_history(history: &[ChatMessage]) -> Vec<Value> {
    let messages: Vec<Value> = history
        .iter()
        .map(|m| match &m.raw_content {
            Value::Object(map) if map.contains_key("role") => m.raw_content.clone(),
            _ => json!({ "role": m.role.as_str(), "content": m.text_content }),
        })
        .collect();

    let answered: HashSet<&str> = messages
        .iter()
        .filter(|m| m["role"] == "tool")
        .filter_map(|m| m["tool_call_id"].as_str())
        .collect();

    let mut announced: HashSet<String> = HashSet::new();
    let mut wire = Vec::with_capacity(messages.len());
    for message in &messages {
        if message["role"] == "tool" {
            if message["tool_call_id"].as_str().is_some_and(|id| announced.contains(id)) {
                wire.push(message.clone());
            }
            continue;
        }
        let ids = tool_call_ids(message);
        if ids.is_empty() {
            wire.push(message.clone());
        } else if ids.iter().all(|id| answered.contains(id.as_str())) {
            announced.extend(ids);
            wire.push(message.clone());
        } else if message["content"].as_str().is_some_and(|c| !c.is_empty()) {
            wire.push(json!({ "role": "assistant", "content": message["content"] }));
        }
    }
    wire
}

fn tool_definition(tool: &Arc<dyn ChatTool>) -> Value {
    let spec = tool.spec();
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

/// Runs one tool call. Failures are reported back to the model as the tool's output.
async fn run_tool(tools: &[Arc<dyn ChatTool>], call: &PendingToolCall) -> String {
    let Some(tool) = tools.iter().find(|t| t.spec().name == call.name) else {
        warn!(tool = %call.name, "Model called an unknown tool.");
        return json!({ "error": format!("Unknown tool {}", call.name) }).to_string();
    };
    let arguments = if call.arguments.trim().is_empty() {
        Ok(json!({}))
    } else {
        serde_json::from_str::<Value>(&call.arguments)
    };
    let result = match arguments {
        Ok(arguments) => tool.call(arguments).await,
        Err(e) => Err(PortError::Unexpected(format!("Malformed arguments: {}", e))),
    };
    match result {
        Ok(Value::String(text)) => text,
        Ok(value) => value.to_string(),
        Err(e) => {
            warn!(tool = %call.name, "Tool call failed: {}", e);
            json!({ "error": e.to_string() }).to_string()
        }
    }
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `ModelClient` using an OpenAI-compatible chat API.
#[derive(Clone)]
pub struct OpenAiChatAdapter {
    endpoint: OpenAiEndpoint,
    model: String,
}

impl OpenAiChatAdapter {
    /// Creates a new `OpenAiChatAdapter`.
    pub fn new(endpoint: OpenAiEndpoint, model: String) -> Self {
        Self { endpoint, model }
    }
}

#[async_trait]
impl ModelClient for OpenAiChatAdapter {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        abort: CancellationToken,
    ) -> PortResult<ModelStream> {
        let endpoint = self.endpoint.clone();
        let model = self.model.clone();
        let tools = request.tools;
        let tool_definitions: Vec<Value> = tools.iter().map(tool_definition).collect();

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(json!({ "role": "system", "content": request.system_prompt }));
        messages.extend(wire_history(&request.history));
        messages.push(json!({ "role": "user", "content": request.message }));

        let stream = try_stream! {
            let mut produced = Vec::new();
            for step in 0..MAX_TOOL_STEPS {
                let req = {
                    let body = CompletionRequest {
                        model: &model,
                        messages: &messages,
                        stream: true,
                        tools: &tool_definitions,
                    };
                    endpoint.post("chat/completions", &body)
                };
                let resp = tokio::select! {
                    _ = abort.cancelled() => Err(PortError::Aborted),
                    resp = endpoint.send(req) => resp,
                }?;

                let mut body_stream = resp.bytes_stream();
                let mut decoder = SseDecoder::default();
                let mut acc = StepAccumulator::default();
                while !acc.done {
                    let next = tokio::select! {
                        _ = abort.cancelled() => Err(PortError::Aborted),
                        next = body_stream.next() => Ok(next),
                    }?;
                    let Some(chunk) = next else { break };
                    let chunk = chunk
                        .map_err(|e| PortError::Unexpected(format!("Stream interrupted: {}", e)))?;
                    for payload in decoder.push(&chunk) {
                        if let Some(text) = acc.apply(&payload) {
                            yield StreamEvent::TextDelta(text);
                        }
                    }
                }

                let assistant = acc.assistant_message();
                messages.push(assistant.clone());
                produced.push(ModelMessage {
                    role: MessageRole::Assistant,
                    raw_content: assistant,
                });
                if acc.tool_calls.is_empty() {
                    break;
                }

                info!(step, calls = acc.tool_calls.len(), "Running tool calls.");
                for call in &acc.tool_calls {
                    let output = run_tool(&tools, call).await;
                    let tool_message = json!({
                        "role": "tool",
                        "tool_call_id": call.id,
                        "content": output,
                    });
                    messages.push(tool_message.clone());
                    produced.push(ModelMessage {
                        role: MessageRole::Tool,
                        raw_content: tool_message,
                    });
                }
                if abort.is_cancelled() {
                    Err::<(), _>(PortError::Aborted)?;
                }
            }
            yield StreamEvent::Finished { messages: produced };
        };

        let stream: ModelStream = Box::pin(stream);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn text_and_tool_call_fragments_accumulate() {
        let mut acc = StepAccumulator::default();
        assert_eq!(
            acc.apply(r#"{"choices":[{"delta":{"content":"Xin "},"finish_reason":null}]}"#),
            Some("Xin ".to_string())
        );
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search_stories","arguments":"{\"que"}}]}}]}"#);
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ry\":\"rùa\"}"}}]}}]}"#);
        assert!(!acc.done);
        acc.apply(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        assert!(acc.done);

        assert_eq!(
            acc.tool_calls,
            vec![PendingToolCall {
                id: "call_1".to_string(),
                name: "search_stories".to_string(),
                arguments: r#"{"query":"rùa"}"#.to_string(),
            }]
        );
        let message = acc.assistant_message();
        assert_eq!(message["content"], "Xin ");
        assert_eq!(message["tool_calls"][0]["function"]["name"], "search_stories");
    }

    #[test]
    fn done_marker_and_garbage_are_handled() {
        let mut acc = StepAccumulator::default();
        assert_eq!(acc.apply("not json"), None);
        assert!(!acc.done);
        assert_eq!(acc.apply("[DONE]"), None);
        assert!(acc.done);
        assert_eq!(acc.assistant_message()["content"], Value::Null);
    }

    fn message(role: MessageRole, raw: Value) -> ChatMessage {
        ChatMessage::new(Uuid::new_v4(), role, raw, Utc::now())
    }

    #[test]
    fn history_keeps_complete_tool_exchanges_only() {
        let history = vec![
            message(MessageRole::User, json!("Find turtles")),
            message(
                MessageRole::Assistant,
                json!({ "role": "assistant", "content": null,
                    "tool_calls": [{ "id": "a", "type": "function",
                        "function": { "name": "search_stories", "arguments": "{}" } }] }),
            ),
            message(MessageRole::Tool, json!({ "role": "tool", "tool_call_id": "a", "content": "[]" })),
            message(MessageRole::Assistant, json!({ "role": "assistant", "content": "None yet." })),
            message(MessageRole::User, json!("Try again")),
            message(
                MessageRole::Assistant,
                json!({ "role": "assistant", "content": "Looking.",
                    "tool_calls": [{ "id": "b", "type": "function",
                        "function": { "name": "search_stories", "arguments": "{}" } }] }),
            ),
        ];

        let wire = wire_history(&history);
        assert_eq!(wire.len(), 6);
        assert_eq!(wire[0], json!({ "role": "user", "content": "Find turtles" }));
        assert_eq!(wire[1]["tool_calls"][0]["id"], "a");
        assert_eq!(wire[2]["tool_call_id"], "a");
        // The unanswered call is reduced to its text.
        assert_eq!(wire[5], json!({ "role": "assistant", "content": "Looking." }));
    }

    #[tokio::test]
    async fn tool_errors_become_tool_output() {
        let call = PendingToolCall {
            id: "x".to_string(),
            name: "missing".to_string(),
            arguments: String::new(),
        };
        let output = run_tool(&[], &call).await;
        assert!(output.contains("Unknown tool missing"));
    }
}
