//! Streaming language model client.
//!
//! Speaks the messages API wire format: ordered system blocks with
//! `cache_control` markers on the cache-eligible prefix, tool definitions
//! with a marker on the last tool, and an SSE response stream carrying
//! text deltas and tool_use blocks.

pub mod sse;

use crate::config::LlmConfig;
use crate::context::{ContentBlock, Message, MessageContent, Role, SystemBlocks};
use crate::contracts::{LlmClient, LlmDelta, LlmStream, StopReason, ToolCall, ToolDefinition, ToolOutput};
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use serde_json::{Value, json};
use sse::{SseEvent, SseParser};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const API_VERSION: &str = "2023-06-01";

/// HTTP client for the streaming messages API.
pub struct HttpLlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    cancelled: Arc<AtomicBool>,
}

impl HttpLlmClient {
    /// Create a client from configuration. The underlying connection pool
    /// is shared across turns.
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The built-in tool set offered on every turn.
    pub fn default_tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "get_time".to_owned(),
            description: "Get the current local time as HH:MM.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {},
            }),
        }]
    }
}

/// Build the request body. System blocks arrive pre-ordered (dynamic
/// last); cache markers go on every cache-eligible block and on the last
/// tool so the cached prefix covers persona, retrieved context, and the
/// tool table.
fn build_request(
    config: &LlmConfig,
    system: &SystemBlocks,
    tools: &[ToolDefinition],
    messages: &[Message],
) -> Value {
    let system_blocks: Vec<Value> = system
        .ordered()
        .iter()
        .map(|block| {
            let mut v = json!({"type": "text", "text": block.text});
            if block.cache {
                v["cache_control"] = json!({"type": "ephemeral"});
            }
            v
        })
        .collect();

    let wire_tools: Vec<Value> = tools
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let mut v = json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            });
            if i + 1 == tools.len() {
                v["cache_control"] = json!({"type": "ephemeral"});
            }
            v
        })
        .collect();

    let wire_messages: Vec<Value> = messages.iter().map(message_to_wire).collect();

    let mut body = json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "stream": true,
        "system": system_blocks,
        "messages": wire_messages,
        "output_config": {"effort": config.effort},
    });
    if !wire_tools.is_empty() {
        body["tools"] = Value::Array(wire_tools);
    }
    body
}

/// Map a log message onto the wire. Tool results travel as user-role
/// messages carrying a tool_result block.
fn message_to_wire(message: &Message) -> Value {
    let (role, content) = match (&message.role, &message.content) {
        (Role::User, content) => ("user", content_to_wire(content)),
        (Role::Assistant, content) => ("assistant", content_to_wire(content)),
        (Role::ToolResult, content) => ("user", content_to_wire(content)),
    };
    json!({"role": role, "content": content})
}

fn content_to_wire(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Blocks(blocks) => Value::Array(
            blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let content = match content {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        json!({
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": content,
                            "is_error": is_error,
                        })
                    }
                })
                .collect(),
        ),
    }
}

/// In-flight tool_use block whose JSON input is still streaming.
#[derive(Default)]
struct ToolAccum {
    id: String,
    name: String,
    input_json: String,
}

/// Decoder state carried across SSE events.
struct Decoder {
    pending: VecDeque<Result<LlmDelta>>,
    tool: Option<ToolAccum>,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl Decoder {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            tool: None,
            stop_reason: None,
            finished: false,
        }
    }

    fn accept(&mut self, event: &SseEvent) {
        let payload: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                self.pending.push_back(Err(VoiceError::protocol(
                    "llm",
                    format!("bad SSE payload: {e}"),
                )));
                return;
            }
        };
        let kind = event
            .event
            .as_deref()
            .or_else(|| payload["type"].as_str())
            .unwrap_or_default();

        match kind {
            "content_block_start" => {
                let block = &payload["content_block"];
                if block["type"] == "tool_use" {
                    self.tool = Some(ToolAccum {
                        id: block["id"].as_str().unwrap_or_default().to_owned(),
                        name: block["name"].as_str().unwrap_or_default().to_owned(),
                        input_json: String::new(),
                    });
                }
            }
            "content_block_delta" => match payload["delta"]["type"].as_str() {
                Some("text_delta") => {
                    if let Some(text) = payload["delta"]["text"].as_str() {
                        self.pending.push_back(Ok(LlmDelta::Text(text.to_owned())));
                    }
                }
                Some("input_json_delta") => {
                    if let Some(tool) = self.tool.as_mut()
                        && let Some(fragment) = payload["delta"]["partial_json"].as_str()
                    {
                        tool.input_json.push_str(fragment);
                    }
                }
                _ => {}
            },
            "content_block_stop" => {
                if let Some(tool) = self.tool.take() {
                    let input = if tool.input_json.trim().is_empty() {
                        json!({})
                    } else {
                        match serde_json::from_str(&tool.input_json) {
                            Ok(v) => v,
                            Err(e) => {
                                self.pending.push_back(Err(VoiceError::protocol(
                                    "llm",
                                    format!("bad tool input JSON: {e}"),
                                )));
                                return;
                            }
                        }
                    };
                    self.pending.push_back(Ok(LlmDelta::ToolUse(ToolCall {
                        id: tool.id,
                        name: tool.name,
                        input,
                    })));
                }
            }
            "message_delta" => {
                self.stop_reason = match payload["delta"]["stop_reason"].as_str() {
                    Some("tool_use") => Some(StopReason::ToolUse),
                    Some("max_tokens") => Some(StopReason::MaxTokens),
                    Some(_) => Some(StopReason::EndTurn),
                    None => self.stop_reason,
                };
            }
            "message_stop" => {
                let reason = self.stop_reason.unwrap_or(StopReason::EndTurn);
                self.pending.push_back(Ok(LlmDelta::Stop(reason)));
                self.finished = true;
            }
            "error" => {
                let message = payload["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error")
                    .to_owned();
                self.pending.push_back(Err(VoiceError::transport("llm", message)));
                self.finished = true;
            }
            // message_start, ping, and anything newer carry nothing we need.
            _ => {}
        }
    }
}

struct StreamState {
    response: reqwest::Response,
    parser: SseParser,
    decoder: Decoder,
    cancelled: Arc<AtomicBool>,
    done: bool,
}

async fn next_delta(mut st: StreamState) -> Option<(Result<LlmDelta>, StreamState)> {
    loop {
        if st.done {
            return None;
        }
        if st.cancelled.load(Ordering::Relaxed) {
            st.done = true;
            debug!("LLM stream cancelled");
            return Some((Err(VoiceError::Cancelled), st));
        }
        if let Some(delta) = st.decoder.pending.pop_front() {
            if st.decoder.finished && st.decoder.pending.is_empty() {
                st.done = true;
                return Some((delta, st));
            }
            return Some((delta, st));
        }
        if st.decoder.finished {
            st.done = true;
            return None;
        }

        match st.response.chunk().await {
            Ok(Some(bytes)) => {
                for event in st.parser.push(&bytes) {
                    st.decoder.accept(&event);
                }
            }
            Ok(None) => {
                if let Some(event) = st.parser.finish() {
                    st.decoder.accept(&event);
                }
                if st.decoder.pending.is_empty() && !st.decoder.finished {
                    st.done = true;
                    return Some((
                        Err(VoiceError::transport("llm", "stream ended unexpectedly")),
                        st,
                    ));
                }
                st.decoder.finished = true;
            }
            Err(e) => {
                st.done = true;
                return Some((Err(VoiceError::transport("llm", e.to_string())), st));
            }
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn stream(
        &self,
        system: &SystemBlocks,
        tools: &[ToolDefinition],
        messages: &[Message],
    ) -> Result<LlmStream> {
        // Single active stream: a new turn clears the previous cancel.
        self.cancelled.store(false, Ordering::Relaxed);

        let body = build_request(&self.config, system, tools, messages);
        info!(model = %self.config.model, messages = messages.len(), "opening LLM stream");

        let response = self
            .http
            .post(format!("{}/v1/messages", self.config.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::transport("llm", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let err = if status.is_server_error() || status.as_u16() == 429 {
                VoiceError::transport("llm", format!("{status}: {detail}"))
            } else {
                VoiceError::protocol("llm", format!("{status}: {detail}"))
            };
            return Err(err);
        }

        let state = StreamState {
            response,
            parser: SseParser::new(),
            decoder: Decoder::new(),
            cancelled: Arc::clone(&self.cancelled),
            done: false,
        };
        Ok(Box::pin(futures_util::stream::unfold(state, next_delta)))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    async fn execute_tool(&self, call: &ToolCall) -> ToolOutput {
        info!(tool = %call.name, "executing tool");
        match call.name.as_str() {
            "get_time" => ToolOutput {
                tool_use_id: call.id.clone(),
                content: json!(chrono::Local::now().format("%H:%M").to_string()),
                is_error: false,
            },
            other => {
                warn!(tool = other, "unknown tool requested");
                ToolOutput {
                    tool_use_id: call.id.clone(),
                    content: json!({"error": format!("unknown tool: {other}")}),
                    is_error: true,
                }
            }
        }
    }
}
