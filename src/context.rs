//! Conversation context: message log, sliding window, and the 3-block
//! system prompt.
//!
//! The system prompt layout is fixed for prompt caching:
//!
//! ```text
//! Block 1: persona            (static, cache-eligible)
//! Block 2: retrieved context  (per-session, cache-eligible)
//! Block 3: dynamic            (per-request, never cached, ALWAYS last)
//! ```
//!
//! Dynamic content earlier in the sequence would invalidate every
//! downstream cache entry, so the ordering is enforced structurally: the
//! only way to read the blocks is [`SystemBlocks::ordered`].

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::sync::Mutex;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

/// One content block inside a structured message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        text: String,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The outcome of a tool invocation.
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        is_error: bool,
    },
}

/// Message content: plain text or a block sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to plain text (tool blocks contribute nothing).
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// An immutable entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Whether this assistant message carries the tool_use block that the
    /// given tool_result answers.
    fn answers(&self, tool_use_id: &str) -> bool {
        let MessageContent::Blocks(blocks) = &self.content else {
            return false;
        };
        blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { id, .. } if id == tool_use_id))
    }
}

/// One block of the system prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemBlock {
    pub text: String,
    /// Whether this block may carry a cache marker on the wire.
    pub cache: bool,
}

/// The ordered 3-block system prompt. Fields are private; the ordering
/// persona -> retrieved -> dynamic cannot be changed by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemBlocks {
    persona: SystemBlock,
    retrieved: SystemBlock,
    dynamic: SystemBlock,
}

impl SystemBlocks {
    /// Blocks in wire order. Dynamic is always last.
    pub fn ordered(&self) -> [&SystemBlock; 3] {
        [&self.persona, &self.retrieved, &self.dynamic]
    }
}

struct Inner {
    messages: Vec<Message>,
    retrieved: String,
}

/// Owns the append-only message log and the system prompt inputs.
///
/// Single writer (the turn processor), multiple readers. Writes are short;
/// a plain mutex suffices.
pub struct ContextStore {
    persona: String,
    inner: Mutex<Inner>,
}

impl ContextStore {
    /// Create a store with the given persona text and no retrieved context.
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                retrieved: String::new(),
            }),
        }
    }

    /// Append a user message.
    pub fn push_user(&self, text: impl Into<String>) {
        self.push(Message::new(Role::User, MessageContent::Text(text.into())));
    }

    /// Append an assistant message.
    pub fn push_assistant(&self, content: MessageContent) {
        self.push(Message::new(Role::Assistant, content));
    }

    /// Append a tool result message.
    pub fn push_tool_result(&self, tool_use_id: String, content: serde_json::Value, is_error: bool) {
        self.push(Message::new(
            Role::ToolResult,
            MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            }]),
        ));
    }

    fn push(&self, message: Message) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.messages.push(message);
        }
    }

    /// Snapshot of the full log.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().map(|i| i.messages.clone()).unwrap_or_default()
    }

    /// Number of messages in the log.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.messages.len()).unwrap_or(0)
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the last `n_turns` turns, adjusted so the result is a
    /// well-formed conversation: a window boundary falling between a
    /// tool_use and its tool_result extends backward to include both, and
    /// orphaned tool_results at the leading edge are dropped.
    pub fn window(&self, n_turns: usize) -> Vec<Message> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let start = window_start(&inner.messages, n_turns);
        inner.messages[start..].to_vec()
    }

    /// Replace the retrieved-context block. Atomic: readers see either the
    /// old or the new text, never a torn value.
    pub fn update_retrieved(&self, text: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.retrieved = text.into();
        }
    }

    /// Assemble the system prompt. Persona and retrieved text are returned
    /// verbatim so repeated calls within a session hit the prompt cache;
    /// only the dynamic block changes per request.
    pub fn system_blocks(&self) -> SystemBlocks {
        let retrieved = self
            .inner
            .lock()
            .map(|i| i.retrieved.clone())
            .unwrap_or_default();
        let retrieved = if retrieved.is_empty() {
            "(no additional context)".to_owned()
        } else {
            retrieved
        };
        SystemBlocks {
            persona: SystemBlock {
                text: self.persona.clone(),
                cache: true,
            },
            retrieved: SystemBlock {
                text: retrieved,
                cache: true,
            },
            dynamic: SystemBlock {
                text: format!("datetime: {}", Local::now().format("%Y-%m-%d %H:%M:%S %z")),
                cache: false,
            },
        }
    }
}

/// Index of the first message to include for a window of `n_turns` turns.
fn window_start(messages: &[Message], n_turns: usize) -> usize {
    let mut seen = 0;
    let mut start = 0;
    for (i, m) in messages.iter().enumerate().rev() {
        if m.role == Role::User {
            seen += 1;
            if seen == n_turns {
                start = i;
                break;
            }
        }
    }
    well_formed_from(messages, start)
}

/// Adjust a window boundary so the tail `messages[start..]` is a
/// well-formed conversation. A boundary between a tool_use and its
/// tool_result moves backward to include both; a tool_result whose
/// tool_use is out of reach is skipped. Any truncation strategy (turn
/// count, token budget) must pass its boundary through here.
pub fn well_formed_from(messages: &[Message], mut start: usize) -> usize {
    while let Some(m) = messages.get(start) {
        if m.role != Role::ToolResult {
            break;
        }
        let MessageContent::Blocks(blocks) = &m.content else {
            start += 1;
            continue;
        };
        let paired = blocks.iter().any(|b| {
            matches!(b, ContentBlock::ToolResult { tool_use_id, .. }
                if start > 0 && messages[start - 1].answers(tool_use_id))
        });
        if paired {
            start -= 1;
        } else {
            start += 1;
        }
    }
    start
}
