//! Contracts for the external collaborators.
//!
//! The orchestrator touches VAD, STT, LLM, TTS, the player, and the memory
//! store only through these traits. Concrete clients bind at startup;
//! tests bind mocks. Streaming collaborators hand back boxed streams so
//! the pipeline stays agnostic of the underlying wire format.

use crate::context::{Message, SystemBlocks};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Voice activity detection.
///
/// Called on the microphone thread for every frame, so implementations
/// must be cheap and must never block. Stateful: reports speech only after
/// a sustained supra-threshold run and silence only after a sustained
/// sub-threshold run (hysteresis on both edges).
pub trait VoiceDetector: Send {
    /// Whether the frame (s16le mono PCM) is part of speech at the given
    /// threshold.
    fn is_speech(&mut self, pcm: &[u8], threshold: f32) -> bool;

    /// Clear accumulated state (segment boundaries, counters).
    fn reset(&mut self);
}

/// Streaming speech-to-text over a persistent connection.
///
/// Transcript events arrive out-of-band on the channel supplied at
/// construction ([`crate::pipeline::messages::SttEvent`]); the trait only
/// covers the connection lifecycle. The connection persists across
/// utterances; implementations reconnect on send failure.
#[async_trait]
pub trait SttClient: Send {
    /// Open (or re-open) the recognizer session.
    async fn connect(&mut self) -> Result<()>;

    /// Forward one PCM frame to the recognizer.
    async fn send_frame(&mut self, pcm: &[u8]) -> Result<()>;

    /// Close the session.
    async fn disconnect(&mut self) -> Result<()>;
}

/// A tool made available to the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (e.g. `"get_time"`).
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema for the tool input.
    pub input_schema: serde_json::Value,
}

/// A tool invocation requested by the model mid-stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Identifier linking the call to its result.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed input value.
    pub input: serde_json::Value,
}

/// The outcome of executing a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// The call this answers.
    pub tool_use_id: String,
    /// Output value, or an error object when `is_error` is set.
    pub content: serde_json::Value,
    /// Whether execution failed. The model observes the error and may
    /// recover; tool failures never abort the turn.
    pub is_error: bool,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Natural end of the response.
    EndTurn,
    /// The model wants its tool calls executed.
    ToolUse,
    /// Token limit reached.
    MaxTokens,
}

/// One item of the model's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmDelta {
    /// A fragment of assistant text.
    Text(String),
    /// A completed tool_use block.
    ToolUse(ToolCall),
    /// End of stream.
    Stop(StopReason),
}

/// A boxed stream of LLM deltas.
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmDelta>> + Send>>;

/// Streaming, tool-capable language model.
///
/// One active stream at a time; restartable across turns.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Open a response stream for the given prompt state.
    async fn stream(
        &self,
        system: &SystemBlocks,
        tools: &[ToolDefinition],
        messages: &[Message],
    ) -> Result<LlmStream>;

    /// Terminate the active stream at its next item.
    fn cancel(&self);

    /// Execute a tool call. Infallible by contract: failures come back as
    /// an error-flagged [`ToolOutput`] for the model to observe.
    async fn execute_tool(&self, call: &ToolCall) -> ToolOutput;
}

/// A boxed stream of PCM chunks (s16le mono).
pub type PcmStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Streaming text-to-speech. Streams are independent per sentence.
#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Synthesize one sentence as a PCM stream.
    async fn stream(&self, text: &str) -> Result<PcmStream>;

    /// Cancel the active stream.
    fn flush(&self);
}

/// The local audio sink.
#[async_trait]
pub trait Player: Send {
    /// Make the sink ready for a new utterance (idempotent; also used to
    /// recover after a sink crash).
    async fn start(&mut self) -> Result<()>;

    /// Queue one PCM frame for playback.
    async fn play(&mut self, pcm: &[u8]) -> Result<()>;

    /// Close input and wait for queued audio to drain.
    async fn finish(&mut self) -> Result<()>;

    /// Stop immediately, discarding queued audio (barge-in).
    async fn kill(&mut self) -> Result<()>;
}

/// Long-term memory. Both operations are best-effort: failures are logged
/// by callers and never surface to the user.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Retrieve context relevant to `query` for the system prompt.
    async fn pre_load(&self, query: &str) -> Result<String>;

    /// Extract durable facts from the conversation and persist them.
    async fn extract_and_save(&self, messages: &[Message]) -> Result<()>;

    /// Free connections in the backing pool, if the store has one.
    /// Surfaced on the diagnostics endpoint.
    fn pool_free(&self) -> Option<usize> {
        None
    }
}
