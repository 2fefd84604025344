//! Sori: real-time voice conversation orchestrator.
//!
//! A half-duplex streaming pipeline:
//! Microphone → VAD → STT → LLM (+tools) → TTS → Speaker
//!
//! # Architecture
//!
//! The conversation is driven by a six-state machine and built from
//! independent pieces connected by async channels:
//! - **Audio capture**: microphone frames via `cpal`, VAD on the capture
//!   thread, a bounded `try_send` into the orchestrator loop
//! - **STT**: streaming recognizer over WebSocket with commit semantics
//! - **Turn processing**: LLM stream → sentence chunker → TTS → bounded
//!   staging channel → player, with a tool loop and barge-in cancellation
//! - **Background tasks**: memory extraction, archival, and timers, all
//!   tracked by a registry with deterministic shutdown
//! - **Control surface**: `axum` health/diagnostics plus a binary
//!   WebSocket mirroring the output PCM

pub mod audio;
pub mod chunker;
pub mod config;
pub mod context;
pub mod contracts;
pub mod conversation_log;
pub mod error;
pub mod llm;
pub mod memory;
pub mod persona;
pub mod pipeline;
pub mod server;
pub mod staging;
pub mod state;
pub mod stt;
pub mod tasks;
pub mod tts;
pub mod vad;

pub use config::Settings;
pub use error::{Result, VoiceError};
pub use pipeline::coordinator::{Collaborators, Orchestrator};
pub use state::{ConversationState, StateEvent, StateMachine};
