//! Mock collaborators for the conversation scenarios.
//!
//! Each mock records what it was asked to do behind shared handles so
//! tests can assert after the orchestrator shuts down.

// Each scenario binary uses a different subset of the mocks.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use sori::config::Settings;
use sori::context::{Message, SystemBlocks};
use sori::contracts::{
    LlmClient, LlmDelta, LlmStream, Memory, PcmStream, Player, SttClient, StopReason, ToolCall,
    ToolOutput, VoiceDetector,
};
use sori::error::{Result, VoiceError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Settings tuned for fast tests (temp-dir persistence, tiny timeouts
/// left at defaults).
pub fn test_settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.session.conversation_log_dir = dir.join("conversations");
    settings.memory.data_dir = dir.join("memory");
    settings.stt.keep_warm = true;
    settings
}

/// VAD stub for wiring; scenario tests inject `MicEvent`s directly.
pub struct SilentVad;

impl VoiceDetector for SilentVad {
    fn is_speech(&mut self, _pcm: &[u8], _threshold: f32) -> bool {
        false
    }

    fn reset(&mut self) {}
}

// ── STT ────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct SttProbe {
    pub connects: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
    pub frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

pub struct MockStt {
    pub probe: SttProbe,
}

#[async_trait]
impl SttClient for MockStt {
    async fn connect(&mut self) -> Result<()> {
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_frame(&mut self, pcm: &[u8]) -> Result<()> {
        self.probe.frames.lock().unwrap().push(pcm.to_vec());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.probe.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── LLM ────────────────────────────────────────────────────────

/// One scripted response stream per turn iteration.
pub struct MockLlm {
    scripts: Mutex<VecDeque<Vec<Result<LlmDelta>>>>,
    pub cancelled: Arc<AtomicBool>,
    pub tool_calls_executed: Arc<Mutex<Vec<ToolCall>>>,
    /// Delay between deltas, so barge-in can land mid-stream.
    pub delta_delay: Duration,
}

impl MockLlm {
    pub fn new(scripts: Vec<Vec<LlmDelta>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().map(|s| s.into_iter().map(Ok).collect()).collect()),
            cancelled: Arc::new(AtomicBool::new(false)),
            tool_calls_executed: Arc::new(Mutex::new(Vec::new())),
            delta_delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = delay;
        self
    }

    /// A single plain-text turn.
    pub fn text_turn(text: &str) -> Self {
        Self::new(vec![vec![
            LlmDelta::Text(text.to_owned()),
            LlmDelta::Stop(StopReason::EndTurn),
        ]])
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn stream(
        &self,
        _system: &SystemBlocks,
        _tools: &[sori::contracts::ToolDefinition],
        _messages: &[Message],
    ) -> Result<LlmStream> {
        self.cancelled.store(false, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Ok(LlmDelta::Stop(StopReason::EndTurn))]);
        let cancelled = Arc::clone(&self.cancelled);
        let delay = self.delta_delay;

        let stream = futures_util::stream::unfold(
            (VecDeque::from(script), cancelled, delay, false),
            |(mut script, cancelled, delay, done)| async move {
                if done {
                    return None;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancelled.load(Ordering::SeqCst) {
                    return Some((Err(VoiceError::Cancelled), (script, cancelled, delay, true)));
                }
                let item = script.pop_front()?;
                Some((item, (script, cancelled, delay, false)))
            },
        );
        Ok(Box::pin(stream))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    async fn execute_tool(&self, call: &ToolCall) -> ToolOutput {
        self.tool_calls_executed.lock().unwrap().push(call.clone());
        ToolOutput {
            tool_use_id: call.id.clone(),
            content: serde_json::json!("10:30"),
            is_error: false,
        }
    }
}

// ── TTS ────────────────────────────────────────────────────────

/// Emits `frames_per_sentence` frames per call; frame bytes are
/// `[sentence_index, frame_index]` so ordering is assertable end-to-end.
pub struct MockTts {
    pub sentences: Arc<Mutex<Vec<String>>>,
    pub flushed: Arc<AtomicBool>,
    pub frames_per_sentence: usize,
    /// Delay before each frame, so interrupts can land mid-sentence.
    pub frame_delay: Duration,
}

impl MockTts {
    pub fn new(frames_per_sentence: usize) -> Self {
        Self {
            sentences: Arc::new(Mutex::new(Vec::new())),
            flushed: Arc::new(AtomicBool::new(false)),
            frames_per_sentence,
            frame_delay: Duration::ZERO,
        }
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }
}

#[async_trait]
impl sori::contracts::TtsClient for MockTts {
    async fn stream(&self, text: &str) -> Result<PcmStream> {
        let index = {
            let mut sentences = self.sentences.lock().unwrap();
            sentences.push(text.to_owned());
            sentences.len() - 1
        };
        let total = self.frames_per_sentence;
        let delay = self.frame_delay;
        let stream = futures_util::stream::unfold(0usize, move |i| async move {
            if i >= total {
                return None;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some((Ok(Bytes::from(vec![index as u8, i as u8])), i + 1))
        });
        Ok(Box::pin(stream))
    }

    fn flush(&self) {
        self.flushed.store(true, Ordering::SeqCst);
    }
}

// ── Player ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct PlayerProbe {
    pub frames: Arc<Mutex<Vec<Bytes>>>,
    pub starts: Arc<AtomicUsize>,
    pub finishes: Arc<AtomicUsize>,
    pub kills: Arc<AtomicUsize>,
}

pub struct MockPlayer {
    pub probe: PlayerProbe,
    /// Per-frame playback latency, so interrupts can land mid-utterance.
    pub frame_delay: Duration,
    /// Signals the running total of played frames after each `play`.
    pub played_tx: Option<mpsc::UnboundedSender<usize>>,
}

impl MockPlayer {
    pub fn new() -> Self {
        Self {
            probe: PlayerProbe::default(),
            frame_delay: Duration::ZERO,
            played_tx: None,
        }
    }
}

#[async_trait]
impl Player for MockPlayer {
    async fn start(&mut self) -> Result<()> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn play(&mut self, pcm: &[u8]) -> Result<()> {
        if !self.frame_delay.is_zero() {
            tokio::time::sleep(self.frame_delay).await;
        }
        let total = {
            let mut frames = self.probe.frames.lock().unwrap();
            frames.push(Bytes::copy_from_slice(pcm));
            frames.len()
        };
        if let Some(tx) = &self.played_tx {
            let _ = tx.send(total);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.probe.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.probe.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Memory ─────────────────────────────────────────────────────

pub struct MockMemory {
    pub extractions: Arc<AtomicUsize>,
    /// Set after shutdown to catch use-after-teardown.
    pub torn_down: Arc<AtomicBool>,
    pub used_after_teardown: Arc<AtomicBool>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            extractions: Arc::new(AtomicUsize::new(0)),
            torn_down: Arc::new(AtomicBool::new(false)),
            used_after_teardown: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Memory for MockMemory {
    async fn pre_load(&self, _query: &str) -> Result<String> {
        if self.torn_down.load(Ordering::SeqCst) {
            self.used_after_teardown.store(true, Ordering::SeqCst);
        }
        Ok(String::new())
    }

    async fn extract_and_save(&self, _messages: &[Message]) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            self.used_after_teardown.store(true, Ordering::SeqCst);
        }
        self.extractions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, deadline: Duration) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    predicate()
}
