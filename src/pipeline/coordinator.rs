//! Main orchestrator wiring microphone, VAD, STT, turns, and timers.
//!
//! One long-running task per process. The microphone callback runs on its
//! own OS thread and crosses into the async world only through a bounded
//! `try_send`; every other piece of shared state is touched from the
//! orchestrator loop.

use crate::config::Settings;
use crate::context::ContextStore;
use crate::contracts::{LlmClient, Memory, Player, SttClient, ToolDefinition, TtsClient, VoiceDetector};
use crate::conversation_log::ConversationLogger;
use crate::error::Result;
use crate::pipeline::messages::{MicEvent, SttEvent, TranscriptKind};
use crate::pipeline::turn::{TurnContext, TurnLimits, TurnOutcome, run_turn};
use crate::state::{ConversationState, StateEvent, StateMachine};
use crate::tasks::{TaskHandle, TaskRegistry};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mic event channel depth. Sized like the audio stage buffers: deep
/// enough to ride out scheduler hiccups, shallow enough that stale audio
/// cannot pile up.
const MIC_CHANNEL_SIZE: usize = 64;

/// Broadcast capacity for WS audio listeners.
const AUDIO_BROADCAST_SIZE: usize = 64;

/// The concrete collaborators bound at startup.
pub struct Collaborators {
    pub vad: Box<dyn VoiceDetector>,
    pub stt: Box<dyn SttClient>,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub player: Arc<tokio::sync::Mutex<dyn Player>>,
    pub memory: Arc<dyn Memory>,
}

/// Runs on the microphone thread: VAD plus the thread -> loop boundary.
pub struct MicHook {
    vad: Box<dyn VoiceDetector>,
    threshold_bits: Arc<AtomicU32>,
    reset_requested: Arc<AtomicBool>,
    tx: mpsc::Sender<MicEvent>,
    was_speaking: bool,
}

impl MicHook {
    /// Process one input frame. Never blocks: events are `try_send` and
    /// dropped under pressure.
    pub fn on_frame(&mut self, pcm: &[u8]) {
        if self.reset_requested.swap(false, Ordering::Relaxed) {
            self.vad.reset();
            self.was_speaking = false;
        }

        let threshold = f32::from_bits(self.threshold_bits.load(Ordering::Relaxed));
        let speaking = self.vad.is_speech(pcm, threshold);
        if speaking && !self.was_speaking {
            let _ = self.tx.try_send(MicEvent::SpeechStart);
        }
        self.was_speaking = speaking;

        if self.tx.try_send(MicEvent::Frame(Bytes::copy_from_slice(pcm))).is_err() {
            debug!("mic channel full, dropping frame");
        }
    }
}

/// Read-only handles the HTTP surface needs.
#[derive(Clone)]
pub struct DiagnosticsHandle {
    pub state: Arc<Mutex<StateMachine>>,
    pub registry: TaskRegistry,
    pub staging_gauge: Arc<AtomicUsize>,
    pub memory: Arc<dyn Memory>,
    pub audio_broadcast: broadcast::Sender<Bytes>,
}

struct TurnHandle {
    cancel: CancellationToken,
    task: JoinHandle<TurnOutcome>,
}

enum LoopSignal {
    ActiveTimeout,
}

enum LoopEvent {
    Shutdown,
    Mic(Option<MicEvent>),
    Stt(Option<SttEvent>),
    Signal(Option<LoopSignal>),
    TurnDone(Option<TurnOutcome>),
}

/// Owns the conversation lifecycle for one session.
pub struct Orchestrator {
    settings: Settings,
    state: Arc<Mutex<StateMachine>>,
    registry: TaskRegistry,
    context: Arc<ContextStore>,
    logger: Arc<ConversationLogger>,

    llm: Arc<dyn LlmClient>,
    tts: Arc<dyn TtsClient>,
    player: Arc<tokio::sync::Mutex<dyn Player>>,
    memory: Arc<dyn Memory>,
    stt: Box<dyn SttClient>,
    tools: Vec<ToolDefinition>,

    mic_tx: mpsc::Sender<MicEvent>,
    mic_rx: mpsc::Receiver<MicEvent>,
    stt_rx: mpsc::UnboundedReceiver<SttEvent>,
    signal_tx: mpsc::UnboundedSender<LoopSignal>,
    signal_rx: mpsc::UnboundedReceiver<LoopSignal>,

    vad: Option<Box<dyn VoiceDetector>>,
    threshold_bits: Arc<AtomicU32>,
    vad_reset: Arc<AtomicBool>,

    staging_gauge: Arc<AtomicUsize>,
    audio_broadcast: broadcast::Sender<Bytes>,
    shutdown: CancellationToken,

    partial_transcript: String,
    committed_transcript: String,
    current_turn: Option<TurnHandle>,
    active_timer: Option<TaskHandle>,
}

impl Orchestrator {
    /// Wire an orchestrator. `stt_rx` is the receiving end of the channel
    /// the STT client was constructed with; `persona` seeds the context
    /// store; `tools` is the per-session tool table.
    pub fn new(
        settings: Settings,
        collaborators: Collaborators,
        stt_rx: mpsc::UnboundedReceiver<SttEvent>,
        persona: String,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        let mut machine = StateMachine::new(
            settings.vad.threshold,
            settings.vad.threshold_speaking,
        );

        // Publish the derived VAD threshold across the thread boundary and
        // log every transition.
        let threshold_bits = Arc::new(AtomicU32::new(settings.vad.threshold.to_bits()));
        let bits = Arc::clone(&threshold_bits);
        let normal = settings.vad.threshold;
        let speaking = settings.vad.threshold_speaking;
        machine.on_transition(Box::new(move |from, event, to| {
            let threshold = if to == ConversationState::Speaking {
                speaking
            } else {
                normal
            };
            bits.store(threshold.to_bits(), Ordering::Relaxed);
            info!(
                from = from.as_str(),
                event = event.as_str(),
                to = to.as_str(),
                "state transition"
            );
        }));

        let (mic_tx, mic_rx) = mpsc::channel(MIC_CHANNEL_SIZE);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (audio_broadcast, _) = broadcast::channel(AUDIO_BROADCAST_SIZE);
        let logger = Arc::new(ConversationLogger::new(
            settings.session.conversation_log_dir.clone(),
        ));

        Self {
            state: Arc::new(Mutex::new(machine)),
            registry: TaskRegistry::new(),
            context: Arc::new(ContextStore::new(persona)),
            logger,
            llm: collaborators.llm,
            tts: collaborators.tts,
            player: collaborators.player,
            memory: collaborators.memory,
            stt: collaborators.stt,
            tools,
            mic_tx,
            mic_rx,
            stt_rx,
            signal_tx,
            signal_rx,
            vad: Some(collaborators.vad),
            threshold_bits,
            vad_reset: Arc::new(AtomicBool::new(false)),
            staging_gauge: Arc::new(AtomicUsize::new(0)),
            audio_broadcast,
            shutdown: CancellationToken::new(),
            partial_transcript: String::new(),
            committed_transcript: String::new(),
            current_turn: None,
            active_timer: None,
            settings,
        }
    }

    /// Token that ends [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handles for the HTTP control surface.
    pub fn diagnostics_handle(&self) -> DiagnosticsHandle {
        DiagnosticsHandle {
            state: Arc::clone(&self.state),
            registry: self.registry.clone(),
            staging_gauge: Arc::clone(&self.staging_gauge),
            memory: Arc::clone(&self.memory),
            audio_broadcast: self.audio_broadcast.clone(),
        }
    }

    /// Background task registry (shared with the binary for the HTTP
    /// server task).
    pub fn registry(&self) -> TaskRegistry {
        self.registry.clone()
    }

    /// The conversation context store.
    pub fn context(&self) -> Arc<ContextStore> {
        Arc::clone(&self.context)
    }

    /// Build the microphone-thread hook. Call once, before `run`.
    ///
    /// # Panics
    ///
    /// Panics if called twice; the VAD moves into the hook.
    pub fn mic_hook(&mut self) -> MicHook {
        let vad = self.vad.take().expect("mic_hook may only be taken once");
        MicHook {
            vad,
            threshold_bits: Arc::clone(&self.threshold_bits),
            reset_requested: Arc::clone(&self.vad_reset),
            tx: self.mic_tx.clone(),
            was_speaking: false,
        }
    }

    /// Direct sender for mic events. Used by tests in place of a real
    /// microphone.
    pub fn mic_sender(&self) -> mpsc::Sender<MicEvent> {
        self.mic_tx.clone()
    }

    fn state_now(&self) -> ConversationState {
        self.state
            .lock()
            .map(|s| s.state())
            .unwrap_or(ConversationState::Idle)
    }

    /// Check-and-apply atomically under the state lock. Returns `None`
    /// when the machine is no longer in one of `from` — the loser of a
    /// race (e.g. barge-in vs. turn completion) observes that and stands
    /// down instead of raising `InvalidTransition`.
    fn apply_event_from(
        &self,
        from: &[ConversationState],
        event: StateEvent,
    ) -> Option<ConversationState> {
        let mut state = self.state.lock().ok()?;
        if !from.contains(&state.state()) {
            return None;
        }
        state.apply(event).ok()
    }

    fn turn_context(&self) -> TurnContext {
        TurnContext {
            state: Arc::clone(&self.state),
            context: Arc::clone(&self.context),
            llm: Arc::clone(&self.llm),
            tts: Arc::clone(&self.tts),
            player: Arc::clone(&self.player),
            memory: Arc::clone(&self.memory),
            logger: Arc::clone(&self.logger),
            registry: self.registry.clone(),
            tools: self.tools.clone(),
            audio_broadcast: Some(self.audio_broadcast.clone()),
            staging_gauge: Arc::clone(&self.staging_gauge),
            limits: TurnLimits {
                max_tool_iterations: self.settings.session.max_tool_iterations,
                max_buffer_chars: self.settings.session.max_buffer_chars,
                window_turns: self.settings.session.window_turns,
                apology_text: self.settings.tts.apology_text.clone(),
            },
        }
    }

    /// Bring collaborators up in dependency order (memory, STT, sink),
    /// enable the microphone last, run the event loop until the shutdown
    /// token fires, then tear down in reverse.
    ///
    /// Pass `None` for the microphone to drive the loop from injected
    /// [`MicEvent`]s (tests, text frontends).
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable startup failures (the
    /// audio sink cannot open); the process maps that to a non-zero exit.
    pub async fn run(mut self, mic: Option<crate::audio::capture::MicCapture>) -> Result<()> {
        self.startup().await?;

        // Microphone last: nothing may reach the VAD before the player
        // and recognizer are ready.
        if let Some(capture) = mic {
            let mut hook = self.mic_hook();
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                let handler = Box::new(move |pcm: &[u8]| hook.on_frame(pcm));
                if let Err(e) = capture.run(handler, token).await {
                    tracing::error!("microphone capture failed: {e}");
                }
            });
        }
        info!("orchestrator running");

        loop {
            let turn_running = self.current_turn.is_some();
            let current_turn = &mut self.current_turn;
            let turn_done = async move {
                match current_turn.as_mut() {
                    Some(handle) => (&mut handle.task).await.ok(),
                    None => std::future::pending().await,
                }
            };

            let event = tokio::select! {
                () = self.shutdown.cancelled() => LoopEvent::Shutdown,
                event = self.mic_rx.recv() => LoopEvent::Mic(event),
                event = self.stt_rx.recv() => LoopEvent::Stt(event),
                signal = self.signal_rx.recv() => LoopEvent::Signal(signal),
                outcome = turn_done, if turn_running => LoopEvent::TurnDone(outcome),
            };

            match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Mic(Some(event)) => self.handle_mic_event(event).await,
                LoopEvent::Stt(Some(event)) => self.handle_stt_event(event).await,
                LoopEvent::Signal(Some(LoopSignal::ActiveTimeout)) => {
                    self.handle_active_timeout().await;
                }
                LoopEvent::Signal(None) => {}
                LoopEvent::Mic(None) | LoopEvent::Stt(None) => break,
                LoopEvent::TurnDone(outcome) => {
                    self.current_turn = None;
                    self.handle_turn_outcome(outcome).await;
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    async fn startup(&mut self) -> Result<()> {
        // Memory first: pre-load retrieved context for the first prompt.
        match self.memory.pre_load("general").await {
            Ok(retrieved) if !retrieved.is_empty() => {
                self.context.update_retrieved(retrieved);
            }
            Ok(_) => {}
            Err(e) => warn!("memory pre-load failed: {e}"),
        }

        // STT warm connection. Failures are transient; the client
        // reconnects on send.
        if let Err(e) = self.stt.connect().await {
            warn!("STT warm-up failed, will reconnect on demand: {e}");
        }

        // TTS and LLM hold lazy HTTP pools; nothing to warm explicitly.

        // Player must be ready before the microphone goes live: a sink
        // that cannot open is a startup failure.
        self.player.lock().await.start().await?;
        Ok(())
    }

    async fn teardown(&mut self) {
        info!("orchestrator shutting down");

        // Microphone first: the capture task watches the same shutdown
        // token, so no new frames arrive past this point.
        self.mic_rx.close();

        if let Some(timer) = self.active_timer.take() {
            timer.cancel();
        }
        if let Some(turn) = self.current_turn.take() {
            self.llm.cancel();
            self.tts.flush();
            turn.cancel.cancel();
            let _ = turn.task.await;
        }

        // Background tasks end before the resources they borrow.
        self.registry.shutdown_all().await;

        if let Err(e) = self.stt.disconnect().await {
            debug!("STT disconnect error: {e}");
        }
        if let Err(e) = self.player.lock().await.kill().await {
            debug!("player kill error: {e}");
        }

        if self.settings.session.export_csv_on_shutdown {
            match self.logger.export_csv() {
                Ok(path) => info!(path = %path.display(), "conversation log exported"),
                Err(e) => debug!("CSV export skipped: {e}"),
            }
        }
    }

    async fn handle_mic_event(&mut self, event: MicEvent) {
        match event {
            MicEvent::SpeechStart => self.handle_speech_detected().await,
            MicEvent::Frame(bytes) => {
                let state = self.state_now();
                if matches!(
                    state,
                    ConversationState::Listening | ConversationState::Interrupted
                ) && let Err(e) = self.stt.send_frame(&bytes).await
                {
                    warn!("STT send failed: {e}");
                }
            }
        }
    }

    async fn handle_speech_detected(&mut self) {
        match self.state_now() {
            ConversationState::Idle | ConversationState::Active => {
                if let Some(timer) = self.active_timer.take() {
                    timer.cancel();
                }
                if self
                    .apply_event_from(
                        &[ConversationState::Idle, ConversationState::Active],
                        StateEvent::SpeechDetected,
                    )
                    .is_some()
                {
                    self.begin_listening().await;
                }
            }
            ConversationState::Speaking => self.handle_barge_in().await,
            // Already listening, processing, or mid-interrupt: the STT
            // commit semantics handle continued speech.
            _ => {}
        }
    }

    /// The barge-in hot path.
    async fn handle_barge_in(&mut self) {
        // Serialize against turn completion: whoever takes the state lock
        // first wins. If completion already moved us to Active, this
        // speech opens a fresh turn instead of interrupting.
        if self
            .apply_event_from(&[ConversationState::Speaking], StateEvent::SpeechDetected)
            .is_none()
        {
            if self.state_now() == ConversationState::Active {
                if let Some(timer) = self.active_timer.take() {
                    timer.cancel();
                }
                if self
                    .apply_event_from(&[ConversationState::Active], StateEvent::SpeechDetected)
                    .is_some()
                {
                    self.begin_listening().await;
                }
            }
            return;
        }

        info!("barge-in: cancelling in-flight turn");
        self.llm.cancel();
        self.tts.flush();

        if let Some(turn) = self.current_turn.take() {
            turn.cancel.cancel();
            // The turn task stops the sink on its way out — the consumer
            // kills the player and drains staging, the apology path kills
            // it directly. Awaiting here guarantees the cancellation
            // completed before new speech is accepted.
            match tokio::time::timeout(Duration::from_secs(2), turn.task).await {
                Ok(Ok(outcome)) => debug!(?outcome, "turn unwound"),
                Ok(Err(e)) => warn!("turn task failed during unwind: {e}"),
                Err(_) => warn!("turn unwind timed out"),
            }
        } else {
            // Speaking without a turn task should not happen; stop the
            // sink directly so audio cannot outlive the state change.
            let mut player = self.player.lock().await;
            let _ = player.kill().await;
        }

        if self
            .apply_event_from(&[ConversationState::Interrupted], StateEvent::InterruptHandled)
            .is_some()
        {
            self.begin_listening().await;
        }
    }

    /// Shared entry into `Listening`: fresh transcript, fresh VAD state,
    /// warm recognizer.
    async fn begin_listening(&mut self) {
        self.partial_transcript.clear();
        self.committed_transcript.clear();
        self.vad_reset.store(true, Ordering::Relaxed);
        if let Err(e) = self.stt.connect().await {
            warn!("STT connect failed: {e}");
        }
    }

    async fn handle_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::SessionStarted => debug!("STT session started"),
            SttEvent::Transcript(transcript) => match transcript.kind {
                TranscriptKind::Partial => {
                    self.partial_transcript = transcript.text;
                }
                TranscriptKind::Final => {
                    if !self.committed_transcript.is_empty() {
                        self.committed_transcript.push(' ');
                    }
                    self.committed_transcript.push_str(transcript.text.trim());
                    info!(text = %transcript.text, "transcript committed");
                }
            },
            SttEvent::UtteranceEnd => self.handle_utterance_end().await,
            SttEvent::Error(message) => warn!("STT error: {message}"),
        }
    }

    async fn handle_utterance_end(&mut self) {
        let transcript = self.committed_transcript.trim().to_owned();
        if transcript.is_empty() {
            debug!("utterance end without committed transcript");
            return;
        }
        if self
            .apply_event_from(&[ConversationState::Listening], StateEvent::UtteranceComplete)
            .is_none()
        {
            debug!("utterance end outside Listening, ignoring");
            return;
        }

        info!(text = %transcript, "utterance complete");
        self.committed_transcript.clear();
        self.partial_transcript.clear();

        let ctx = self.turn_context();
        let cancel = CancellationToken::new();
        let turn_cancel = cancel.clone();
        let task = tokio::spawn(async move { run_turn(&ctx, transcript, turn_cancel).await });
        self.current_turn = Some(TurnHandle { cancel, task });
    }

    async fn handle_turn_outcome(&mut self, outcome: Option<TurnOutcome>) {
        match outcome {
            Some(TurnOutcome::Completed) | Some(TurnOutcome::Failed) => {
                self.arm_active_timeout();
            }
            Some(TurnOutcome::Interrupted) => {
                // The barge-in handler owns the path back to Listening.
            }
            None => warn!("turn task panicked"),
        }
    }

    fn arm_active_timeout(&mut self) {
        if let Some(previous) = self.active_timer.take() {
            previous.cancel();
        }
        // The user may already have started the next turn by the time the
        // finished turn task is reaped; only an Active session idles out.
        if self.state_now() != ConversationState::Active {
            return;
        }
        let timeout = Duration::from_secs(self.settings.session.active_timeout_secs);
        let signal_tx = self.signal_tx.clone();
        let handle = self.registry.spawn("active-timeout", move |token| async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    let _ = signal_tx.send(LoopSignal::ActiveTimeout);
                }
            }
        });
        self.active_timer = Some(handle);
    }

    async fn handle_active_timeout(&mut self) {
        if self
            .apply_event_from(&[ConversationState::Active], StateEvent::ActiveTimeout)
            .is_none()
        {
            return;
        }
        info!("active window elapsed, returning to idle");
        self.active_timer = None;
        self.vad_reset.store(true, Ordering::Relaxed);

        if !self.settings.stt.keep_warm
            && let Err(e) = self.stt.disconnect().await
        {
            debug!("STT disconnect on idle failed: {e}");
        }
    }
}
