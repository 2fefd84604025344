//! Turn processing: one user utterance through LLM, tools, TTS, and the
//! speaker.
//!
//! Each LLM iteration runs a producer and a consumer joined by the
//! staging channel. The producer pulls the model stream, cuts it into
//! sentences, synthesizes each one, and pushes PCM frames; the consumer
//! drains frames into the player. Sentence N can be playing while the
//! model is still emitting sentence N+2 — that pipelining is where the
//! sub-second first-audio latency comes from.

use crate::chunker::{SentenceChunker, sanitize_for_tts};
use crate::context::{ContentBlock, ContextStore, MessageContent};
use crate::contracts::{LlmClient, LlmDelta, Memory, Player, StopReason, ToolCall, ToolDefinition, TtsClient};
use crate::conversation_log::ConversationLogger;
use crate::error::VoiceError;
use crate::staging::{STAGING_CAPACITY, StagedFrame, StagingReceiver, StagingSender, staging_channel_with_gauge};
use crate::state::{ConversationState, StateEvent, StateMachine};
use crate::tasks::TaskRegistry;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-turn limits and texts, split out of [`crate::config::Settings`].
#[derive(Debug, Clone)]
pub struct TurnLimits {
    pub max_tool_iterations: u32,
    pub max_buffer_chars: usize,
    pub window_turns: usize,
    pub apology_text: String,
}

/// Everything a turn needs, shared with the coordinator.
pub struct TurnContext {
    pub state: Arc<Mutex<StateMachine>>,
    pub context: Arc<ContextStore>,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub player: Arc<tokio::sync::Mutex<dyn Player>>,
    pub memory: Arc<dyn Memory>,
    pub logger: Arc<ConversationLogger>,
    pub registry: TaskRegistry,
    pub tools: Vec<ToolDefinition>,
    /// Binary WS listeners receive the same output PCM the player gets.
    pub audio_broadcast: Option<broadcast::Sender<Bytes>>,
    /// Shared staging occupancy gauge for diagnostics.
    pub staging_gauge: Arc<AtomicUsize>,
    pub limits: TurnLimits,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Assistant finished speaking; state is `Active`.
    Completed,
    /// Barge-in cancelled the turn; partial response discarded.
    Interrupted,
    /// A collaborator failed; the apology played and state is `Active`.
    Failed,
}

struct ProducerOutput {
    text: String,
    tool_calls: Vec<ToolCall>,
    stop: Option<StopReason>,
    error: Option<VoiceError>,
    cancelled: bool,
}

struct ConsumerOutput {
    frames_played: u64,
    error: Option<VoiceError>,
    cancelled: bool,
}

/// Run one user turn end-to-end.
pub async fn run_turn(ctx: &TurnContext, transcript: String, cancel: CancellationToken) -> TurnOutcome {
    ctx.context.push_user(transcript.clone());

    let mut final_text = String::new();
    let mut iteration: u32 = 0;

    loop {
        iteration += 1;
        if cancel.is_cancelled() {
            return TurnOutcome::Interrupted;
        }

        let system = ctx.context.system_blocks();
        let window = ctx.context.window(ctx.limits.window_turns);
        let stream = match ctx.llm.stream(&system, &ctx.tools, &window).await {
            Ok(s) => s,
            Err(e) => {
                warn!("LLM stream failed to open: {e}");
                return degrade(ctx, e, &cancel).await;
            }
        };

        let (staging_tx, staging_rx) =
            staging_channel_with_gauge(STAGING_CAPACITY, Arc::clone(&ctx.staging_gauge));

        let producer = tokio::spawn(produce(
            stream,
            Arc::clone(&ctx.tts),
            staging_tx,
            Arc::clone(&ctx.state),
            cancel.clone(),
            ctx.limits.max_buffer_chars,
        ));
        let consumer = tokio::spawn(consume(
            staging_rx,
            Arc::clone(&ctx.player),
            cancel.clone(),
            ctx.audio_broadcast.clone(),
        ));

        let (produced, consumed) = tokio::join!(producer, consumer);
        let produced = produced.unwrap_or_else(|e| ProducerOutput {
            text: String::new(),
            tool_calls: Vec::new(),
            stop: None,
            error: Some(VoiceError::Channel(format!("producer task died: {e}"))),
            cancelled: false,
        });
        let consumed = consumed.unwrap_or_else(|e| ConsumerOutput {
            frames_played: 0,
            error: Some(VoiceError::Channel(format!("consumer task died: {e}"))),
            cancelled: false,
        });

        if produced.cancelled || consumed.cancelled || cancel.is_cancelled() {
            // Barge-in: the partial response must never reach the context.
            // It goes to the debug side-log only.
            debug!(partial = %produced.text, "turn interrupted, discarding partial response");
            return TurnOutcome::Interrupted;
        }

        // Join producer/consumer failures; the worst class decides what we
        // report. Only stream-level LLM failures abort the turn — sentence
        // and player failures were already degraded in place.
        if let Some(err) = produced.error {
            let err = match consumed.error {
                Some(c) => err.worse(c),
                None => err,
            };
            warn!("turn aborted: {err}");
            return degrade(ctx, err, &cancel).await;
        }
        if let Some(err) = consumed.error {
            warn!("playback degraded during turn: {err}");
        }
        debug!(frames = consumed.frames_played, iteration, "utterance played");

        if !produced.text.is_empty() {
            final_text = produced.text.clone();
        }

        let wants_tools = !produced.tool_calls.is_empty()
            && produced.stop == Some(StopReason::ToolUse);
        if wants_tools && iteration < ctx.limits.max_tool_iterations {
            run_tool_iteration(ctx, &produced).await;
            continue;
        }
        if wants_tools {
            // Iteration cap: further tool requests are treated as
            // end-of-turn; the last non-tool text is the answer.
            info!(iteration, "tool iteration cap reached");
        }
        break;
    }

    // Completion races barge-in under the state lock: if the user already
    // interrupted, the turn loses and discards its text.
    if !settle_active(&ctx.state) {
        debug!(partial = %final_text, "interrupted at completion boundary");
        return TurnOutcome::Interrupted;
    }

    if !final_text.is_empty() {
        ctx.context.push_assistant(MessageContent::Text(final_text));
    }
    info!(messages = ctx.context.len(), "turn complete");

    spawn_turn_followups(ctx, transcript);
    TurnOutcome::Completed
}

/// Append the assistant's tool_use message and every tool result, then
/// apply the `ToolIteration` transition.
async fn run_tool_iteration(ctx: &TurnContext, produced: &ProducerOutput) {
    let mut blocks = Vec::new();
    if !produced.text.is_empty() {
        blocks.push(ContentBlock::Text {
            text: produced.text.clone(),
        });
    }
    for call in &produced.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }
    ctx.context.push_assistant(MessageContent::Blocks(blocks));

    for call in &produced.tool_calls {
        let output = ctx.llm.execute_tool(call).await;
        if output.is_error {
            warn!(tool = %call.name, "tool returned an error object");
        }
        ctx.context
            .push_tool_result(output.tool_use_id, output.content, output.is_error);
    }

    if let Ok(mut state) = ctx.state.lock() {
        match state.state() {
            ConversationState::Processing | ConversationState::Speaking => {
                let _ = state.apply(StateEvent::ToolIteration);
            }
            other => debug!(state = other.as_str(), "tool iteration in unexpected state"),
        }
    }
}

/// Collaborator failure mid-turn: speak the apology and settle in
/// `Active`. The user's next utterance proceeds normally. The apology is
/// interruptible like any other playback; barge-in during it unwinds the
/// turn instead of degrading it.
async fn degrade(ctx: &TurnContext, err: VoiceError, cancel: &CancellationToken) -> TurnOutcome {
    if matches!(err, VoiceError::Cancelled) {
        return TurnOutcome::Interrupted;
    }
    if !speak_apology(ctx, cancel).await {
        debug!("apology interrupted");
        return TurnOutcome::Interrupted;
    }
    settle_active(&ctx.state);
    TurnOutcome::Failed
}

/// Speak the apology line. Returns false when barge-in cancelled the
/// playback; the sink is already killed in that case.
async fn speak_apology(ctx: &TurnContext, cancel: &CancellationToken) -> bool {
    let text = ctx.limits.apology_text.clone();
    if text.is_empty() {
        return true;
    }
    let mut pcm = match ctx.tts.stream(&text).await {
        Ok(s) => s,
        Err(e) => {
            warn!("apology TTS unavailable: {e}");
            return true;
        }
    };

    let mut player = ctx.player.lock().await;
    if player.start().await.is_err() {
        return true;
    }
    mark_tts_started(&ctx.state);
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                let _ = player.kill().await;
                return false;
            }
            frame = pcm.next() => frame,
        };
        match frame {
            None => break,
            Some(Ok(bytes)) => {
                if player.play(&bytes).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("apology stream failed: {e}");
                break;
            }
        }
    }

    let finished = tokio::select! {
        () = cancel.cancelled() => false,
        result = player.finish() => {
            if let Err(e) = result {
                warn!("apology drain failed: {e}");
            }
            true
        }
    };
    if !finished {
        let _ = player.kill().await;
        return false;
    }
    true
}

/// Post-turn background work: archive the log, extract memories, refresh
/// the retrieved-context block. All through the registry, all best-effort.
fn spawn_turn_followups(ctx: &TurnContext, user_text: String) {
    let messages = ctx.context.messages();
    let logger = Arc::clone(&ctx.logger);
    let log_snapshot = messages.clone();
    ctx.registry.spawn_detached("conversation-log", async move {
        // Archive this turn only: everything from the last user message.
        let start = log_snapshot
            .iter()
            .rposition(|m| m.role == crate::context::Role::User)
            .unwrap_or(0);
        if let Err(e) = logger.append(&log_snapshot[start..]) {
            warn!("conversation archive failed: {e}");
        }
    });

    let memory = Arc::clone(&ctx.memory);
    let context = Arc::clone(&ctx.context);
    ctx.registry.spawn_detached("memory-extract", async move {
        crate::memory::extract_quietly(&*memory, &messages).await;
        match memory.pre_load(&user_text).await {
            Ok(retrieved) if !retrieved.is_empty() => context.update_retrieved(retrieved),
            Ok(_) => {}
            Err(e) => debug!("retrieved-context refresh failed: {e}"),
        }
    });
}

/// `Processing -> Speaking` exactly once, the moment the first PCM frame
/// exists.
fn mark_tts_started(state: &Arc<Mutex<StateMachine>>) {
    if let Ok(mut state) = state.lock()
        && state.state() == ConversationState::Processing
    {
        let _ = state.apply(StateEvent::TtsStarted);
    }
}

/// Settle the machine in `Active` at the turn boundary. Returns false if
/// barge-in won the race.
fn settle_active(state: &Arc<Mutex<StateMachine>>) -> bool {
    let Ok(mut state) = state.lock() else {
        return false;
    };
    // A turn with no audio (empty response, apology failure) passes
    // through Speaking so the transition table stays authoritative.
    if state.state() == ConversationState::Processing {
        let _ = state.apply(StateEvent::TtsStarted);
    }
    state.try_complete_speaking()
}

async fn produce(
    mut stream: crate::contracts::LlmStream,
    tts: Arc<dyn TtsClient>,
    staging: StagingSender,
    state: Arc<Mutex<StateMachine>>,
    cancel: CancellationToken,
    max_buffer_chars: usize,
) -> ProducerOutput {
    let mut chunker = SentenceChunker::new(max_buffer_chars);
    let mut out = ProducerOutput {
        text: String::new(),
        tool_calls: Vec::new(),
        stop: None,
        error: None,
        cancelled: false,
    };
    let mut seq: u64 = 0;
    let mut started = false;

    'stream: loop {
        let delta = tokio::select! {
            () = cancel.cancelled() => {
                out.cancelled = true;
                break 'stream;
            }
            delta = stream.next() => delta,
        };

        match delta {
            None => break,
            Some(Ok(LlmDelta::Text(fragment))) => {
                out.text.push_str(&fragment);
                for sentence in chunker.push(&fragment) {
                    seq += 1;
                    if !speak_sentence(&tts, &staging, &state, &cancel, seq, &sentence, &mut started)
                        .await
                    {
                        out.cancelled = true;
                        break 'stream;
                    }
                }
            }
            Some(Ok(LlmDelta::ToolUse(call))) => out.tool_calls.push(call),
            Some(Ok(LlmDelta::Stop(reason))) => {
                out.stop = Some(reason);
                break;
            }
            Some(Err(VoiceError::Cancelled)) => {
                out.cancelled = true;
                break;
            }
            Some(Err(e)) => {
                out.error = Some(e);
                break;
            }
        }
    }

    if !out.cancelled && out.error.is_none() {
        if let Some(rest) = chunker.flush() {
            seq += 1;
            if !speak_sentence(&tts, &staging, &state, &cancel, seq, &rest, &mut started).await {
                out.cancelled = true;
            }
        }
    }

    // Unblock the consumer regardless of how the stream ended.
    let _ = staging.send(StagedFrame::EndOfUtterance).await;
    out
}

/// Synthesize one sentence into the staging channel. Returns false on
/// cancellation. TTS failures skip the sentence and keep the turn alive.
async fn speak_sentence(
    tts: &Arc<dyn TtsClient>,
    staging: &StagingSender,
    state: &Arc<Mutex<StateMachine>>,
    cancel: &CancellationToken,
    seq: u64,
    sentence: &str,
    started: &mut bool,
) -> bool {
    let clean = sanitize_for_tts(sentence);
    if clean.is_empty() {
        return true;
    }

    let mut pcm = match tts.stream(&clean).await {
        Ok(s) => s,
        Err(e) => {
            warn!(seq, "TTS failed, skipping sentence: {e}");
            return true;
        }
    };

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return false,
            frame = pcm.next() => frame,
        };
        match frame {
            None => return true,
            Some(Ok(bytes)) => {
                if bytes.is_empty() {
                    continue;
                }
                let frame = StagedFrame::Pcm { seq, bytes };
                let send = tokio::select! {
                    () = cancel.cancelled() => return false,
                    sent = staging.send(frame) => sent,
                };
                if send.is_err() {
                    // Consumer is gone; the turn is unwinding.
                    return false;
                }
                if !*started {
                    *started = true;
                    mark_tts_started(state);
                }
            }
            Some(Err(e)) => {
                warn!(seq, "TTS stream broke mid-sentence, skipping rest: {e}");
                return true;
            }
        }
    }
}

async fn consume(
    mut staging: StagingReceiver,
    player: Arc<tokio::sync::Mutex<dyn Player>>,
    cancel: CancellationToken,
    broadcast: Option<broadcast::Sender<Bytes>>,
) -> ConsumerOutput {
    let mut out = ConsumerOutput {
        frames_played: 0,
        error: None,
        cancelled: false,
    };
    // Sentence ordinal whose player crashed; its remaining frames are
    // dropped and playback restarts on the next sentence.
    let mut dead_seq: Option<u64> = None;

    {
        let mut player = player.lock().await;
        if let Err(e) = player.start().await {
            warn!("player failed to start: {e}");
            out.error = Some(e);
            dead_seq = Some(0);
        }
    }

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                // Barge-in unwind: stop the sink, empty the queue.
                let mut player = player.lock().await;
                let _ = player.kill().await;
                let discarded = staging.drain();
                debug!(discarded, "staging drained on interrupt");
                out.cancelled = true;
                return out;
            }
            frame = staging.recv() => frame,
        };

        match frame {
            None | Some(StagedFrame::EndOfUtterance) => break,
            Some(StagedFrame::Pcm { seq, bytes }) => {
                if dead_seq == Some(seq) {
                    continue; // rest of the crashed sentence is lost
                }
                let mut p = player.lock().await;
                if dead_seq.is_some() {
                    // New sentence after a crash: restart the sink.
                    match p.start().await {
                        Ok(()) => dead_seq = None,
                        Err(e) => {
                            out.error = Some(match out.error.take() {
                                Some(prev) => prev.worse(e),
                                None => e,
                            });
                            dead_seq = Some(seq);
                            continue;
                        }
                    }
                }
                match p.play(&bytes).await {
                    Ok(()) => {
                        out.frames_played += 1;
                        if let Some(tx) = &broadcast {
                            let _ = tx.send(bytes.clone());
                        }
                    }
                    Err(e) => {
                        warn!(seq, "player failed mid-sentence: {e}");
                        let _ = p.kill().await;
                        out.error = Some(match out.error.take() {
                            Some(prev) => prev.worse(e),
                            None => e,
                        });
                        dead_seq = Some(seq);
                    }
                }
            }
        }
    }

    if dead_seq.is_none() {
        let mut player = player.lock().await;
        if let Err(e) = player.finish().await {
            warn!("player drain failed: {e}");
        }
    }
    out
}
