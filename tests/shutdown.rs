//! Shutdown while a turn is streaming: every background task must reach a
//! terminal state before shared resources go away.

mod common;

use common::*;
use sori::contracts::{LlmDelta, StopReason};
use sori::pipeline::coordinator::{Collaborators, Orchestrator};
use sori::pipeline::messages::{MicEvent, SttEvent, TranscriptEvent, TranscriptKind};
use sori::state::ConversationState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn shutdown_mid_stream_cancels_everything() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    // A slow stream of many sentences so shutdown lands mid-generation.
    let deltas: Vec<LlmDelta> = (0..50)
        .map(|i| LlmDelta::Text(format!("문장 {i}. ")))
        .chain([LlmDelta::Stop(StopReason::EndTurn)])
        .collect();
    let llm = MockLlm::new(vec![deltas]).with_delay(Duration::from_millis(20));
    let llm_cancelled = Arc::clone(&llm.cancelled);

    let tts = MockTts::new(2);
    let player = MockPlayer::new();
    let player_probe = player.probe.clone();
    let stt_probe = SttProbe::default();
    let memory = MockMemory::new();
    let memory_torn_down = Arc::clone(&memory.torn_down);
    let memory_used_late = Arc::clone(&memory.used_after_teardown);

    let (stt_tx, stt_rx) = mpsc::unbounded_channel();
    let collaborators = Collaborators {
        vad: Box::new(SilentVad),
        stt: Box::new(MockStt {
            probe: stt_probe.clone(),
        }),
        llm: Arc::new(llm),
        tts: Arc::new(tts),
        player: Arc::new(tokio::sync::Mutex::new(player)),
        memory: Arc::new(memory),
    };
    let orchestrator = Orchestrator::new(
        settings,
        collaborators,
        stt_rx,
        "persona".to_owned(),
        Vec::new(),
    );
    let mic = orchestrator.mic_sender();
    let diag = orchestrator.diagnostics_handle();
    let registry = orchestrator.registry();
    let shutdown = orchestrator.shutdown_token();
    let run = tokio::spawn(orchestrator.run(None));

    // Start a turn and let the stream produce some audio.
    mic.send(MicEvent::SpeechStart).await.unwrap();
    assert!(
        wait_until(
            || diag.state.lock().unwrap().state() == ConversationState::Listening,
            Duration::from_secs(2),
        )
        .await
    );
    stt_tx
        .send(SttEvent::Transcript(TranscriptEvent {
            kind: TranscriptKind::Final,
            text: "계속 말해줘".into(),
        }))
        .unwrap();
    stt_tx.send(SttEvent::UtteranceEnd).unwrap();

    assert!(
        wait_until(
            || !player_probe.frames.lock().unwrap().is_empty(),
            Duration::from_secs(2),
        )
        .await,
        "turn must be audibly in flight before shutdown"
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_millis(500), run)
        .await
        .expect("shutdown must complete promptly")
        .expect("run task must not panic")
        .expect("run must exit cleanly");

    // Registry fully reaped; the torn-down memory store is never touched
    // again.
    assert_eq!(registry.count(), 0);
    memory_torn_down.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!memory_used_late.load(Ordering::SeqCst));

    assert!(llm_cancelled.load(Ordering::SeqCst), "stream cancelled");
    assert!(stt_probe.disconnects.load(Ordering::SeqCst) >= 1, "STT closed");
    assert!(player_probe.kills.load(Ordering::SeqCst) >= 1, "sink killed");
}
