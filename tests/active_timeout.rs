//! The ACTIVE window: after a turn completes, silence returns the session
//! to IDLE and the configured STT policy is applied.

mod common;

use common::*;
use sori::pipeline::coordinator::{Collaborators, Orchestrator};
use sori::pipeline::messages::{MicEvent, SttEvent, TranscriptEvent, TranscriptKind};
use sori::state::ConversationState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;

async fn run_timeout_scenario(keep_warm: bool) -> (usize, bool) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.stt.keep_warm = keep_warm;

    let llm = MockLlm::text_turn("잘 자.");
    let tts = MockTts::new(1);
    let player = MockPlayer::new();
    let stt_probe = SttProbe::default();

    let (stt_tx, stt_rx) = mpsc::unbounded_channel();
    let collaborators = Collaborators {
        vad: Box::new(SilentVad),
        stt: Box::new(MockStt {
            probe: stt_probe.clone(),
        }),
        llm: Arc::new(llm),
        tts: Arc::new(tts),
        player: Arc::new(tokio::sync::Mutex::new(player)),
        memory: Arc::new(MockMemory::new()),
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
    let shutdown = orchestrator.shutdown_token();
    let run = tokio::spawn(orchestrator.run(None));

    mic.send(MicEvent::SpeechStart).await.unwrap();
    assert!(
        wait_until(
            || diag.state.lock().unwrap().state() == ConversationState::Listening,
            Duration::from_secs(5),
        )
        .await
    );
    stt_tx
        .send(SttEvent::Transcript(TranscriptEvent {
            kind: TranscriptKind::Final,
            text: "잘 자".into(),
        }))
        .unwrap();
    stt_tx.send(SttEvent::UtteranceEnd).unwrap();

    assert!(
        wait_until(
            || diag.state.lock().unwrap().state() == ConversationState::Active,
            Duration::from_secs(5),
        )
        .await,
        "turn must settle in Active"
    );

    // 30 seconds of silence (virtual clock).
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(
        wait_until(
            || diag.state.lock().unwrap().state() == ConversationState::Idle,
            Duration::from_secs(5),
        )
        .await,
        "active window must elapse into Idle"
    );

    let disconnects = stt_probe.disconnects.load(Ordering::SeqCst);

    shutdown.cancel();
    let clean = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("shutdown must complete")
        .expect("run task must not panic")
        .is_ok();
    (disconnects, clean)
}

#[tokio::test(start_paused = true)]
async fn active_timeout_idles_and_closes_stt() {
    let (disconnects, clean) = run_timeout_scenario(false).await;
    assert!(disconnects >= 1, "keep_warm=false closes the recognizer");
    assert!(clean);
}

#[tokio::test(start_paused = true)]
async fn active_timeout_keeps_stt_warm_when_configured() {
    let (disconnects_before_shutdown, clean) = run_timeout_scenario(true).await;
    assert_eq!(
        disconnects_before_shutdown, 0,
        "keep_warm=true leaves the session open until shutdown"
    );
    assert!(clean);
}
