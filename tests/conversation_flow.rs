//! End-to-end conversation scenarios against mock collaborators: a clean
//! turn, a barge-in, and a tool loop.

mod common;

use common::*;
use sori::context::Role;
use sori::contracts::{LlmDelta, StopReason, ToolCall, ToolDefinition};
use sori::pipeline::coordinator::{Collaborators, DiagnosticsHandle, Orchestrator};
use sori::pipeline::messages::{MicEvent, SttEvent, TranscriptEvent, TranscriptKind};
use sori::state::ConversationState;
use sori::{Result, Settings};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    mic: mpsc::Sender<MicEvent>,
    stt: mpsc::UnboundedSender<SttEvent>,
    diag: DiagnosticsHandle,
    context: Arc<sori::context::ContextStore>,
    shutdown: CancellationToken,
    run: JoinHandle<Result<()>>,
}

impl Harness {
    fn state(&self) -> ConversationState {
        self.diag.state.lock().unwrap().state()
    }

    async fn wait_for_state(&self, target: ConversationState) -> bool {
        wait_until(|| self.state() == target, Duration::from_secs(5)).await
    }

    async fn speak(&self, text: &str) {
        self.mic.send(MicEvent::SpeechStart).await.unwrap();
        assert!(self.wait_for_state(ConversationState::Listening).await);
        self.stt
            .send(SttEvent::Transcript(TranscriptEvent {
                kind: TranscriptKind::Final,
                text: text.to_owned(),
            }))
            .unwrap();
        self.stt.send(SttEvent::UtteranceEnd).unwrap();
    }

    async fn finish(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.run)
            .await
            .expect("run loop must stop after shutdown")
            .expect("run task must not panic")
            .expect("run must exit cleanly");
    }
}

fn tools() -> Vec<ToolDefinition> {
    vec![ToolDefinition {
        name: "get_time".into(),
        description: "Current local time.".into(),
        input_schema: serde_json::json!({"type": "object", "properties": {}}),
    }]
}

fn launch(settings: Settings, llm: MockLlm, tts: MockTts, player: MockPlayer) -> Harness {
    let (stt_tx, stt_rx) = mpsc::unbounded_channel();
    let collaborators = Collaborators {
        vad: Box::new(SilentVad),
        stt: Box::new(MockStt {
            probe: SttProbe::default(),
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
        "test persona".to_owned(),
        tools(),
    );
    let mic = orchestrator.mic_sender();
    let diag = orchestrator.diagnostics_handle();
    let context = orchestrator.context();
    let shutdown = orchestrator.shutdown_token();
    let run = tokio::spawn(orchestrator.run(None));
    Harness {
        mic,
        stt: stt_tx,
        diag,
        context,
        shutdown,
        run,
    }
}

#[tokio::test]
async fn clean_single_turn_plays_every_frame_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let llm = MockLlm::text_turn("반가워. 오늘 뭐 해?");
    let tts = MockTts::new(4);
    let tts_sentences = Arc::clone(&tts.sentences);
    let player = MockPlayer::new();
    let played = player.probe.clone();

    let h = launch(settings, llm, tts, player);
    h.speak("안녕").await;
    assert!(h.wait_for_state(ConversationState::Active).await);

    // Two sentences, four frames each, in emission order.
    let frames = played.frames.lock().unwrap().clone();
    assert_eq!(frames.len(), 8);
    let expected: Vec<Vec<u8>> = (0..2u8)
        .flat_map(|s| (0..4u8).map(move |f| vec![s, f]))
        .collect();
    let got: Vec<Vec<u8>> = frames.iter().map(|b| b.to_vec()).collect();
    assert_eq!(got, expected);

    assert_eq!(
        tts_sentences.lock().unwrap().clone(),
        vec!["반가워.".to_owned(), "오늘 뭐 해?".to_owned()]
    );

    let messages = h.context.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content.as_text(), "안녕");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content.as_text(), "반가워. 오늘 뭐 해?");

    h.finish().await;
}

#[tokio::test]
async fn barge_in_discards_partial_response() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let llm = MockLlm::text_turn("하나. 둘. 셋. 넷. 다섯. 여섯.");
    let llm_cancelled = Arc::clone(&llm.cancelled);
    let tts = MockTts::new(4);
    let tts_flushed = Arc::clone(&tts.flushed);

    let (played_tx, mut played_rx) = mpsc::unbounded_channel();
    let mut player = MockPlayer::new();
    player.frame_delay = Duration::from_millis(10);
    player.played_tx = Some(played_tx);
    let probe = player.probe.clone();

    let h = launch(settings, llm, tts, player);
    h.speak("안녕").await;

    // Interrupt right after the player has received frame 3.
    while let Some(total) = played_rx.recv().await {
        if total >= 3 {
            break;
        }
    }
    h.mic.send(MicEvent::SpeechStart).await.unwrap();

    assert!(h.wait_for_state(ConversationState::Listening).await);
    assert!(probe.kills.load(Ordering::SeqCst) >= 1, "player was killed");
    assert!(tts_flushed.load(Ordering::SeqCst), "TTS flushed");
    assert!(llm_cancelled.load(Ordering::SeqCst), "LLM cancelled");
    assert_eq!(
        h.diag.staging_gauge.load(Ordering::SeqCst),
        0,
        "staging drained"
    );
    assert!(
        probe.frames.lock().unwrap().len() < 24,
        "playback stopped early"
    );

    // The partial assistant response never reaches the context.
    let messages = h.context.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content.as_text(), "안녕");

    h.finish().await;
}

#[tokio::test]
async fn tool_loop_appends_use_result_then_answer() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let llm = MockLlm::new(vec![
        vec![
            LlmDelta::ToolUse(ToolCall {
                id: "tu_1".into(),
                name: "get_time".into(),
                input: serde_json::json!({}),
            }),
            LlmDelta::Stop(StopReason::ToolUse),
        ],
        vec![
            LlmDelta::Text("10시 반이야.".into()),
            LlmDelta::Stop(StopReason::EndTurn),
        ],
    ]);
    let executed = Arc::clone(&llm.tool_calls_executed);
    let tts = MockTts::new(4);
    let player = MockPlayer::new();
    let played = player.probe.clone();

    let h = launch(settings, llm, tts, player);
    h.speak("지금 몇 시야?").await;
    assert!(h.wait_for_state(ConversationState::Active).await);

    let calls = executed.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "get_time");

    let roles: Vec<Role> = h.context.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]
    );

    let messages = h.context.messages();
    assert_eq!(messages[3].content.as_text(), "10시 반이야.");
    assert_eq!(played.frames.lock().unwrap().len(), 4, "one spoken sentence");

    h.finish().await;
}

#[tokio::test]
async fn second_turn_reuses_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let llm = MockLlm::new(vec![
        vec![
            LlmDelta::Text("첫 번째.".into()),
            LlmDelta::Stop(StopReason::EndTurn),
        ],
        vec![
            LlmDelta::Text("두 번째.".into()),
            LlmDelta::Stop(StopReason::EndTurn),
        ],
    ]);
    let tts = MockTts::new(2);
    let player = MockPlayer::new();

    let h = launch(settings, llm, tts, player);
    h.speak("하나").await;
    assert!(h.wait_for_state(ConversationState::Active).await);

    // Speech in Active skips the wake path and opens a new turn.
    h.speak("둘").await;
    assert!(h.wait_for_state(ConversationState::Active).await);

    let messages = h.context.messages();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(messages[3].content.as_text(), "두 번째.");

    h.finish().await;
}
