//! Streaming speech-to-text over a persistent WebSocket.
//!
//! The recognizer uses VAD-commit semantics: we push base64-framed PCM
//! chunks and receive `partial_transcript` events that are superseded
//! until a `committed_transcript` lands, followed by `utterance_end`.
//! The connection persists across utterances; a failed send triggers one
//! reconnect attempt before the error surfaces.

use crate::config::SttConfig;
use crate::contracts::SttClient;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{SttEvent, TranscriptEvent, TranscriptKind};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket streaming recognizer client.
pub struct WsSttClient {
    config: SttConfig,
    events: mpsc::UnboundedSender<SttEvent>,
    sink: Option<WsSink>,
    recv_task: Option<JoinHandle<()>>,
}

impl WsSttClient {
    /// Create a client. Transcript events are delivered on `events`.
    pub fn new(config: SttConfig, events: mpsc::UnboundedSender<SttEvent>) -> Self {
        Self {
            config,
            events,
            sink: None,
            recv_task: None,
        }
    }

    fn session_url(&self) -> String {
        format!(
            "{}?language={}&sample_rate=16000&api_key={}",
            self.config.url, self.config.language, self.config.api_key
        )
    }

    async fn open(&mut self) -> Result<()> {
        self.close_session().await;

        let url = self.session_url();
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::transport("stt", format!("connect failed: {e}")))?;
        info!(url = %self.config.url, "STT session opened");

        let (sink, mut stream) = socket.split();
        let events = self.events.clone();
        self.recv_task = Some(tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        if let Some(event) = parse_server_message(&text) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        debug!("STT session closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(SttEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        }));
        self.sink = Some(sink);
        Ok(())
    }

    async fn close_session(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        if let Some(task) = self.recv_task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    async fn send_audio_message(&mut self, pcm: &[u8]) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(VoiceError::transport("stt", "session not connected"));
        };
        let payload = json!({
            "type": "audio",
            "audio": BASE64.encode(pcm),
        });
        sink.send(WsMessage::text(payload.to_string()))
            .await
            .map_err(|e| VoiceError::transport("stt", format!("send failed: {e}")))
    }
}

#[async_trait]
impl SttClient for WsSttClient {
    async fn connect(&mut self) -> Result<()> {
        if self.sink.is_some() {
            return Ok(());
        }
        self.open().await
    }

    async fn send_frame(&mut self, pcm: &[u8]) -> Result<()> {
        if self.sink.is_none() {
            self.open().await?;
        }
        match self.send_audio_message(pcm).await {
            Ok(()) => Ok(()),
            Err(first) => {
                // One reconnect attempt; the session may have gone stale
                // between utterances.
                warn!("STT send failed, reconnecting: {first}");
                self.open().await?;
                self.send_audio_message(pcm).await
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.close_session().await;
        Ok(())
    }
}

/// Map one server message onto an [`SttEvent`]. Unknown types are
/// ignored so the protocol can grow.
fn parse_server_message(text: &str) -> Option<SttEvent> {
    let payload: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Some(SttEvent::Error(format!("malformed message: {e}"))),
    };
    let text_field = || payload["text"].as_str().unwrap_or_default().to_owned();

    match payload["type"].as_str()? {
        "session_started" => Some(SttEvent::SessionStarted),
        "partial_transcript" => Some(SttEvent::Transcript(TranscriptEvent {
            kind: TranscriptKind::Partial,
            text: text_field(),
        })),
        "committed_transcript" => Some(SttEvent::Transcript(TranscriptEvent {
            kind: TranscriptKind::Final,
            text: text_field(),
        })),
        "utterance_end" => Some(SttEvent::UtteranceEnd),
        "error" => Some(SttEvent::Error(
            payload["message"].as_str().unwrap_or("unknown").to_owned(),
        )),
        other => {
            debug!(kind = other, "ignoring unknown STT message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn parses_the_transcript_lifecycle() {
        assert_eq!(
            parse_server_message(r#"{"type":"session_started"}"#),
            Some(SttEvent::SessionStarted)
        );
        assert_eq!(
            parse_server_message(r#"{"type":"partial_transcript","text":"안"}"#),
            Some(SttEvent::Transcript(TranscriptEvent {
                kind: TranscriptKind::Partial,
                text: "안".into(),
            }))
        );
        assert_eq!(
            parse_server_message(r#"{"type":"committed_transcript","text":"안녕"}"#),
            Some(SttEvent::Transcript(TranscriptEvent {
                kind: TranscriptKind::Final,
                text: "안녕".into(),
            }))
        );
        assert_eq!(
            parse_server_message(r#"{"type":"utterance_end"}"#),
            Some(SttEvent::UtteranceEnd)
        );
    }

    #[test]
    fn error_and_garbage_surface_as_errors() {
        assert!(matches!(
            parse_server_message(r#"{"type":"error","message":"quota"}"#),
            Some(SttEvent::Error(m)) if m == "quota"
        ));
        assert!(matches!(
            parse_server_message("not json"),
            Some(SttEvent::Error(_))
        ));
    }

    #[test]
    fn unknown_types_are_ignored() {
        assert_eq!(parse_server_message(r#"{"type":"metadata","x":1}"#), None);
        assert_eq!(parse_server_message(r#"{"no_type":true}"#), None);
    }

    #[test]
    fn session_url_carries_language() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = WsSttClient::new(
            SttConfig {
                url: "wss://stt.example.com/v1/listen".into(),
                api_key: "k".into(),
                language: "ko".into(),
                keep_warm: true,
            },
            tx,
        );
        let url = client.session_url();
        assert!(url.starts_with("wss://stt.example.com/v1/listen?"));
        assert!(url.contains("language=ko"));
        assert!(url.contains("sample_rate=16000"));
    }

    #[tokio::test]
    async fn streams_audio_and_receives_transcripts() {
        // Tiny in-process recognizer: accepts one socket, expects an audio
        // message, answers with the commit sequence.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::text(r#"{"type":"session_started"}"#))
                .await
                .unwrap();

            let frame = loop {
                match ws.next().await.unwrap().unwrap() {
                    WsMessage::Text(t) => break t,
                    _ => continue,
                }
            };
            let payload: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(payload["type"], "audio");
            let pcm = BASE64.decode(payload["audio"].as_str().unwrap()).unwrap();
            assert_eq!(pcm, vec![1u8, 2, 3, 4]);

            ws.send(WsMessage::text(
                r#"{"type":"committed_transcript","text":"안녕"}"#,
            ))
            .await
            .unwrap();
            ws.send(WsMessage::text(r#"{"type":"utterance_end"}"#))
                .await
                .unwrap();
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut client = WsSttClient::new(
            SttConfig {
                url: format!("ws://{addr}/"),
                api_key: "k".into(),
                language: "ko".into(),
                keep_warm: true,
            },
            events_tx,
        );

        client.connect().await.unwrap();
        client.send_frame(&[1, 2, 3, 4]).await.unwrap();

        assert_eq!(events_rx.recv().await.unwrap(), SttEvent::SessionStarted);
        assert_eq!(
            events_rx.recv().await.unwrap(),
            SttEvent::Transcript(TranscriptEvent {
                kind: TranscriptKind::Final,
                text: "안녕".into(),
            })
        );
        assert_eq!(events_rx.recv().await.unwrap(), SttEvent::UtteranceEnd);

        client.disconnect().await.unwrap();
        server.await.unwrap();
    }
}
