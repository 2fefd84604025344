//! Streaming text-to-speech client.
//!
//! Text goes out in one POST per sentence; raw PCM (s16le mono at the
//! configured output rate) streams back in chunked transfer. Streams are
//! independent per sentence, so a flush only affects the active one.

use crate::config::TtsConfig;
use crate::contracts::{PcmStream, TtsClient};
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// HTTP streaming synthesizer client.
pub struct HttpTtsClient {
    http: reqwest::Client,
    config: TtsConfig,
    flushed: Arc<AtomicBool>,
}

impl HttpTtsClient {
    /// Create a client from configuration.
    pub fn new(config: TtsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            flushed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream",
            self.config.base_url, self.config.voice_id
        )
    }
}

#[async_trait]
impl TtsClient for HttpTtsClient {
    async fn stream(&self, text: &str) -> Result<PcmStream> {
        // A new sentence clears any flush from the previous one.
        self.flushed.store(false, Ordering::Relaxed);
        debug!(chars = text.chars().count(), "opening TTS stream");

        let response = self
            .http
            .post(self.stream_url())
            .header("xi-api-key", &self.config.api_key)
            .json(&json!({
                "text": text,
                "output_format": self.config.output_format,
            }))
            .send()
            .await
            .map_err(|e| VoiceError::transport("tts", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let err = if status.is_server_error() || status.as_u16() == 429 {
                VoiceError::transport("tts", format!("{status}: {detail}"))
            } else {
                VoiceError::protocol("tts", format!("{status}: {detail}"))
            };
            return Err(err);
        }

        let flushed = Arc::clone(&self.flushed);
        let stream = futures_util::stream::unfold(
            (response, flushed, false),
            |(mut response, flushed, done)| async move {
                if done || flushed.load(Ordering::Relaxed) {
                    return None;
                }
                match response.chunk().await {
                    Ok(Some(bytes)) => Some((Ok(bytes), (response, flushed, false))),
                    Ok(None) => None,
                    Err(e) => Some((
                        Err(VoiceError::transport("tts", e.to_string())),
                        (response, flushed, true),
                    )),
                }
            },
        );
        Ok(Box::pin(stream))
    }

    fn flush(&self) {
        self.flushed.store(true, Ordering::Relaxed);
    }
}
