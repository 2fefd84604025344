//! Speaker playback via cpal, implementing the [`Player`] contract.
//!
//! A persistent output stream pulls from a shared sample queue so playback
//! can be cut instantly on barge-in: `kill` clears the queue, `finish`
//! waits until the queue actually drains.

use crate::config::AudioConfig;
use crate::contracts::Player;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Playback lifecycle events emitted from the audio callback thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackEvent {
    /// The queue drained after `finish` was requested.
    Finished,
}

struct SharedQueue {
    samples: VecDeque<f32>,
    /// When set, the callback emits `Finished` the first time the queue
    /// drains.
    final_pending: bool,
}

/// cpal-backed implementation of the [`Player`] contract.
pub struct CpalPlayer {
    config: AudioConfig,
    shared: Arc<Mutex<SharedQueue>>,
    failed: Arc<AtomicBool>,
    stream: Option<cpal::Stream>,
    stream_config: Option<StreamConfig>,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
    event_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl CpalPlayer {
    /// Create a player. The output stream is built lazily by
    /// [`Player::start`].
    pub fn new(config: AudioConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared: Arc::new(Mutex::new(SharedQueue {
                samples: VecDeque::new(),
                final_pending: false,
            })),
            failed: Arc::new(AtomicBool::new(false)),
            stream: None,
            stream_config: None,
            event_tx,
            event_rx,
        }
    }

    fn build_stream(&mut self) -> Result<()> {
        let host = cpal::default_host();
        let device = if let Some(ref name) = self.config.output_device {
            let found = host
                .output_devices()
                .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false));
            match found {
                Some(d) => d,
                None => {
                    warn!("output device '{name}' not found, using default");
                    host.default_output_device()
                        .ok_or_else(|| VoiceError::Audio("no default output device".into()))?
                }
            }
        } else {
            host.default_output_device()
                .ok_or_else(|| VoiceError::Audio("no default output device".into()))?
        };

        let default_config = device
            .default_output_config()
            .map_err(|e| VoiceError::Audio(format!("no default output config: {e}")))?
            .config();
        let stream_config = StreamConfig {
            channels: default_config.channels,
            sample_rate: default_config.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        let failed = Arc::clone(&self.failed);
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut should_finish = false;
                    {
                        let Ok(mut q) = shared.lock() else {
                            data.fill(0.0);
                            return;
                        };
                        for out in data.iter_mut() {
                            *out = q.samples.pop_front().unwrap_or(0.0);
                        }
                        if q.samples.is_empty() && q.final_pending {
                            q.final_pending = false;
                            should_finish = true;
                        }
                    }
                    if should_finish {
                        let _ = event_tx.send(PlaybackEvent::Finished);
                    }
                },
                {
                    let failed = Arc::clone(&failed);
                    move |err| {
                        error!("audio output stream error: {err}");
                        failed.store(true, Ordering::Relaxed);
                    }
                },
                None,
            )
            .map_err(|e| VoiceError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("failed to start output stream: {e}")))?;

        info!(
            "speaker output started: {}Hz, {} channels",
            stream_config.sample_rate.0, stream_config.channels
        );
        self.failed.store(false, Ordering::Relaxed);
        self.stream = Some(stream);
        self.stream_config = Some(stream_config);
        Ok(())
    }

    fn drain_stale_events(&mut self) {
        while self.event_rx.try_recv().is_ok() {}
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.name().ok())
            .collect())
    }
}

#[async_trait]
impl Player for CpalPlayer {
    async fn start(&mut self) -> Result<()> {
        if self.stream.is_none() || self.failed.load(Ordering::Relaxed) {
            self.stream = None;
            self.build_stream()?;
        }
        self.drain_stale_events();
        if let Ok(mut q) = self.shared.lock() {
            q.final_pending = false;
        }
        Ok(())
    }

    async fn play(&mut self, pcm: &[u8]) -> Result<()> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(VoiceError::Audio("output stream failed".into()));
        }
        let Some(stream_config) = self.stream_config.as_ref() else {
            return Err(VoiceError::Audio("player not started".into()));
        };

        let samples = s16le_to_f32(pcm);
        let samples = resample_linear(
            &samples,
            self.config.output_sample_rate,
            stream_config.sample_rate.0,
        );

        let channels = stream_config.channels as usize;
        let mut q = self
            .shared
            .lock()
            .map_err(|_| VoiceError::Audio("playback queue lock poisoned".into()))?;
        if channels > 1 {
            for s in samples {
                for _ in 0..channels {
                    q.samples.push_back(s);
                }
            }
        } else {
            q.samples.extend(samples);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let already_empty = {
            let mut q = self
                .shared
                .lock()
                .map_err(|_| VoiceError::Audio("playback queue lock poisoned".into()))?;
            if q.samples.is_empty() {
                true
            } else {
                q.final_pending = true;
                false
            }
        };
        if already_empty {
            return Ok(());
        }

        // Wait for the callback to observe the drain.
        let _ = self.event_rx.recv().await;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if let Ok(mut q) = self.shared.lock() {
            q.samples.clear();
            q.final_pending = false;
        }
        self.drain_stale_events();
        Ok(())
    }
}

fn s16le_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((samples.len() as f64 / ratio).max(1.0)) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };
        output.push(sample as f32);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s16le_decodes_full_scale() {
        let bytes = [0x00, 0x00, 0xFF, 0x7F, 0x00, 0x80];
        let samples = s16le_to_f32(&bytes);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 0.99997).abs() < 1e-4);
        assert!((samples[2] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn resample_upsamples_24k_to_48k() {
        let input = vec![0.0, 1.0];
        let out = resample_linear(&input, 24_000, 48_000);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6, "midpoint interpolated");
    }

    #[test]
    fn resample_identity() {
        let input = vec![0.5, -0.5];
        assert_eq!(resample_linear(&input, 24_000, 24_000), input);
    }
}
