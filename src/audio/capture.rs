//! Microphone capture using cpal.
//!
//! Captures at the device's native rate, downsamples to the pipeline's
//! input rate, and hands out fixed-size s16le frames. The frame handler
//! runs on the audio callback thread and must never block; everything it
//! forwards crosses into the async world through a bounded `try_send`.

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Handler invoked with each complete input frame (s16le mono bytes).
pub type FrameHandler = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Microphone capture from the system input device.
pub struct MicCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    frame_samples: usize,
}

impl MicCapture {
    /// Select the input device (by index when configured, default
    /// otherwise) and record its native stream configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable input device exists — fatal at
    /// startup per the exit-code contract.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(index) = config.mic_device_index {
            host.input_devices()
                .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?
                .nth(index)
                .ok_or_else(|| VoiceError::Audio(format!("input device #{index} not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| VoiceError::Audio("no default input device".into()))?
        };

        let device_name = device.name().unwrap_or_else(|_| "<unknown>".into());

        let default_config = device
            .default_input_config()
            .map_err(|e| VoiceError::Audio(format!("no default input config: {e}")))?;
        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "using input device: {device_name} ({}Hz, {} channels)",
            stream_config.sample_rate.0, stream_config.channels
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.input_sample_rate,
            frame_samples: config.frame_samples,
        })
    }

    /// Run the capture loop until cancelled, invoking the handler with
    /// each complete frame on the audio thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the input stream cannot be created or started.
    pub async fn run(&self, mut handler: FrameHandler, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate.0;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let frame_samples = self.frame_samples;
        let mut framer = Framer::new(frame_samples);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        downsample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };
                    for frame in framer.push(&samples) {
                        handler(&frame);
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| VoiceError::Audio(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("failed to start input stream: {e}")))?;

        info!("microphone capture started: {native_rate}Hz -> {target_rate}Hz, frame {frame_samples} samples");

        cancel.cancelled().await;
        drop(stream);
        info!("microphone capture stopped");
        Ok(())
    }

    /// List available input devices in index order.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.name().ok())
            .collect())
    }
}

/// Accumulates samples into fixed-size s16le frames.
struct Framer {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl Framer {
    fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            let frame = std::mem::replace(&mut self.pending, rest);
            frames.push(to_s16le(&frame));
        }
        frames
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation downsampler. Sufficient for speech: energy sits
/// below 8kHz, so no anti-alias filter is needed for 48kHz -> 16kHz.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
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

fn to_s16le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_emits_fixed_size_frames() {
        let mut framer = Framer::new(4);
        assert!(framer.push(&[0.0; 3]).is_empty());
        let frames = framer.push(&[0.0; 6]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 8), "4 samples x 2 bytes");
        assert_eq!(framer.pending.len(), 1);
    }

    #[test]
    fn s16le_conversion_clamps() {
        let bytes = to_s16le(&[0.0, 1.0, -1.0, 2.0]);
        let s = |i: usize| i16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        assert_eq!(s(0), 0);
        assert_eq!(s(1), 32767);
        assert_eq!(s(2), -32767);
        assert_eq!(s(3), 32767, "out-of-range input clamps");
    }

    #[test]
    fn stereo_averages_to_mono() {
        let mono = to_mono(&[0.2, 0.4, -0.5, 0.5], 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
    }

    #[test]
    fn downsample_halves_length() {
        let input: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let out = downsample(&input, 48_000, 16_000);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn downsample_identity_when_rates_match() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(downsample(&input, 16_000, 16_000), input);
    }
}
