//! Energy-based voice activity detection.
//!
//! RMS energy thresholding with hysteresis on both edges: speech is
//! reported only after a sustained supra-threshold run, and released only
//! after a sustained sub-threshold run. This keeps single noisy frames
//! from toggling the conversation state.

use crate::config::VadConfig;
use crate::contracts::VoiceDetector;

/// RMS-energy detector with two-sided hysteresis.
pub struct EnergyVad {
    speech_frames: u32,
    release_frames: u32,
    supra_run: u32,
    sub_run: u32,
    in_speech: bool,
}

impl EnergyVad {
    /// Create a detector from the VAD configuration.
    pub fn new(config: &VadConfig) -> Self {
        Self {
            speech_frames: config.speech_frames.max(1),
            release_frames: config.release_frames.max(1),
            supra_run: 0,
            sub_run: 0,
            in_speech: false,
        }
    }
}

impl VoiceDetector for EnergyVad {
    fn is_speech(&mut self, pcm: &[u8], threshold: f32) -> bool {
        let energy = rms_energy(pcm);

        if energy >= threshold {
            self.supra_run = self.supra_run.saturating_add(1);
            self.sub_run = 0;
            if !self.in_speech && self.supra_run >= self.speech_frames {
                self.in_speech = true;
            }
        } else {
            self.sub_run = self.sub_run.saturating_add(1);
            self.supra_run = 0;
            if self.in_speech && self.sub_run >= self.release_frames {
                self.in_speech = false;
            }
        }

        self.in_speech
    }

    fn reset(&mut self) {
        self.supra_run = 0;
        self.sub_run = 0;
        self.in_speech = false;
    }
}

/// Normalized RMS energy of an s16le mono frame, in `[0, 1]`.
fn rms_energy(pcm: &[u8]) -> f32 {
    if pcm.len() < 2 {
        return 0.0;
    }
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;
    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64 / 32768.0;
        sum_sq += sample * sample;
        count += 1;
    }
    ((sum_sq / count as f64).sqrt()) as f32
}
